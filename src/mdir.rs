//! Metadata-pair log: fetch, commit, compact, split -- spec.md §4.3. This
//! is the largest subsystem in the engine: every directory entry, file
//! attribute, and gstate delta is a tag inside one of these logs.
//!
//! No teacher equivalent exists at this granularity (ext2 directories are
//! fixed-size entry arrays, not an append-only checksummed log); grounded
//! directly in spec.md §4.3 and §6.2, reusing `crate::tag` for the wire
//! format and the teacher's habit (`disk_driver::cache::CacheManager`,
//! `rfs_lib::mod::RFS::read_data`/`write_data`) of routing every byte
//! through one cached-device chokepoint.

use crate::alloc::Allocator;
use crate::cache::CachedDevice;
use crate::error::{Error, Result};
use crate::gstate::GState;
use crate::tag::Tag;
use crate::util::{crc32, fromle32, scmp, tole32, CRC_INIT};
use block_device::BlockDevice;

/// The metadata-pair holding the superblock and the root directory's own
/// entries (spec.md §3: "the superblock pair is also where the root
/// directory's entries live"). Defined here (rather than in `fs.rs`) so
/// `compact`'s wear-relocation/expansion heuristic can recognize it without
/// a dependency on the mount module.
pub const SUPERBLOCK_PAIR: [u32; 2] = [0, 1];

/// Staged attribute: a tag plus its payload, not yet written to disk.
#[derive(Debug, Clone)]
pub struct Attr {
    pub tag: Tag,
    pub data: Vec<u8>,
}

impl Attr {
    pub fn new(tag: Tag, data: Vec<u8>) -> Self {
        Self { tag, data }
    }
}

/// In-memory view of one metadata pair after a successful fetch:
/// spec.md §4.3.1's `off`, `etag`, `count`, `tail`, `split`, `erased`.
#[derive(Debug, Clone)]
pub struct MDir {
    pub pair: [u32; 2],
    pub rev: u32,
    /// Byte offset just past the last validated commit.
    pub off: u32,
    /// Last tag value (pre-XOR) of the winning commit; the XOR-chain seed
    /// for the next appended tag.
    pub etag: u32,
    /// One past the highest live id in this MDIR.
    pub count: u16,
    pub tail: Option<[u32; 2]>,
    pub split: bool,
    /// Whether `off` sits exactly at an erased boundary (no torn bytes
    /// beyond it) -- commit must force compaction if not.
    pub erased: bool,
    pub gdelta: GState,
}

impl MDir {
    fn empty(pair: [u32; 2]) -> Self {
        Self {
            pair,
            rev: 0,
            off: 4,
            etag: 0,
            count: 0,
            tail: None,
            split: false,
            erased: true,
            gdelta: GState::ZERO,
        }
    }
}

/// Crc-commit-relative cursor used while scanning a block's tag stream.
struct Scan {
    off: u32,
    etag: u32,
    crc: u32,
    crc_start: u32,
}

fn read_rev<D: BlockDevice>(cd: &mut CachedDevice<D>, block: u32) -> Result<u32> {
    let mut buf = [0u8; 4];
    cd.read(4, block, 0, &mut buf)?;
    Ok(fromle32(&buf))
}

/// Scans one block's tag stream starting at `scan.off`, advancing past
/// every validated commit, accumulating the rolling CRC and invoking
/// `on_tag(tag, payload, block)` for each live (non-CRC) tag seen.
/// Stops at the first torn/unterminated commit.
fn scan_block<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    block: u32,
    mut on_tag: impl FnMut(Tag, &[u8]),
) -> Result<(u32, u32, u16)> {
    let block_size = cd.geometry().block_size;
    let mut scan = Scan {
        off: 4,
        etag: 0,
        crc: CRC_INIT,
        crc_start: 4,
    };
    let mut committed = (4u32, 0u32, 0u16);
    let mut count: u16 = 0;
    let mut rev_buf = [0u8; 4];
    cd.read(4, block, 0, &mut rev_buf)?;
    scan.crc = crc32(scan.crc, &rev_buf);

    while scan.off + 4 <= block_size {
        let mut raw = [0u8; 4];
        cd.read(4, block, scan.off, &mut raw)?;
        // Tags are big-endian on the wire (spec.md §6.2), XOR-chained
        // against the previous tag.
        let word = u32::from_be_bytes(raw) ^ scan.etag;
        let tag = Tag::decode(word);
        scan.crc = crc32(scan.crc, &raw);
        scan.off += 4;

        if let Some(t1) = tag.type1_enum() {
            if t1 == crate::tag::Type1::Crc {
                let mut crc_buf = [0u8; 4];
                if scan.off + 4 > block_size {
                    break;
                }
                cd.read(4, block, scan.off, &mut crc_buf)?;
                let expected = fromle32(&crc_buf);
                scan.crc = crc32(scan.crc, &crc_buf);
                scan.off += 4;
                // CRC covers everything from crc_start up to and
                // including the CRC tag itself, so recompute excluding
                // the trailing crc_buf word we just folded in.
                let expected_crc = expected;
                let actual = crc_payload(cd, block, scan.crc_start, scan.off - 4)?;
                if actual != expected_crc {
                    break;
                }
                committed = (scan.off, scan.etag, count);
                scan.crc_start = scan.off;
                scan.crc = CRC_INIT;
                scan.etag = word;
                continue;
            }
        }

        let mut payload = vec![0u8; tag.size as usize];
        if !payload.is_empty() {
            cd.read(4, block, scan.off, &mut payload)?;
            scan.crc = crc32(scan.crc, &payload);
        }
        scan.off += tag.size as u32;
        scan.etag = word;
        if tag.id as u32 + 1 > count as u32 {
            count = (tag.id + 1).min(0x3ff);
        }
        on_tag(tag, &payload);
    }

    Ok(committed)
}

fn crc_payload<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    block: u32,
    start: u32,
    end: u32,
) -> Result<u32> {
    let mut crc = CRC_INIT;
    let mut off = start;
    let mut buf = vec![0u8; 64];
    while off < end {
        let n = (end - off).min(buf.len() as u32) as usize;
        cd.read(4, block, off, &mut buf[..n])?;
        crc = crc32(crc, &buf[..n]);
        off += n as u32;
    }
    Ok(crc)
}

/// spec.md §4.3.1: pick the winning block of `pair` by revision count,
/// scan its committed tags, and evaluate `matcher` over each one,
/// returning the last tag it accepted.
pub fn fetch<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    pair: [u32; 2],
    mut matcher: impl FnMut(Tag, &[u8]) -> bool,
) -> Result<(MDir, Option<(Tag, Vec<u8>)>)> {
    let rev0 = read_rev(cd, pair[0]);
    let rev1 = read_rev(cd, pair[1]);

    let order: [usize; 2] = match (rev0, rev1) {
        (Ok(a), Ok(b)) => {
            if scmp(a, b) == std::cmp::Ordering::Less {
                [1, 0]
            } else {
                [0, 1]
            }
        }
        (Ok(_), Err(_)) => [0, 1],
        (Err(_), Ok(_)) => [1, 0],
        (Err(_), Err(_)) => return Err(Error::Corrupt),
    };

    let mut last_match: Option<(Tag, Vec<u8>)> = None;
    let mut tail = None;
    let mut split = false;

    for &idx in &order {
        let block = pair[idx];
        last_match = None;
        tail = None;
        split = false;
        let mut found_any = false;
        let result = scan_block(cd, block, |tag, data| {
            found_any = true;
            if let Some(t1) = tag.type1_enum() {
                if t1 == crate::tag::Type1::Tail {
                    let a = fromle32(&data[0..4.min(data.len())]);
                    let b = if data.len() >= 8 {
                        fromle32(&data[4..8])
                    } else {
                        0
                    };
                    tail = Some([a, b]);
                    split = tag.chunk == crate::tag::chunk::tail::HARD;
                }
            }
            if matcher(tag, data) {
                last_match = Some((tag, data.to_vec()));
            }
        });

        match result {
            Ok((off, etag, count)) if found_any || off > 4 => {
                let rev = if idx == 0 {
                    rev0.unwrap_or(0)
                } else {
                    rev1.unwrap_or(0)
                };
                let erased = off % cd.geometry().prog_size == 0;
                return Ok((
                    MDir {
                        pair,
                        rev,
                        off,
                        etag,
                        count,
                        tail,
                        split,
                        erased,
                        gdelta: GState::ZERO,
                    },
                    last_match,
                ));
            }
            _ => continue,
        }
    }

    // Neither block held a validated commit: treat as a freshly erased,
    // empty pair (format's initial state) rather than CORRUPT, since an
    // all-erased pair is indistinguishable from "never committed".
    Ok((MDir::empty(pair), None))
}

/// spec.md §4.3.2: append `attrs` plus the accumulated gstate delta and a
/// terminating CRC, falling back to compaction when the block can't take
/// the commit as-is.
pub fn commit<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
    mdir: &mut MDir,
    attrs: &[Attr],
    gdelta: GState,
    block_cycles: u32,
) -> Result<()> {
    if !mdir.erased || mdir.count as u32 + attrs.len() as u32 >= 1022 {
        return compact(cd, alloc, traverse, mdir, attrs, gdelta, block_cycles);
    }

    let active = mdir.pair[0];
    let mut etag = mdir.etag;
    let mut off = mdir.off;
    let block_size = cd.geometry().block_size;
    let prog_size = cd.geometry().prog_size;

    for attr in attrs {
        let word = attr.tag.encode() ^ etag;
        let raw = word.to_be_bytes();
        if off as u64 + 4 + attr.data.len() as u64 > block_size as u64 {
            return compact(cd, alloc, traverse, mdir, attrs, gdelta, block_cycles);
        }
        cd.prog(active, off, &raw, false)?;
        off += 4;
        if !attr.data.is_empty() {
            cd.prog(active, off, &attr.data, false)?;
            off += attr.data.len() as u32;
        }
        etag = word;
        if attr.tag.id as u32 + 1 > mdir.count as u32 {
            mdir.count = attr.tag.id + 1;
        }
    }

    if !gdelta.is_zero() {
        let tag = crate::tag::Tag::new(crate::tag::Type1::MoveState as u8, 0, crate::tag::ID_NONE, 12);
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&tole32(gdelta.tag));
        payload.extend_from_slice(&tole32(gdelta.pair[0]));
        payload.extend_from_slice(&tole32(gdelta.pair[1]));
        let word = tag.encode() ^ etag;
        cd.prog(active, off, &word.to_be_bytes(), false)?;
        off += 4;
        cd.prog(active, off, &payload, false)?;
        off += 12;
        etag = word;
    }

    let padded_off = crate::util::alignup(off, prog_size);
    let pad = (padded_off - off) as usize;
    if pad > 0 {
        cd.prog(active, off, &vec![0xffu8; pad], false)?;
        off = padded_off;
    }

    let next_erase_hint = 1u8;
    let crc_tag = crate::tag::Tag::new(crate::tag::Type1::Crc as u8, next_erase_hint, 0, 4);
    let crc_word = crc_tag.encode() ^ etag;
    let crc_start = mdir.off;

    let running = crc32(
        crc_payload(cd, active, crc_start, off)?,
        &crc_word.to_be_bytes(),
    );

    cd.prog(active, off, &crc_word.to_be_bytes(), false)?;
    off += 4;
    cd.prog(active, off, &tole32(running), false)?;
    off += 4;

    cd.sync(true)?;

    mdir.off = off;
    mdir.etag = crc_word;
    mdir.erased = off % prog_size == 0;
    mdir.gdelta = GState::ZERO;
    Ok(())
}

fn estimated_commit_size(live: &[(u8, u8, u16, Attr)]) -> u32 {
    live.iter().map(|(_, _, _, a)| 4 + a.data.len() as u32).sum()
}

/// Writes a brand-new metadata block from scratch: revision word, `attrs`
/// in order, an optional TAIL, and a terminating CRC commit. Used by
/// `compact`'s split path to populate the freshly allocated upper-half
/// pair; unlike `compact` itself this never touches an existing pair.
fn write_fresh_block<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    block: u32,
    attrs: &[(u8, u8, u16, Attr)],
    tail: Option<[u32; 2]>,
    split: bool,
) -> Result<()> {
    cd.prog(block, 0, &tole32(0), false)?;
    let mut off = 4u32;
    let mut etag = 0u32;
    for (_, _, _, attr) in attrs {
        let word = attr.tag.encode() ^ etag;
        cd.prog(block, off, &word.to_be_bytes(), false)?;
        off += 4;
        if !attr.data.is_empty() {
            cd.prog(block, off, &attr.data, false)?;
            off += attr.data.len() as u32;
        }
        etag = word;
    }
    if let Some(t) = tail {
        let chunk = if split {
            crate::tag::chunk::tail::HARD
        } else {
            crate::tag::chunk::tail::SOFT
        };
        let tag = Tag::new(crate::tag::Type1::Tail as u8, chunk, crate::tag::ID_NONE, 8);
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&tole32(t[0]));
        payload.extend_from_slice(&tole32(t[1]));
        let word = tag.encode() ^ etag;
        cd.prog(block, off, &word.to_be_bytes(), false)?;
        off += 4;
        cd.prog(block, off, &payload, false)?;
        off += 8;
        etag = word;
    }
    let prog_size = cd.geometry().prog_size;
    let padded = crate::util::alignup(off, prog_size);
    if padded > off {
        cd.prog(block, off, &vec![0xffu8; (padded - off) as usize], false)?;
        off = padded;
    }
    let crc_tag = Tag::new(crate::tag::Type1::Crc as u8, 1, 0, 4);
    let crc_word = crc_tag.encode() ^ etag;
    let crc = crc_payload(cd, block, 0, off)?;
    let crc = crc32(crc, &crc_word.to_be_bytes());
    cd.prog(block, off, &crc_word.to_be_bytes(), false)?;
    off += 4;
    cd.prog(block, off, &tole32(crc), false)?;
    cd.sync(true)?;
    Ok(())
}

/// spec.md §4.3.3/§4.3.4: rewrite the pair's other block from scratch,
/// folding in `attrs` and `gdelta`, deduplicating by `(type1, chunk, id)` so
/// only the latest value per key survives and DELETEs cancel earlier
/// CREATEs. Also where wear relocation, superblock expansion, and MDIR
/// splitting are decided: all three only ever change *where* or *how many*
/// blocks the compacted content lands on, never the dedup result above.
pub fn compact<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    mut traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
    mdir: &mut MDir,
    attrs: &[Attr],
    gdelta: GState,
    block_cycles: u32,
) -> Result<()> {
    let mut live: Vec<(u8, u8, u16, Attr)> = Vec::new();
    let mut deleted: std::collections::HashSet<(u8, u8, u16)> = std::collections::HashSet::new();

    // Existing entries: re-fetch the active block, keeping only the
    // latest value per (type1, chunk, id), newest first so later SPLICE
    // DELETEs mask earlier CREATEs/attributes at the same id.
    let active = mdir.pair[0];
    let mut existing: Vec<(Tag, Vec<u8>)> = Vec::new();
    scan_block(cd, active, |tag, data| {
        existing.push((tag, data.to_vec()));
    })?;

    for attr in attrs {
        existing.push((attr.tag, attr.data.clone()));
    }

    for (tag, data) in existing {
        let key = tag.dedup_key();
        if tag.type1_enum() == Some(crate::tag::Type1::Splice)
            && tag.chunk == crate::tag::chunk::splice::DELETE
        {
            deleted.insert((key.0, crate::tag::chunk::name::REG, key.2));
            deleted.insert((key.0, crate::tag::chunk::name::DIR, key.2));
            deleted.insert((key.0, crate::tag::chunk::structure::DIR_STRUCT, key.2));
            deleted.insert((key.0, crate::tag::chunk::structure::INLINE_STRUCT, key.2));
            deleted.insert((key.0, crate::tag::chunk::structure::CTZ_STRUCT, key.2));
            continue;
        }
        if deleted.contains(&key) {
            continue;
        }
        if let Some(pos) = live.iter().position(|(t, c, i, _)| (*t, *c, *i) == key) {
            live[pos] = (key.0, key.1, key.2, Attr::new(tag, data));
        } else {
            live.push((key.0, key.1, key.2, Attr::new(tag, data)));
        }
    }

    // §4.3.4: split the MDIR in two when the compacted content wouldn't
    // fit comfortably in one block, or (§4.3.3 step 1) opportunistically
    // when this is the superblock pair and the device is under half full --
    // spreads wear off the one pair every mount touches on every write.
    let block_size = cd.geometry().block_size;
    let prog_size = cd.geometry().prog_size;
    let split_limit = (block_size.saturating_sub(36)).min(crate::util::alignup(block_size / 2, prog_size));
    let mut force_split = false;
    if mdir.pair == SUPERBLOCK_PAIR {
        let mut live_count = 0u32;
        traverse(&mut |_| live_count += 1)?;
        force_split = live_count.saturating_mul(2) < cd.geometry().block_count;
    }
    let mut ids: Vec<u16> = live.iter().map(|(_, _, id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    if (force_split || estimated_commit_size(&live) > split_limit) && ids.len() > 1 {
        let mid = ids[ids.len() / 2];
        let upper: Vec<(u8, u8, u16, Attr)> = live
            .iter()
            .filter(|(_, _, id, _)| *id >= mid)
            .cloned()
            .collect();
        let lower: Vec<(u8, u8, u16, Attr)> = live
            .into_iter()
            .filter(|(_, _, id, _)| *id < mid)
            .collect();
        if !upper.is_empty() && !lower.is_empty() {
            let new0 = alloc.alloc(&mut traverse)?;
            let new1 = alloc.alloc(&mut traverse)?;
            cd.erase(new0)?;
            write_fresh_block(cd, new0, &upper, mdir.tail, mdir.split)?;
            live = lower;
            mdir.tail = Some([new0, new1]);
            mdir.split = true;
        } else {
            live = lower.into_iter().chain(upper).collect();
        }
    }

    // Wear relocation: force a fresh block for the target every
    // `block_cycles` revisions instead of reusing the old one in place, so
    // no single physical block absorbs every erase cycle of a hot MDIR.
    let relocate = block_cycles > 0 && mdir.rev.wrapping_add(1) % (block_cycles + 1) == 0;
    let target = if relocate {
        let fresh = alloc.alloc(&mut traverse)?;
        mdir.pair[1] = fresh;
        cd.erase(fresh)?;
        fresh
    } else {
        let t = mdir.pair[1];
        cd.erase(t).or_else(|_| {
            let fresh = alloc.alloc(&mut traverse)?;
            mdir.pair[1] = fresh;
            cd.erase(fresh)
        })?;
        mdir.pair[1]
    };

    let new_rev = mdir.rev.wrapping_add(1);
    cd.prog(target, 0, &tole32(new_rev), false)?;

    let mut off = 4u32;
    let mut etag = 0u32;
    let mut count: u16 = 0;
    for (_, _, _, attr) in &live {
        let word = attr.tag.encode() ^ etag;
        cd.prog(target, off, &word.to_be_bytes(), false)?;
        off += 4;
        if !attr.data.is_empty() {
            cd.prog(target, off, &attr.data, false)?;
            off += attr.data.len() as u32;
        }
        etag = word;
        if attr.tag.id as u32 + 1 > count as u32 {
            count = attr.tag.id + 1;
        }
    }

    if let Some(tail) = mdir.tail {
        let chunk = if mdir.split {
            crate::tag::chunk::tail::HARD
        } else {
            crate::tag::chunk::tail::SOFT
        };
        let tag = crate::tag::Tag::new(crate::tag::Type1::Tail as u8, chunk, crate::tag::ID_NONE, 8);
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&tole32(tail[0]));
        payload.extend_from_slice(&tole32(tail[1]));
        let word = tag.encode() ^ etag;
        cd.prog(target, off, &word.to_be_bytes(), false)?;
        off += 4;
        cd.prog(target, off, &payload, false)?;
        off += 8;
        etag = word;
    }

    let combined_gdelta = mdir.gdelta.xor(&gdelta);
    if !combined_gdelta.is_zero() {
        let tag = crate::tag::Tag::new(crate::tag::Type1::MoveState as u8, 0, crate::tag::ID_NONE, 12);
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&tole32(combined_gdelta.tag));
        payload.extend_from_slice(&tole32(combined_gdelta.pair[0]));
        payload.extend_from_slice(&tole32(combined_gdelta.pair[1]));
        let word = tag.encode() ^ etag;
        cd.prog(target, off, &word.to_be_bytes(), false)?;
        off += 4;
        cd.prog(target, off, &payload, false)?;
        off += 12;
        etag = word;
    }

    let prog_size = cd.geometry().prog_size;
    let padded = crate::util::alignup(off, prog_size);
    if padded > off {
        cd.prog(target, off, &vec![0xffu8; (padded - off) as usize], false)?;
        off = padded;
    }

    let crc_tag = crate::tag::Tag::new(crate::tag::Type1::Crc as u8, 1, 0, 4);
    let crc_word = crc_tag.encode() ^ etag;
    let crc = crc_payload(cd, target, 0, off)?;
    let crc = crc32(crc, &crc_word.to_be_bytes());
    cd.prog(target, off, &crc_word.to_be_bytes(), false)?;
    off += 4;
    cd.prog(target, off, &tole32(crc), false)?;
    off += 4;
    cd.sync(true)?;

    mdir.pair.swap(0, 1);
    mdir.rev = new_rev;
    mdir.off = off;
    mdir.etag = crc_word;
    mdir.count = count;
    mdir.erased = off % prog_size == 0;
    mdir.gdelta = GState::ZERO;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::{ram::RamBlockDevice, Geometry};

    fn geometry() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 8,
        }
    }

    #[test]
    fn fetch_on_freshly_erased_pair_is_empty() {
        let mut cd = CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        cd.erase(0).unwrap();
        cd.erase(1).unwrap();
        cd.sync(false).unwrap();
        let (mdir, found) = fetch(&mut cd, [0, 1], |_, _| false).unwrap();
        assert_eq!(mdir.count, 0);
        assert!(found.is_none());
    }

    #[test]
    fn commit_then_fetch_recovers_tag() {
        let mut cd = CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        cd.erase(0).unwrap();
        cd.erase(1).unwrap();
        cd.sync(false).unwrap();
        let mut alloc = Allocator::new(8, 1);
        let mut mdir = MDir::empty([0, 1]);
        let tag = Tag::new(
            crate::tag::Type1::Name as u8,
            crate::tag::chunk::name::REG,
            0,
            3,
        );
        let attrs = [Attr::new(tag, b"foo".to_vec())];
        commit(
            &mut cd,
            &mut alloc,
            |_| Ok(()),
            &mut mdir,
            &attrs,
            GState::ZERO,
            0,
        )
        .unwrap();
        assert_eq!(mdir.count, 1);
    }
}
