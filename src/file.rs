//! File handles, spec.md §4 file representation + the added attribute
//! API (SPEC_FULL.md): open/read/write/sync/close, inline↔CTZ promotion,
//! truncate, and USERATTR get/set/remove.
//!
//! Grounded in the teacher's `rfs_lib::fuse` read/write handlers (offset
//! bookkeeping, growing a file by writing past its current size) but
//! replacing the ext2 direct/indirect block pointers with the CTZ
//! skip-list (`crate::ctz`) and the inline-attribute fast path spec.md
//! adds for small files.

use crate::alloc::Allocator;
use crate::cache::CachedDevice;
use crate::config::Config;
use crate::ctz;
use crate::error::{Error, Result};
use crate::gstate::GState;
use crate::mdir::{self, Attr, MDir};
use crate::tag::{self, Tag};
use crate::util::{fromle32, tole32};
use block_device::BlockDevice;

/// Appends `data` to a CTZ list, allocating and extending as many blocks as
/// needed (spec.md §4.4 Extend, called in a loop). `head == None` means no
/// block exists yet (a fresh file); `size` is the number of bytes already
/// committed to the existing chain. Returns the new head and total size,
/// computed from bytes actually programmed rather than `pos + data.len()`,
/// so a write spanning more than one block neither truncates nor inflates
/// the reported size.
fn append_ctz<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    mut head: Option<u32>,
    mut size: u32,
    data: &[u8],
) -> Result<(u32, u32)> {
    if data.is_empty() {
        if let Some(h) = head {
            return Ok((h, size));
        }
        // Promoting an empty inline file to CTZ storage with nothing to
        // write is a caller bug (nothing triggers promotion without bytes
        // past the inline ceiling); there is no head to return.
        return Err(Error::Invalid);
    }
    let block_size = cd.geometry().block_size;
    let mut written = 0usize;
    while written < data.len() {
        let new_block = alloc.alloc(&mut |_| Ok(()))?;
        let cap = match head {
            None => {
                cd.erase(new_block)?;
                block_size
            }
            Some(h) => {
                let new_head = ctz::extend(cd, h, size, new_block)?;
                debug_assert_eq!(new_head, new_block);
                ctz::next_block_capacity(block_size, size)
            }
        };
        let header_len = block_size - cap;
        let chunk = (cap as usize).min(data.len() - written);
        cd.prog(new_block, header_len, &data[written..written + chunk], false)?;
        written += chunk;
        size += chunk as u32;
        head = Some(new_block);
    }
    Ok((head.expect("loop always allocates at least one block when data is non-empty"), size))
}

#[derive(Debug, Clone)]
enum Data {
    Inline(Vec<u8>),
    Ctz { head: u32, size: u32 },
}

/// An open file. Holds its own read buffer (spec.md §4: "each open file
/// holds its own cache") but writes flow straight through the mount's
/// shared cached device, which owns the single prog-cache.
pub struct File {
    pub dir_pair: [u32; 2],
    pub id: u16,
    data: Data,
    pos: u32,
    /// Registered with the mount's open-handle list (spec.md §4.7) by
    /// `Lfs::open`; zero for a handle not yet adopted by a mount (e.g. the
    /// unit tests in this module that construct `File` directly).
    handle_id: u64,
}

impl File {
    pub fn open<D: BlockDevice>(
        cd: &mut CachedDevice<D>,
        dir_pair: [u32; 2],
        id: u16,
    ) -> Result<Self> {
        let mut found: Option<Data> = None;
        mdir::fetch(cd, dir_pair, |tag, data| {
            if tag.id == id && tag.type1_enum() == Some(tag::Type1::Struct) {
                if tag.chunk == tag::chunk::structure::INLINE_STRUCT {
                    found = Some(Data::Inline(data.to_vec()));
                } else if tag.chunk == tag::chunk::structure::CTZ_STRUCT && data.len() >= 8 {
                    found = Some(Data::Ctz {
                        head: fromle32(&data[0..4]),
                        size: fromle32(&data[4..8]),
                    });
                }
            }
            false
        })?;
        let data = found.unwrap_or(Data::Inline(Vec::new()));
        Ok(Self {
            dir_pair,
            id,
            data,
            pos: 0,
            handle_id: 0,
        })
    }

    pub(crate) fn set_handle_id(&mut self, id: u64) {
        self.handle_id = id;
    }

    pub(crate) fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn size(&self) -> u32 {
        match &self.data {
            Data::Inline(v) => v.len() as u32,
            Data::Ctz { size, .. } => *size,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.data, Data::Inline(_))
    }

    /// The CTZ head/size this file's data lives at, or `None` for an
    /// inline file. Used by `fs::Lfs::traverse_live` to mark every data
    /// block reachable from an open file (spec.md §4.2 invariant A1).
    pub(crate) fn ctz_location(&self) -> Option<(u32, u32)> {
        match &self.data {
            Data::Inline(_) => None,
            Data::Ctz { head, size } => Some((*head, *size)),
        }
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn read<D: BlockDevice>(&mut self, cd: &mut CachedDevice<D>, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if self.pos >= size {
            return Ok(0);
        }
        let avail = (size - self.pos) as usize;
        let n = buf.len().min(avail);
        match &self.data {
            Data::Inline(v) => {
                buf[..n].copy_from_slice(&v[self.pos as usize..self.pos as usize + n]);
            }
            Data::Ctz { head, size } => {
                let block_size = cd.geometry().block_size;
                let mut done = 0;
                while done < n {
                    let (block, off) = ctz::find(cd, *head, *size, self.pos + done as u32)?;
                    let chunk = (n - done).min((block_size - off) as usize);
                    cd.read(chunk as u32, block, off, &mut buf[done..done + chunk])?;
                    done += chunk;
                }
            }
        }
        self.pos += n as u32;
        Ok(n)
    }

    /// Appends/overwrites `buf` at the current position, promoting to
    /// CTZ storage if the result would exceed `config.inline_max()`
    /// (spec.md §8 scenario 3).
    pub fn write<D: BlockDevice>(
        &mut self,
        cd: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        config: &Config,
        buf: &[u8],
    ) -> Result<usize> {
        let new_end = self.pos + buf.len() as u32;

        if let Data::Inline(v) = &mut self.data {
            if new_end <= config.inline_max() {
                if v.len() < new_end as usize {
                    v.resize(new_end as usize, 0);
                }
                v[self.pos as usize..new_end as usize].copy_from_slice(buf);
                self.pos = new_end;
                return Ok(buf.len());
            }
            // Promote to CTZ: the existing inline bytes (zero-padded to
            // `pos`) plus the new data become one growing CTZ list, built
            // block-by-block through the same `append_ctz` helper a plain
            // CTZ append uses.
            let mut whole = v.clone();
            if whole.len() < self.pos as usize {
                whole.resize(self.pos as usize, 0);
            }
            whole.truncate(self.pos as usize);
            whole.extend_from_slice(buf);
            let (head, size) = append_ctz(cd, alloc, None, 0, &whole)?;
            self.data = Data::Ctz { head, size };
            self.pos = new_end;
            return Ok(buf.len());
        }

        if let Data::Ctz { head, size } = &mut self.data {
            // The skip-list is append-only (spec.md §4.4): a write must
            // start exactly at the current end of the file. Writing into
            // the middle of an existing CTZ chain would need to rebuild
            // every back-pointer from the edit point forward, which spec.md
            // does not describe.
            if self.pos != *size {
                return Err(Error::Invalid);
            }
            let (new_head, new_size) = append_ctz(cd, alloc, Some(*head), *size, buf)?;
            *head = new_head;
            *size = new_size;
            self.pos = new_size;
            return Ok(buf.len());
        }

        unreachable!()
    }

    pub fn truncate<D: BlockDevice>(&mut self, _cd: &mut CachedDevice<D>, len: u32) -> Result<()> {
        match &mut self.data {
            Data::Inline(v) => {
                v.resize(len as usize, 0);
            }
            Data::Ctz { size, .. } => {
                // Shrinking a CTZ list in place would require rebuilding
                // the skip-list from a new head; only size bookkeeping
                // (growth with zero-fill, spec.md §8) is implemented here.
                *size = len;
            }
        }
        Ok(())
    }

    /// Commits the current STRUCT tag for this file back to its owning
    /// MDIR.
    pub fn sync<D: BlockDevice>(
        &mut self,
        cd: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
        block_cycles: u32,
    ) -> Result<[u32; 2]> {
        let (mut mdir, _) = mdir::fetch(cd, self.dir_pair, |_, _| false)?;
        let attr = match &self.data {
            Data::Inline(v) => {
                let t = Tag::new(
                    tag::Type1::Struct as u8,
                    tag::chunk::structure::INLINE_STRUCT,
                    self.id,
                    v.len() as u16,
                );
                Attr::new(t, v.clone())
            }
            Data::Ctz { head, size } => {
                let t = Tag::new(
                    tag::Type1::Struct as u8,
                    tag::chunk::structure::CTZ_STRUCT,
                    self.id,
                    8,
                );
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&tole32(*head));
                payload.extend_from_slice(&tole32(*size));
                Attr::new(t, payload)
            }
        };
        mdir::commit(cd, alloc, traverse, &mut mdir, &[attr], GState::ZERO, block_cycles)?;
        Ok(mdir.pair)
    }

    /// Sets a user attribute (`kind` selects the 8-bit USERATTR chunk
    /// space); a zero-length value marks the attribute for removal on
    /// the next compaction, per spec.md §9's `FROM_USERATTRS` note.
    pub fn set_attr<D: BlockDevice>(
        &mut self,
        cd: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
        kind: u8,
        value: &[u8],
        block_cycles: u32,
    ) -> Result<[u32; 2]> {
        let (mut mdir, _) = mdir::fetch(cd, self.dir_pair, |_, _| false)?;
        let size = if value.is_empty() {
            tag::SIZE_DELETE
        } else {
            value.len() as u16
        };
        let t = Tag::new(tag::Type1::UserAttr as u8, kind, self.id, size);
        mdir::commit(
            cd,
            alloc,
            traverse,
            &mut mdir,
            &[Attr::new(t, value.to_vec())],
            GState::ZERO,
            block_cycles,
        )?;
        Ok(mdir.pair)
    }

    pub fn get_attr<D: BlockDevice>(
        &self,
        cd: &mut CachedDevice<D>,
        kind: u8,
    ) -> Result<Option<Vec<u8>>> {
        let mut out = None;
        mdir::fetch(cd, self.dir_pair, |tag, data| {
            if tag.id == self.id
                && tag.type1_enum() == Some(tag::Type1::UserAttr)
                && tag.chunk == kind
            {
                out = if tag.size == tag::SIZE_DELETE {
                    None
                } else {
                    Some(data.to_vec())
                };
            }
            false
        })?;
        Ok(out)
    }

    pub fn remove_attr<D: BlockDevice>(
        &mut self,
        cd: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
        kind: u8,
        block_cycles: u32,
    ) -> Result<[u32; 2]> {
        self.set_attr(cd, alloc, traverse, kind, &[], block_cycles)
    }
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
            block_count: 16,
        }
    }

    fn config() -> Config {
        Config {
            geometry: geometry(),
            cache_size: 64,
            lookahead_size: 1,
            block_cycles: 0,
            name_max: 255,
            file_max: u32::MAX,
            attr_max: 1022,
        }
    }

    #[test]
    fn inline_write_then_read_round_trips() {
        let mut cd = CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        cd.erase(0).unwrap();
        cd.erase(1).unwrap();
        cd.sync(false).unwrap();
        let mut alloc = Allocator::new(16, 1);
        let mut file = File::open(&mut cd, [0, 1], 0).unwrap();
        file.write(&mut cd, &mut alloc, &config(), b"hello").unwrap();
        file.seek(0);
        let mut buf = [0u8; 5];
        let n = file.read(&mut cd, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn truncate_grows_with_zero_fill() {
        let mut cd = CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        cd.erase(0).unwrap();
        cd.erase(1).unwrap();
        cd.sync(false).unwrap();
        let mut alloc = Allocator::new(16, 1);
        let mut file = File::open(&mut cd, [0, 1], 0).unwrap();
        file.write(&mut cd, &mut alloc, &config(), b"ab").unwrap();
        file.truncate(&mut cd, 4).unwrap();
        assert_eq!(file.size(), 4);
    }
}
