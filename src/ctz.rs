//! CTZ skip-list, spec.md §4.4: the append-only index giving O(log n)
//! random seeks into file data without rewriting prior blocks.
//!
//! No teacher equivalent (ext2 uses direct/indirect block pointers);
//! grounded directly in spec.md's Find/Extend/Traverse description, with
//! the on-disk skip-pointer words read/written through `crate::util`'s
//! explicit little-endian helpers per spec.md §9.

use crate::cache::CachedDevice;
use crate::error::{Error, Result};
use crate::util::{ctz, fromle32, npw2, tole32};
use block_device::BlockDevice;

/// Number of skip pointers stored at the head of block index `i`:
/// `ctz(i) + 1`, with `ctz(0)` treated as 0 (the first block carries a
/// single back-pointer, to itself conceptually absent).
fn skip_count(i: u32) -> u32 {
    if i == 0 {
        0
    } else {
        ctz(i) + 1
    }
}

/// Inverts the block-carries-skip-pointers geometry: given a byte offset
/// into the logical file, recovers the block index that offset falls in.
/// spec.md §4.4: "subtract `4*(popcount(i-1)+2)` from `off`".
fn ctz_index(block_size: u32, off: u32) -> (u32, u32) {
    let b = block_size - 2 * 4;
    let mut i = off / b;
    loop {
        let header = if i == 0 { 0 } else { 4 * (skip_count(i)) };
        let data_size = block_size - header;
        let base = {
            // Re-derive the byte offset of the start of block i by summing
            // data_size of every prior block; since data_size depends only
            // on skip_count(k), and skip_count(k) <= npw2(k)+1, this loop
            // is bounded by ctz_index's own guess and corrected at most
            // once in practice.
            let mut acc = 0u32;
            for k in 0..i {
                let h = if k == 0 { 0 } else { 4 * skip_count(k) };
                acc += block_size - h;
            }
            acc
        };
        if base <= off && off < base + data_size {
            return (i, off - base);
        }
        if base > off {
            i -= 1;
        } else {
            i += 1;
        }
    }
}

/// Walks the skip-list from `(block, current)` down to `target`,
/// following the same largest-legal-hop rule at every step. Shared by
/// `find` (walking all the way to a byte offset) and `extend` (walking
/// just far enough to resolve one back-pointer of a freshly appended
/// block).
fn walk_to<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    mut block: u32,
    mut current: u32,
    target: u32,
) -> Result<u32> {
    while current != target {
        let skip = npw2(current - target + 1)
            .saturating_sub(1)
            .min(ctz(current));
        let mut ptr = [0u8; 4];
        cd.read(4, block, 4 * skip, &mut ptr)?;
        block = fromle32(&ptr);
        current -= 1 << skip;
    }
    Ok(block)
}

/// `Find(head, size, pos)`: returns the block holding logical offset
/// `pos` and the byte offset within it, walking skip pointers from
/// `head` (the highest-index block).
pub fn find<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    head: u32,
    file_size: u32,
    pos: u32,
) -> Result<(u32, u32)> {
    let block_size = cd.geometry().block_size;
    if file_size == 0 {
        return Ok((head, 0));
    }
    let (target, target_off) = ctz_index(block_size, pos);
    let (current, _) = ctz_index(block_size, file_size.saturating_sub(1));
    let block = walk_to(cd, head, current, target)?;
    Ok((block, target_off))
}

/// `Extend(head, size, data)`: allocates the next block in the skip-list.
/// Each of the new block's back-pointers targets `new_index - 2^k` and is
/// resolved by walking the existing list from `head`, exactly as `Find`
/// would locate that index; (Z1) the resulting header reproduces the
/// graph the index implies.
pub fn extend<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    head: u32,
    file_size: u32,
    new_block: u32,
) -> Result<u32> {
    let block_size = cd.geometry().block_size;
    let (old_index, _) = ctz_index(block_size, file_size.saturating_sub(1));
    let new_index = old_index + 1;
    let skips = skip_count(new_index);

    cd.erase(new_block)?;
    for k in 0..skips {
        let target = new_index - (1 << k);
        let ptr_block = if target == old_index {
            head
        } else {
            walk_to(cd, head, old_index, target)?
        };
        let buf = tole32(ptr_block);
        cd.prog(new_block, 4 * k, &buf, false)?;
    }
    Ok(new_block)
}

/// `Traverse(head, size, cb)`: visits every block in the skip-list
/// exactly once, following the highest skip pointer at each step. Used
/// by the allocator's lookahead refill to mark live data blocks.
pub fn traverse<D: BlockDevice>(
    cd: &mut CachedDevice<D>,
    head: u32,
    file_size: u32,
    mut cb: impl FnMut(u32),
) -> Result<()> {
    if file_size == 0 {
        cb(head);
        return Ok(());
    }
    let block_size = cd.geometry().block_size;
    let (mut current, _) = ctz_index(block_size, file_size.saturating_sub(1));
    let mut block = head;
    loop {
        cb(block);
        if current == 0 {
            break;
        }
        let skip = ctz(current);
        let mut ptr = [0u8; 4];
        cd.read(4, block, 4 * skip, &mut ptr)?;
        block = fromle32(&ptr);
        current -= 1 << skip;
    }
    Ok(())
}

/// Per-block payload capacity at index `i`: `block_size - 4*skip_count(i)`.
pub fn data_capacity(block_size: u32, index: u32) -> u32 {
    block_size - 4 * skip_count(index)
}

/// Payload capacity of the block that `extend` would allocate next, given
/// the file's current size. Used by `file::write`'s multi-block append
/// loop to size each chunk before calling `extend`.
pub fn next_block_capacity(block_size: u32, file_size: u32) -> u32 {
    let (old_index, _) = ctz_index(block_size, file_size.saturating_sub(1));
    data_capacity(block_size, old_index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_counts_match_ctz_plus_one() {
        assert_eq!(skip_count(0), 0);
        assert_eq!(skip_count(1), 1);
        assert_eq!(skip_count(2), 2);
        assert_eq!(skip_count(4), 3);
    }

    #[test]
    fn single_block_find_returns_head() {
        use block_device::{ram::RamBlockDevice, Geometry};
        let geometry = Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 8,
        };
        let mut cd = CachedDevice::new(RamBlockDevice::new(geometry), 64);
        let (block, off) = find(&mut cd, 3, 10, 5).unwrap();
        assert_eq!(block, 3);
        assert_eq!(off, 5);
    }

    #[test]
    fn data_capacity_shrinks_with_skip_pointers() {
        assert_eq!(data_capacity(512, 0), 512);
        assert!(data_capacity(512, 4) < 512);
    }

    #[test]
    fn next_block_capacity_matches_the_following_index() {
        assert_eq!(next_block_capacity(512, 0), data_capacity(512, 1));
        assert_eq!(next_block_capacity(512, 512), data_capacity(512, 1));
    }
}
