//! Path resolution and directory operations, spec.md §4.6 (folded here
//! with the mount-level directory API since both walk the same MDIR
//! chain).
//!
//! Grounded in the teacher's path-walking in `rfs_lib::fuse::RFS::lookup`
//! and `src/rfs_lib/mod.rs`'s directory-entry scan, generalized from a
//! fixed-size entry array to tag lookups against `mdir::fetch`'s matcher
//! callback.

use crate::error::{Error, Result};
use crate::gstate::GState;
use crate::mdir::{self, Attr, MDir};
use crate::tag::{self, Tag};
use crate::util::{fromle32, tole32};
use block_device::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Reg,
    Dir,
}

/// A resolved directory entry: which MDIR it lives in, its id within
/// that MDIR, and its kind/structure pointer.
#[derive(Debug, Clone)]
pub struct Entry {
    pub mdir: [u32; 2],
    pub id: u16,
    pub kind: EntryKind,
    /// For a directory: the child's own MDIR pair. For a file: `None`
    /// (its STRUCT tag, inline or CTZ, is read separately).
    pub child: Option<[u32; 2]>,
}

/// Looks up `name` as a direct child of the MDIR at `dir_pair`. Returns
/// `Ok(None)` if absent.
pub fn lookup<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    dir_pair: [u32; 2],
) -> Result<(MDir, Vec<(u16, EntryKind, Vec<u8>, Option<[u32; 2]>)>)> {
    let mut entries = Vec::new();
    let (mdir, _) = mdir::fetch(cd, dir_pair, |_, _| false)?;
    // Re-fetch with a matcher that records every NAME tag's id/kind/name;
    // a second pass then pulls each id's STRUCT payload.
    let mut names: Vec<(u16, EntryKind, Vec<u8>)> = Vec::new();
    mdir::fetch(cd, dir_pair, |tag, data| {
        if tag.type1_enum() == Some(tag::Type1::Name) {
            let kind = match tag.chunk {
                c if c == tag::chunk::name::DIR => EntryKind::Dir,
                _ => EntryKind::Reg,
            };
            names.push((tag.id, kind, data.to_vec()));
        }
        false
    })?;

    for (id, kind, name) in names {
        let mut child = None;
        if kind == EntryKind::Dir {
            mdir::fetch(cd, dir_pair, |tag, data| {
                if tag.id == id
                    && tag.type1_enum() == Some(tag::Type1::Struct)
                    && tag.chunk == tag::chunk::structure::DIR_STRUCT
                    && data.len() >= 8
                {
                    child = Some([fromle32(&data[0..4]), fromle32(&data[4..8])]);
                }
                false
            })?;
        }
        entries.push((id, kind, name, child));
    }

    Ok((mdir, entries))
}

pub fn find_by_name<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    dir_pair: [u32; 2],
    name: &str,
) -> Result<Option<Entry>> {
    let (mdir, entries) = lookup(cd, dir_pair)?;
    for (id, kind, raw_name, child) in entries {
        if raw_name == name.as_bytes() {
            return Ok(Some(Entry {
                mdir: mdir.pair,
                id,
                kind,
                child,
            }));
        }
    }
    Ok(None)
}

/// Resolves a `/`-separated absolute path starting from `root`, following
/// child directory pairs one component at a time.
pub fn resolve<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    root: [u32; 2],
    path: &str,
) -> Result<Option<Entry>> {
    let mut dir = root;
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return Ok(Some(Entry {
            mdir: root,
            id: tag::ID_NONE,
            kind: EntryKind::Dir,
            child: Some(root),
        }));
    }
    for (i, part) in parts.iter().enumerate() {
        let found = find_by_name(cd, dir, part)?;
        match found {
            None => return Ok(None),
            Some(entry) => {
                if i + 1 == parts.len() {
                    return Ok(Some(entry));
                }
                match entry.child {
                    Some(child) => dir = child,
                    None => return Err(Error::NotDir),
                }
            }
        }
    }
    Ok(None)
}

fn next_free_id(mdir: &MDir) -> u16 {
    mdir.count
}

/// Creates a new directory or regular-file entry named `name` inside
/// `dir_pair`. For a directory, allocates a fresh child MDIR pair first
/// and brackets the publish with `prep_orphans` (spec.md §4.5: "mkdir
/// that publishes the child before the parent").
pub fn create<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    alloc: &mut crate::alloc::Allocator,
    mut traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
    dir_pair: [u32; 2],
    name: &str,
    kind: EntryKind,
    child_pair: Option<[u32; 2]>,
    block_cycles: u32,
) -> Result<[u32; 2]> {
    if name.len() > 255 {
        return Err(Error::NameTooLong);
    }
    if find_by_name(cd, dir_pair, name)?.is_some() {
        return Err(Error::Exists);
    }

    let (mut mdir, _) = mdir::fetch(cd, dir_pair, |_, _| false)?;
    let id = next_free_id(&mdir);

    let name_chunk = match kind {
        EntryKind::Dir => tag::chunk::name::DIR,
        EntryKind::Reg => tag::chunk::name::REG,
    };
    let name_tag = Tag::new(tag::Type1::Name as u8, name_chunk, id, name.len() as u16);
    let mut attrs = vec![Attr::new(name_tag, name.as_bytes().to_vec())];

    let mut gdelta = GState::ZERO;
    if let Some(child) = child_pair {
        let struct_tag = Tag::new(
            tag::Type1::Struct as u8,
            tag::chunk::structure::DIR_STRUCT,
            id,
            8,
        );
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&tole32(child[0]));
        payload.extend_from_slice(&tole32(child[1]));
        attrs.push(Attr::new(struct_tag, payload));
        gdelta.prep_orphans(1);
    }

    mdir::commit(cd, alloc, &mut traverse, &mut mdir, &attrs, gdelta, block_cycles)?;

    if child_pair.is_some() {
        // The child is now referenced by a committed parent tag; flush the
        // compensating -1 in a second, immediate commit on the same MDIR
        // (spec.md §4.5 G2) rather than stashing it on the local `mdir`
        // value, which is dropped the moment this function returns and
        // would otherwise leave a permanent phantom orphan.
        let mut correction = GState::ZERO;
        correction.prep_orphans(-1);
        mdir::commit(cd, alloc, &mut traverse, &mut mdir, &[], correction, block_cycles)?;
    }

    Ok(mdir.pair)
}

/// Removes `name` from `dir_pair`. For a directory target, the caller
/// must have already verified it is empty (spec.md §4.6).
pub fn remove<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    alloc: &mut crate::alloc::Allocator,
    mut traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
    dir_pair: [u32; 2],
    name: &str,
    block_cycles: u32,
) -> Result<[u32; 2]> {
    let entry = find_by_name(cd, dir_pair, name)?.ok_or(Error::NoEntry)?;
    if entry.kind == EntryKind::Dir {
        let child = entry.child.ok_or(Error::Corrupt)?;
        let (_, children) = lookup(cd, child)?;
        if !children.is_empty() {
            return Err(Error::NotEmpty);
        }
    }

    let (mut mdir, _) = mdir::fetch(cd, dir_pair, |_, _| false)?;
    let mut gdelta = GState::ZERO;
    if entry.kind == EntryKind::Dir {
        gdelta.prep_orphans(1);
    }
    let delete_tag = Tag::new(
        tag::Type1::Splice as u8,
        tag::chunk::splice::DELETE,
        entry.id,
        0,
    );
    mdir::commit(
        cd,
        alloc,
        &mut traverse,
        &mut mdir,
        &[Attr::new(delete_tag, Vec::new())],
        gdelta,
        block_cycles,
    )?;
    if entry.kind == EntryKind::Dir {
        let mut correction = GState::ZERO;
        correction.prep_orphans(-1);
        mdir::commit(cd, alloc, &mut traverse, &mut mdir, &[], correction, block_cycles)?;
    }
    Ok(mdir.pair)
}

/// Atomically moves `old_name` to `new_name` inside the same directory.
/// Per spec.md §4.6(2), renaming onto an existing name replaces it rather
/// than failing; `fs::Lfs::rename` calls `rename_across` instead when the
/// two directories differ.
pub fn rename_within<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    alloc: &mut crate::alloc::Allocator,
    mut traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
    dir_pair: [u32; 2],
    old_name: &str,
    new_name: &str,
    block_cycles: u32,
) -> Result<[u32; 2]> {
    let entry = find_by_name(cd, dir_pair, old_name)?.ok_or(Error::NoEntry)?;
    let existing_dest = find_by_name(cd, dir_pair, new_name)?;
    if let Some(dest) = &existing_dest {
        if dest.id == entry.id {
            return Ok(dir_pair);
        }
        if dest.kind == EntryKind::Dir {
            let child = dest.child.ok_or(Error::Corrupt)?;
            let (_, children) = lookup(cd, child)?;
            if !children.is_empty() {
                return Err(Error::NotEmpty);
            }
        }
    }

    let (mut mdir, _) = mdir::fetch(cd, dir_pair, |_, _| false)?;
    let mut gdelta = GState::ZERO;
    gdelta.prep_move(entry.id, dir_pair);
    if existing_dest.is_some() {
        gdelta.prep_orphans(1);
    }

    let name_chunk = match entry.kind {
        EntryKind::Dir => tag::chunk::name::DIR,
        EntryKind::Reg => tag::chunk::name::REG,
    };
    let mut attrs = Vec::new();
    if let Some(dest) = &existing_dest {
        let delete_tag = Tag::new(tag::Type1::Splice as u8, tag::chunk::splice::DELETE, dest.id, 0);
        attrs.push(Attr::new(delete_tag, Vec::new()));
    }
    let rename_tag = Tag::new(
        tag::Type1::Name as u8,
        name_chunk,
        entry.id,
        new_name.len() as u16,
    );
    attrs.push(Attr::new(rename_tag, new_name.as_bytes().to_vec()));

    mdir::commit(cd, alloc, &mut traverse, &mut mdir, &attrs, gdelta, block_cycles)?;

    let mut correction = GState::ZERO;
    correction.demove(entry.id, dir_pair);
    if existing_dest.is_some() {
        correction.prep_orphans(-1);
    }
    mdir::commit(cd, alloc, &mut traverse, &mut mdir, &[], correction, block_cycles)?;
    Ok(mdir.pair)
}

/// Moves `old_name` out of `from_pair` and into `to_pair` under `new_name`,
/// for the cross-directory case `rename_within` cannot handle (spec.md
/// §4.6(2), §4.5's prep_move bracket generalized across two MDIRs instead
/// of one). The destination CREATE (and, if `new_name` already exists
/// there, its replacement) commits first, bracketed by `prep_move`/
/// `prep_orphans`; only once that has landed does the source DELETE commit
/// and cancel the bracket, so a crash between the two leaves gstate
/// recording exactly the in-flight move/orphan for `forceconsistency` to
/// resolve at the next mount.
pub fn rename_across<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    alloc: &mut crate::alloc::Allocator,
    mut traverse: impl FnMut(&mut dyn FnMut(u32)) -> Result<()>,
    from_pair: [u32; 2],
    old_name: &str,
    to_pair: [u32; 2],
    new_name: &str,
    block_cycles: u32,
) -> Result<([u32; 2], [u32; 2])> {
    let entry = find_by_name(cd, from_pair, old_name)?.ok_or(Error::NoEntry)?;
    let existing_dest = find_by_name(cd, to_pair, new_name)?;
    if let Some(dest) = &existing_dest {
        if dest.kind == EntryKind::Dir {
            let child = dest.child.ok_or(Error::Corrupt)?;
            let (_, children) = lookup(cd, child)?;
            if !children.is_empty() {
                return Err(Error::NotEmpty);
            }
        }
    }

    // Capture the source entry's full STRUCT payload so the destination is
    // byte-identical (inline bytes or CTZ head/size), per spec.md's rename
    // round-trip invariant.
    let mut struct_chunk = None;
    let mut struct_payload = Vec::new();
    mdir::fetch(cd, from_pair, |tag, data| {
        if tag.id == entry.id && tag.type1_enum() == Some(tag::Type1::Struct) {
            struct_chunk = Some(tag.chunk);
            struct_payload = data.to_vec();
        }
        false
    })?;

    let (mut dest_mdir, _) = mdir::fetch(cd, to_pair, |_, _| false)?;
    let new_id = next_free_id(&dest_mdir);

    let name_chunk = match entry.kind {
        EntryKind::Dir => tag::chunk::name::DIR,
        EntryKind::Reg => tag::chunk::name::REG,
    };
    let mut attrs = Vec::new();
    if let Some(dest) = &existing_dest {
        let delete_tag = Tag::new(tag::Type1::Splice as u8, tag::chunk::splice::DELETE, dest.id, 0);
        attrs.push(Attr::new(delete_tag, Vec::new()));
    }
    attrs.push(Attr::new(
        Tag::new(tag::Type1::Name as u8, name_chunk, new_id, new_name.len() as u16),
        new_name.as_bytes().to_vec(),
    ));
    if let Some(chunk) = struct_chunk {
        attrs.push(Attr::new(
            Tag::new(tag::Type1::Struct as u8, chunk, new_id, struct_payload.len() as u16),
            struct_payload,
        ));
    }

    let mut gdelta = GState::ZERO;
    gdelta.prep_move(new_id, to_pair);
    if existing_dest.is_some() {
        gdelta.prep_orphans(1);
    }
    mdir::commit(cd, alloc, &mut traverse, &mut dest_mdir, &attrs, gdelta, block_cycles)?;

    let (mut src_mdir, _) = mdir::fetch(cd, from_pair, |_, _| false)?;
    let delete_tag = Tag::new(tag::Type1::Splice as u8, tag::chunk::splice::DELETE, entry.id, 0);
    let mut correction = GState::ZERO;
    correction.demove(new_id, to_pair);
    if existing_dest.is_some() {
        correction.prep_orphans(-1);
    }
    mdir::commit(
        cd,
        alloc,
        &mut traverse,
        &mut src_mdir,
        &[Attr::new(delete_tag, Vec::new())],
        correction,
        block_cycles,
    )?;
    Ok((src_mdir.pair, dest_mdir.pair))
}

pub fn readdir<D: BlockDevice>(
    cd: &mut crate::cache::CachedDevice<D>,
    dir_pair: [u32; 2],
) -> Result<Vec<(String, EntryKind)>> {
    let (_, entries) = lookup(cd, dir_pair)?;
    let mut out = vec![
        (".".to_string(), EntryKind::Dir),
        ("..".to_string(), EntryKind::Dir),
    ];
    for (_, kind, name, _) in entries {
        out.push((String::from_utf8_lossy(&name).into_owned(), kind));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::{ram::RamBlockDevice, Geometry};

    fn geometry() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 16,
        }
    }

    fn root_mdir<D: BlockDevice>(cd: &mut crate::cache::CachedDevice<D>) {
        cd.erase(0).unwrap();
        cd.erase(1).unwrap();
        cd.sync(false).unwrap();
    }

    #[test]
    fn readdir_on_empty_root_has_dot_entries() {
        let mut cd = crate::cache::CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        root_mdir(&mut cd);
        let out = readdir(&mut cd, [0, 1]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn create_then_find_round_trips() {
        let mut cd = crate::cache::CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        root_mdir(&mut cd);
        let mut alloc = crate::alloc::Allocator::new(16, 1);
        create(
            &mut cd,
            &mut alloc,
            |_| Ok(()),
            [0, 1],
            "hello",
            EntryKind::Reg,
            None,
            0,
        )
        .unwrap();
        let found = find_by_name(&mut cd, [0, 1], "hello").unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().kind, EntryKind::Reg);
    }

    #[test]
    fn create_duplicate_name_fails_exist() {
        let mut cd = crate::cache::CachedDevice::new(RamBlockDevice::new(geometry()), 64);
        root_mdir(&mut cd);
        let mut alloc = crate::alloc::Allocator::new(16, 1);
        create(
            &mut cd,
            &mut alloc,
            |_| Ok(()),
            [0, 1],
            "hello",
            EntryKind::Reg,
            None,
            0,
        )
        .unwrap();
        let err = create(
            &mut cd,
            &mut alloc,
            |_| Ok(()),
            [0, 1],
            "hello",
            EntryKind::Reg,
            None,
            0,
        )
        .unwrap_err();
        assert_eq!(err, Error::Exists);
    }
}
