//! Mount / format / consistency, spec.md §4.7 and §8 -- the top-level
//! `Lfs` handle tying the cached device, allocator, root directory, and
//! gstate together.
//!
//! Grounded in the teacher's `RFS` struct (`src/rfs_lib/mod.rs`) as the
//! "one struct owns the mounted device" shape, and `chiro2001-rfs`'s
//! `main.rs` mount/format control flow, generalized from ext2's
//! superblock-at-fixed-block-0 layout to littlefs's {0,1} superblock pair
//! and deorphan/demove recovery pass.

use crate::alloc::Allocator;
use crate::cache::CachedDevice;
use crate::config::Config;
use crate::ctz;
use crate::dir::{self, EntryKind};
use crate::error::{Error, Result};
use crate::file::File;
use crate::gstate::GState;
use crate::mdir::{self, Attr, MDir};
use crate::tag::{self, Tag};
use crate::util::tole32;
use block_device::BlockDevice;
use log::{debug, info, warn};

pub use crate::mdir::SUPERBLOCK_PAIR;

pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: u32,
}

/// One entry in the mount's open-handle list (spec.md §4.7): the handle's
/// identity plus the `(dir_pair, id)` it currently resolves to. Kept as
/// plain data rather than a reference to the caller's `File`, per
/// SPEC_FULL.md §5's "no Rc/Arc beyond what the open-handle list needs" --
/// each `Lfs` method that takes `&mut File` re-syncs that file's location
/// from this table before touching it.
struct OpenHandle {
    id: u64,
    dir_pair: [u32; 2],
    file_id: u16,
}

/// A mounted filesystem. Bounded RAM: the two mount-wide cache buffers
/// plus the lookahead bitmap plus one buffer per open `File`
/// (spec.md §4's "Bounded RAM" note).
pub struct Lfs<D: BlockDevice> {
    cd: CachedDevice<D>,
    config: Config,
    alloc: Allocator,
    root: [u32; 2],
    gstate: GState,
    open_handles: Vec<OpenHandle>,
    next_handle: u64,
}

impl<D: BlockDevice> Lfs<D> {
    /// Formats a fresh device: writes the superblock pair with a
    /// SUPERBLOCK NAME tag and its INLINESTRUCT payload, then an empty
    /// root directory pair.
    pub fn format(device: D, config: Config) -> Result<Self> {
        config.validate()?;
        let mut cd = CachedDevice::new(device, config.cache_size);
        let mut alloc = Allocator::new(config.geometry.block_count, config.lookahead_size);

        cd.erase(SUPERBLOCK_PAIR[0])?;
        cd.erase(SUPERBLOCK_PAIR[1])?;
        cd.sync(false)?;

        let mut mdir = MDir {
            pair: SUPERBLOCK_PAIR,
            rev: 0,
            off: 4,
            etag: 0,
            count: 0,
            tail: None,
            split: false,
            erased: true,
            gdelta: GState::ZERO,
        };

        let name_tag = Tag::new(tag::Type1::Name as u8, tag::chunk::name::SUPERBLOCK, 0, 8);
        let mut superblock_payload = Vec::with_capacity(24);
        superblock_payload.extend_from_slice(&tole32(VERSION_MAJOR << 16 | VERSION_MINOR));
        superblock_payload.extend_from_slice(&tole32(config.geometry.block_size));
        superblock_payload.extend_from_slice(&tole32(config.geometry.block_count));
        superblock_payload.extend_from_slice(&tole32(config.name_max));
        superblock_payload.extend_from_slice(&tole32(config.file_max));
        superblock_payload.extend_from_slice(&tole32(config.attr_max));
        let struct_tag = Tag::new(
            tag::Type1::Struct as u8,
            tag::chunk::structure::INLINE_STRUCT,
            0,
            superblock_payload.len() as u16,
        );

        let attrs = vec![
            Attr::new(name_tag, b"littlefs".to_vec()),
            Attr::new(struct_tag, superblock_payload),
        ];
        mdir::commit(
            &mut cd,
            &mut alloc,
            |_| Ok(()),
            &mut mdir,
            &attrs,
            GState::ZERO,
            config.block_cycles,
        )?;

        info!(
            "formatted {} ({} blocks x {} bytes)",
            "littlefs", config.geometry.block_count, config.geometry.block_size
        );

        Ok(Self {
            cd,
            config,
            alloc,
            root: SUPERBLOCK_PAIR,
            gstate: GState::ZERO,
            open_handles: Vec::new(),
            next_handle: 0,
        })
    }

    /// Mounts an already-formatted device: reads the superblock,
    /// validates the major version, reconstructs gstate by scanning the
    /// directory chain, and runs `forceconsistency`.
    pub fn mount(device: D, config: Config) -> Result<Self> {
        config.validate()?;
        let mut cd = CachedDevice::new(device, config.cache_size);
        let alloc = Allocator::new(config.geometry.block_count, config.lookahead_size);

        let mut magic = None;
        let mut version = None;
        mdir::fetch(&mut cd, SUPERBLOCK_PAIR, |tag, data| {
            if tag.type1_enum() == Some(tag::Type1::Name)
                && tag.chunk == tag::chunk::name::SUPERBLOCK
            {
                magic = Some(data.to_vec());
            }
            if tag.type1_enum() == Some(tag::Type1::Struct)
                && tag.chunk == tag::chunk::structure::INLINE_STRUCT
                && tag.id == 0
                && data.len() >= 4
            {
                version = Some(crate::util::fromle32(&data[0..4]));
            }
            false
        })?;

        if magic.as_deref() != Some(b"littlefs") {
            return Err(Error::Corrupt);
        }
        if let Some(v) = version {
            let major = v >> 16;
            let minor = v & 0xffff;
            if major != VERSION_MAJOR || minor > VERSION_MINOR {
                warn!("incompatible on-disk version {}.{}", major, minor);
                return Err(Error::Corrupt);
            }
        }

        let mut fs = Self {
            cd,
            config,
            alloc,
            root: SUPERBLOCK_PAIR,
            gstate: GState::ZERO,
            open_handles: Vec::new(),
            next_handle: 0,
        };
        fs.gstate = fs.scan_gstate()?;
        fs.forceconsistency()?;
        Ok(fs)
    }

    /// Scans the directory chain starting at the superblock pair,
    /// XOR-folding every MOVESTATE payload, per spec.md §4.5: "the live
    /// gstate is the XOR of all MOVESTATE values on disk".
    fn scan_gstate(&mut self) -> Result<GState> {
        let mut g = GState::ZERO;
        let mut pair = SUPERBLOCK_PAIR;
        loop {
            let mut tail = None;
            mdir::fetch(&mut self.cd, pair, |tag, data| {
                if tag.type1_enum() == Some(tag::Type1::MoveState) && data.len() >= 12 {
                    let t = crate::util::fromle32(&data[0..4]);
                    let p0 = crate::util::fromle32(&data[4..8]);
                    let p1 = crate::util::fromle32(&data[8..12]);
                    g = g.xor(&GState {
                        tag: t,
                        pair: [p0, p1],
                    });
                }
                if tag.type1_enum() == Some(tag::Type1::Tail) && data.len() >= 8 {
                    tail = Some([
                        crate::util::fromle32(&data[0..4]),
                        crate::util::fromle32(&data[4..8]),
                    ]);
                }
                false
            })?;
            match tail {
                Some(next) => pair = next,
                None => break,
            }
        }
        Ok(g)
    }

    /// (G3) Runs `demove` then `deorphan`, lazily invoked before any
    /// write operation as well as once at mount. Both corrections are
    /// persisted to the superblock pair immediately, not just folded into
    /// the in-memory `gstate` (spec.md G2: the bracket must net to zero on
    /// disk, not merely in RAM).
    pub fn forceconsistency(&mut self) -> Result<()> {
        if let Some((id, pair)) = self.gstate.pending_move() {
            debug!("demove: clearing pending move id={} pair={:?}", id, pair);
            let (mut mdir, _) = mdir::fetch(&mut self.cd, pair, |_, _| false)?;
            let mut correction = GState::ZERO;
            correction.demove(id, pair);
            mdir::commit(
                &mut self.cd,
                &mut self.alloc,
                |_| Ok(()),
                &mut mdir,
                &[],
                correction,
                self.config.block_cycles,
            )?;
            self.fs_relocate(pair, mdir.pair)?;
            self.gstate.demove(id, pair);
        }

        let orphans = self.gstate.orphans();
        if orphans != 0 {
            debug!("deorphan: {} orphan(s) recorded, sweeping", orphans);
            let resolved = self.deorphan_sweep()?;
            if resolved < orphans {
                warn!(
                    "deorphan: {} of {} recorded orphan(s) still unresolved",
                    orphans - resolved,
                    orphans
                );
            }
        }
        Ok(())
    }

    /// Walks every directory reachable from `root` and, for each
    /// directory-kind child whose own MDIR pair fails to fetch, deletes
    /// the dangling entry from its parent and folds a compensating
    /// `prep_orphans(-1)` into that same commit (spec.md §4.5: "for any
    /// head without a valid parent, drops it"). Returns the number of
    /// orphans resolved.
    fn deorphan_sweep(&mut self) -> Result<i32> {
        let mut resolved = 0i32;
        let mut stack = vec![self.root];
        while let Some(start) = stack.pop() {
            let mut pair = start;
            let (_, entries) = dir::lookup(&mut self.cd, pair)?;
            for (id, kind, name, child) in entries {
                if kind != EntryKind::Dir {
                    continue;
                }
                let child_pair = match child {
                    Some(c) => c,
                    None => continue,
                };
                match mdir::fetch(&mut self.cd, child_pair, |_, _| false) {
                    Ok(_) => stack.push(child_pair),
                    Err(_) => {
                        warn!(
                            "deorphan: dropping dangling directory entry id={} in {:?}",
                            id, pair
                        );
                        let (mut parent_mdir, _) = mdir::fetch(&mut self.cd, pair, |_, _| false)?;
                        let delete_tag = Tag::new(
                            tag::Type1::Splice as u8,
                            tag::chunk::splice::DELETE,
                            id,
                            0,
                        );
                        let mut correction = GState::ZERO;
                        correction.prep_orphans(-1);
                        mdir::commit(
                            &mut self.cd,
                            &mut self.alloc,
                            |_| Ok(()),
                            &mut parent_mdir,
                            &[Attr::new(delete_tag, Vec::new())],
                            correction,
                            self.config.block_cycles,
                        )?;
                        self.fs_relocate(pair, parent_mdir.pair)?;
                        pair = parent_mdir.pair;
                        self.gstate.prep_orphans(-1);
                        resolved += 1;
                        let _ = name;
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Finds which segment of `start`'s tail chain currently lists `id`
    /// among its live entries (spec.md §4.7: handles follow the TAIL past
    /// a split). Returns `None` if `id` isn't present anywhere in the
    /// chain (it was deleted).
    fn locate_id_in_chain(&mut self, start: [u32; 2], id: u16) -> Result<Option<[u32; 2]>> {
        let mut pair = start;
        loop {
            let (mdir, entries) = dir::lookup(&mut self.cd, pair)?;
            if entries.iter().any(|(eid, _, _, _)| *eid == id) {
                return Ok(Some(pair));
            }
            match mdir.tail {
                Some(next) => pair = next,
                None => return Ok(None),
            }
        }
    }

    /// The post-commit pass spec.md §4.7 describes: every registered
    /// handle whose `dir_pair` started in `dir_pair` is re-resolved to
    /// whichever segment of the chain now holds its id, or nulled
    /// (`tag::ID_NONE`) if a DELETE removed it.
    fn refresh_handles_in(&mut self, dir_pair: [u32; 2]) -> Result<()> {
        let affected: Vec<usize> = self
            .open_handles
            .iter()
            .enumerate()
            .filter(|(_, h)| h.dir_pair == dir_pair)
            .map(|(i, _)| i)
            .collect();
        for i in affected {
            let id = self.open_handles[i].file_id;
            if id == tag::ID_NONE {
                continue;
            }
            match self.locate_id_in_chain(dir_pair, id)? {
                Some(new_pair) => self.open_handles[i].dir_pair = new_pair,
                None => self.open_handles[i].file_id = tag::ID_NONE,
            }
        }
        Ok(())
    }

    /// Re-syncs `file`'s `(dir_pair, id)` from its registry entry before
    /// any operation touches it, so a handle that was migrated or
    /// invalidated by a later commit on another handle observes that
    /// state without needing its own extra round trip.
    fn sync_handle(&mut self, file: &mut File) {
        if let Some(entry) = self
            .open_handles
            .iter()
            .find(|h| h.id == file.handle_id())
        {
            file.dir_pair = entry.dir_pair;
            file.id = entry.file_id;
        }
    }

    /// True if `a` and `b` name the same physical MDIR, ignoring storage
    /// order: ordinary compaction swaps `pair[0]`/`pair[1]` on every
    /// commit without relocating anything, so a plain `a == b` would flag
    /// every routine compaction as a relocation.
    fn same_pair_set(a: [u32; 2], b: [u32; 2]) -> bool {
        (a[0] == b[0] && a[1] == b[1]) || (a[0] == b[1] && a[1] == b[0])
    }

    /// Finds the directory entry, anywhere in the tree, whose DIR_STRUCT
    /// payload still points at `target` -- the stale parent reference left
    /// behind when `target` physically relocates (spec.md §4.3.3 step 1,
    /// §9 "observe that the root pair has moved"). Walks each directory's
    /// own tail chain as well as the subdirectory tree, like
    /// `deorphan_sweep`/`traverse_live`.
    fn find_parent_ref(&mut self, target: [u32; 2]) -> Result<Option<([u32; 2], u16)>> {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![self.root];
        while let Some(start) = stack.pop() {
            let mut pair = start;
            loop {
                if !seen.insert(pair) {
                    break;
                }
                let (mdir, entries) = dir::lookup(&mut self.cd, pair)?;
                for (id, kind, _, child) in &entries {
                    if *kind != EntryKind::Dir {
                        continue;
                    }
                    if let Some(c) = child {
                        if *c == target {
                            return Ok(Some((pair, *id)));
                        }
                        stack.push(*c);
                    }
                }
                match mdir.tail {
                    Some(next) => pair = next,
                    None => break,
                }
            }
        }
        Ok(None)
    }

    /// Fixes up the one place that names an MDIR by its physical pair
    /// after that MDIR genuinely relocates (wear-leveling forcing a fresh
    /// block, spec.md §4.3.3 step 1) rather than merely having its two
    /// halves reordered by an ordinary compaction. Scoped to the current
    /// mount: a relocation is corrected in place the moment it is
    /// observed, so no cross-remount recovery of a stale reference is
    /// needed (the on-disk reference is rewritten before unmounting).
    fn fs_relocate(&mut self, original: [u32; 2], new: [u32; 2]) -> Result<()> {
        if Self::same_pair_set(original, new) {
            return Ok(());
        }
        if self.root == original {
            self.root = new;
            return Ok(());
        }
        if let Some((parent_pair, id)) = self.find_parent_ref(original)? {
            let (mut parent_mdir, _) = mdir::fetch(&mut self.cd, parent_pair, |_, _| false)?;
            let struct_tag = Tag::new(tag::Type1::Struct as u8, tag::chunk::structure::DIR_STRUCT, id, 8);
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&tole32(new[0]));
            payload.extend_from_slice(&tole32(new[1]));
            mdir::commit(
                &mut self.cd,
                &mut self.alloc,
                |_| Ok(()),
                &mut parent_mdir,
                &[Attr::new(struct_tag, payload)],
                GState::ZERO,
                self.config.block_cycles,
            )?;
        } else {
            warn!(
                "relocate: no parent reference found for {:?} -> {:?}",
                original, new
            );
        }
        Ok(())
    }

    pub fn stat(&mut self, path: &str) -> Result<Stat> {
        let entry = dir::resolve(&mut self.cd, self.root, path)?.ok_or(Error::NoEntry)?;
        let size = if entry.kind == EntryKind::Dir {
            0
        } else {
            File::open(&mut self.cd, entry.mdir, entry.id)?.size()
        };
        Ok(Stat {
            kind: entry.kind,
            size,
        })
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.forceconsistency()?;
        let (parent_path, name) = split_path(path);
        let parent = dir::resolve(&mut self.cd, self.root, parent_path)?.ok_or(Error::NoEntry)?;
        let parent_pair = parent.child.unwrap_or(self.root);

        let child = self.alloc.alloc(&mut |_| Ok(()))?;
        let sibling = self.alloc.alloc(&mut |_| Ok(()))?;
        self.cd.erase(child)?;
        self.cd.erase(sibling)?;
        self.cd.sync(false)?;

        let new_parent_pair = dir::create(
            &mut self.cd,
            &mut self.alloc,
            |_| Ok(()),
            parent_pair,
            name,
            EntryKind::Dir,
            Some([child, sibling]),
            self.config.block_cycles,
        )?;
        self.fs_relocate(parent_pair, new_parent_pair)?;
        self.refresh_handles_in(new_parent_pair)
    }

    pub fn open(&mut self, path: &str, create: bool) -> Result<File> {
        self.forceconsistency()?;
        let mut file = match dir::resolve(&mut self.cd, self.root, path)? {
            Some(entry) if entry.kind == EntryKind::Reg => {
                File::open(&mut self.cd, entry.mdir, entry.id)?
            }
            Some(_) => return Err(Error::IsDir),
            None if create => {
                let (parent_path, name) = split_path(path);
                let parent =
                    dir::resolve(&mut self.cd, self.root, parent_path)?.ok_or(Error::NoEntry)?;
                let parent_pair = parent.child.unwrap_or(self.root);
                let new_parent_pair = dir::create(
                    &mut self.cd,
                    &mut self.alloc,
                    |_| Ok(()),
                    parent_pair,
                    name,
                    EntryKind::Reg,
                    None,
                    self.config.block_cycles,
                )?;
                self.fs_relocate(parent_pair, new_parent_pair)?;
                let entry = dir::find_by_name(&mut self.cd, new_parent_pair, name)?
                    .ok_or(Error::Corrupt)?;
                File::open(&mut self.cd, entry.mdir, entry.id)?
            }
            None => return Err(Error::NoEntry),
        };

        self.next_handle += 1;
        let handle_id = self.next_handle;
        file.set_handle_id(handle_id);
        self.open_handles.push(OpenHandle {
            id: handle_id,
            dir_pair: file.dir_pair,
            file_id: file.id,
        });
        Ok(file)
    }

    /// Flushes `file`'s pending state and drops it from the open-handle
    /// list (spec.md §4's "linked open-handle list").
    pub fn close(&mut self, file: &mut File) -> Result<()> {
        self.sync_file(file)?;
        self.open_handles.retain(|h| h.id != file.handle_id());
        Ok(())
    }

    pub fn read(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        self.sync_handle(file);
        if file.id == tag::ID_NONE {
            return Err(Error::BadFileDescriptor);
        }
        file.read(&mut self.cd, buf)
    }

    pub fn write(&mut self, file: &mut File, buf: &[u8]) -> Result<usize> {
        self.sync_handle(file);
        if file.id == tag::ID_NONE {
            return Err(Error::BadFileDescriptor);
        }
        file.write(&mut self.cd, &mut self.alloc, &self.config, buf)
    }

    pub fn sync_file(&mut self, file: &mut File) -> Result<()> {
        self.sync_handle(file);
        if file.id == tag::ID_NONE {
            return Err(Error::BadFileDescriptor);
        }
        let old_pair = file.dir_pair;
        let new_pair = file.sync(&mut self.cd, &mut self.alloc, |_| Ok(()), self.config.block_cycles)?;
        self.alloc.ack();
        self.fs_relocate(old_pair, new_pair)?;
        file.dir_pair = new_pair;
        if let Some(entry) = self
            .open_handles
            .iter_mut()
            .find(|h| h.id == file.handle_id())
        {
            entry.dir_pair = file.dir_pair;
        }
        Ok(())
    }

    /// Sets a user attribute on `file` (SPEC_FULL.md's added attribute
    /// API, wired to a public surface since `File`'s own methods need a
    /// `&mut CachedDevice` the caller never otherwise has access to).
    pub fn set_attr(&mut self, file: &mut File, kind: u8, value: &[u8]) -> Result<()> {
        self.sync_handle(file);
        let old_pair = file.dir_pair;
        let new_pair = file.set_attr(
            &mut self.cd,
            &mut self.alloc,
            |_| Ok(()),
            kind,
            value,
            self.config.block_cycles,
        )?;
        self.fs_relocate(old_pair, new_pair)?;
        file.dir_pair = new_pair;
        Ok(())
    }

    pub fn get_attr(&mut self, file: &File, kind: u8) -> Result<Option<Vec<u8>>> {
        file.get_attr(&mut self.cd, kind)
    }

    pub fn remove_attr(&mut self, file: &mut File, kind: u8) -> Result<()> {
        self.sync_handle(file);
        let old_pair = file.dir_pair;
        let new_pair = file.remove_attr(
            &mut self.cd,
            &mut self.alloc,
            |_| Ok(()),
            kind,
            self.config.block_cycles,
        )?;
        self.fs_relocate(old_pair, new_pair)?;
        file.dir_pair = new_pair;
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.forceconsistency()?;
        let (parent_path, name) = split_path(path);
        let parent = dir::resolve(&mut self.cd, self.root, parent_path)?.ok_or(Error::NoEntry)?;
        let parent_pair = parent.child.unwrap_or(self.root);
        let new_parent_pair = dir::remove(
            &mut self.cd,
            &mut self.alloc,
            |_| Ok(()),
            parent_pair,
            name,
            self.config.block_cycles,
        )?;
        self.fs_relocate(parent_pair, new_parent_pair)?;
        self.refresh_handles_in(new_parent_pair)
    }

    /// Routes to `dir::rename_within` when both paths share a parent, or
    /// `dir::rename_across` for the general case (spec.md §4.6(2)); either
    /// way the open-handle list for both parents is refreshed afterward.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.forceconsistency()?;
        let (from_parent_path, from_name) = split_path(from);
        let (to_parent_path, to_name) = split_path(to);
        let from_parent = dir::resolve(&mut self.cd, self.root, from_parent_path)?
            .ok_or(Error::NoEntry)?;
        let from_pair = from_parent.child.unwrap_or(self.root);
        let to_parent = dir::resolve(&mut self.cd, self.root, to_parent_path)?
            .ok_or(Error::NoEntry)?;
        let to_pair = to_parent.child.unwrap_or(self.root);

        if from_pair == to_pair {
            let new_pair = dir::rename_within(
                &mut self.cd,
                &mut self.alloc,
                |_| Ok(()),
                from_pair,
                from_name,
                to_name,
                self.config.block_cycles,
            )?;
            self.fs_relocate(from_pair, new_pair)?;
            self.refresh_handles_in(new_pair)
        } else {
            let (new_from_pair, new_to_pair) = dir::rename_across(
                &mut self.cd,
                &mut self.alloc,
                |_| Ok(()),
                from_pair,
                from_name,
                to_pair,
                to_name,
                self.config.block_cycles,
            )?;
            self.fs_relocate(from_pair, new_from_pair)?;
            self.fs_relocate(to_pair, new_to_pair)?;
            self.refresh_handles_in(new_from_pair)?;
            self.refresh_handles_in(new_to_pair)
        }
    }

    pub fn readdir(&mut self, path: &str) -> Result<Vec<(String, EntryKind)>> {
        let entry = dir::resolve(&mut self.cd, self.root, path)?.ok_or(Error::NoEntry)?;
        let pair = entry.child.unwrap_or(self.root);
        dir::readdir(&mut self.cd, pair)
    }

    /// Marks every block reachable from the root directory tree -- every
    /// MDIR pair in every directory's own tail/split chain, every
    /// subdirectory recursively, and every data block in every regular
    /// file's CTZ list -- the allocator's lookahead-refill callback
    /// (spec.md §9 "callback traversal", §4.2's soundness invariant A1).
    pub fn traverse_live(&mut self, mark: &mut dyn FnMut(u32)) -> Result<()> {
        mark(SUPERBLOCK_PAIR[0]);
        mark(SUPERBLOCK_PAIR[1]);

        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![self.root];
        while let Some(start) = stack.pop() {
            let mut pair = start;
            loop {
                if !seen.insert(pair) {
                    break;
                }
                mark(pair[0]);
                mark(pair[1]);
                let (mdir, entries) = dir::lookup(&mut self.cd, pair)?;
                for (id, kind, _, child) in &entries {
                    match kind {
                        EntryKind::Dir => {
                            if let Some(c) = child {
                                stack.push(*c);
                            }
                        }
                        EntryKind::Reg => {
                            let file = File::open(&mut self.cd, pair, *id)?;
                            if let Some((head, size)) = file.ctz_location() {
                                ctz::traverse(&mut self.cd, head, size, |b| mark(b))?;
                            }
                        }
                    }
                }
                match mdir.tail {
                    Some(next) => pair = next,
                    None => break,
                }
            }
        }
        Ok(())
    }

    pub fn fs_size(&mut self) -> Result<u32> {
        let mut seen = std::collections::HashSet::new();
        self.traverse_live(&mut |b| {
            seen.insert(b);
        })?;
        Ok(seen.len() as u32)
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::ram::RamBlockDevice;
    use block_device::Geometry;

    fn geometry() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
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
    fn format_then_mount_round_trips() {
        let dev = RamBlockDevice::new(geometry());
        let fs = Lfs::format(dev, config()).unwrap();
        drop(fs);
    }

    #[test]
    fn mkdir_then_readdir_shows_child() {
        let dev = RamBlockDevice::new(geometry());
        let mut fs = Lfs::format(dev, config()).unwrap();
        fs.mkdir("/docs").unwrap();
        let entries = fs.readdir("").unwrap();
        assert!(entries.iter().any(|(n, k)| n == "docs" && *k == EntryKind::Dir));
    }

    #[test]
    fn open_create_write_read_round_trips() {
        let dev = RamBlockDevice::new(geometry());
        let mut fs = Lfs::format(dev, config()).unwrap();
        let mut f = fs.open("boot_count", true).unwrap();
        fs.write(&mut f, &tole32(41)).unwrap();
        fs.sync_file(&mut f).unwrap();

        let mut f2 = fs.open("boot_count", false).unwrap();
        let mut buf = [0u8; 4];
        fs.read(&mut f2, &mut buf).unwrap();
        assert_eq!(crate::util::fromle32(&buf), 41);
    }

    #[test]
    fn rename_across_directories_moves_entry() {
        let dev = RamBlockDevice::new(geometry());
        let mut fs = Lfs::format(dev, config()).unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        let mut f = fs.open("/a/note", true).unwrap();
        fs.write(&mut f, b"hi").unwrap();
        fs.sync_file(&mut f).unwrap();

        fs.rename("/a/note", "/b/note").unwrap();
        assert!(dir::resolve(&mut fs.cd, fs.root, "/a/note").unwrap().is_none());
        let moved = dir::resolve(&mut fs.cd, fs.root, "/b/note").unwrap();
        assert!(moved.is_some());
    }

    #[test]
    fn close_invalidates_the_handle() {
        let dev = RamBlockDevice::new(geometry());
        let mut fs = Lfs::format(dev, config()).unwrap();
        let mut f = fs.open("boot_count", true).unwrap();
        fs.close(&mut f).unwrap();
        assert!(fs.write(&mut f, b"x").is_err());
    }
}
