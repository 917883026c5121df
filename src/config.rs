//! Mount/format configuration. Grounded in the teacher's explicit,
//! validated settings struct (`FsLayoutArgs`/`DiskConst` in
//! `src/rfs_lib/desc.rs`, `disk_driver/src/lib.rs`) — geometry and cache
//! sizing are never guessed from the device, they're supplied and checked
//! up front.

use crate::error::{Error, Result};
use block_device::Geometry;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub geometry: Geometry,
    /// Size of each of the two fixed filesystem-wide buffers (read cache,
    /// program cache). Must be a multiple of `read_size` and `prog_size`.
    pub cache_size: u32,
    /// Width, in bytes, of the allocator's lookahead bitmap.
    pub lookahead_size: u32,
    /// Dynamic wear-leveling threshold: an MDIR forces a relocation every
    /// `block_cycles` revisions. Zero disables wear relocation.
    pub block_cycles: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let g = self.geometry;
        if g.prog_size > g.block_size {
            return Err(Error::Invalid);
        }
        if g.block_count < 2 {
            return Err(Error::Invalid);
        }
        if self.cache_size == 0
            || self.cache_size % g.read_size != 0
            || self.cache_size % g.prog_size != 0
        {
            return Err(Error::Invalid);
        }
        if g.block_size % self.cache_size != 0 {
            return Err(Error::Invalid);
        }
        if self.lookahead_size == 0 {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// The inline-file ceiling, spec.md §9 Open Question 2, resolved as
    /// given: `min(0x3fe, min(cache_size, block_size/8))`.
    pub fn inline_max(&self) -> u32 {
        0x3fe.min(self.cache_size.min(self.geometry.block_size / 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            geometry: Geometry {
                read_size: 16,
                prog_size: 16,
                block_size: 512,
                block_count: 16,
            },
            cache_size: 64,
            lookahead_size: 1,
            block_cycles: 0,
            name_max: 255,
            file_max: u32::MAX,
            attr_max: 1022,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn cache_not_multiple_of_block_fails() {
        let mut c = base();
        c.cache_size = 100;
        assert_eq!(c.validate(), Err(Error::Invalid));
    }

    #[test]
    fn inline_max_bounded() {
        let c = base();
        assert_eq!(c.inline_max(), 64.min(512 / 8));
    }
}
