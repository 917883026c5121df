//! In-memory block device, the backend used by every unit test and by
//! scenario tests that don't care about durability across process restarts.
//!
//! Grounded in the teacher's `MemoryDiskDriver` (`disk_driver/src/memory.rs`):
//! same erase-fills-with-a-sentinel-byte, same bounds-checked read/prog, but
//! sized from a real `Geometry` instead of a hardcoded constant.

use crate::{BlockDevice, DeviceError, Geometry, Result};

/// Byte value a freshly erased block reads back as. NOR/NAND flash erases
/// to all-ones; matching that (rather than zero) catches callers that
/// forgot to erase before programming.
const ERASED_BYTE: u8 = 0xff;

pub struct RamBlockDevice {
    geometry: Geometry,
    data: Vec<u8>,
    erased: Vec<bool>,
    pub read_count: u64,
    pub prog_count: u64,
    pub erase_count: u64,
}

impl RamBlockDevice {
    pub fn new(geometry: Geometry) -> Self {
        let size = geometry.device_size() as usize;
        Self {
            geometry,
            data: vec![ERASED_BYTE; size],
            erased: vec![true; geometry.block_count as usize],
            read_count: 0,
            prog_count: 0,
            erase_count: 0,
        }
    }

    fn block_range(&self, block: u32, off: u32, len: usize) -> std::ops::Range<usize> {
        let base = block as usize * self.geometry.block_size as usize + off as usize;
        base..base + len
    }
}

impl BlockDevice for RamBlockDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(off % self.geometry.read_size, 0);
        debug_assert_eq!(buf.len() as u32 % self.geometry.read_size, 0);
        if block >= self.geometry.block_count
            || off + buf.len() as u32 > self.geometry.block_size
        {
            return Err(DeviceError::Io);
        }
        self.read_count += 1;
        let range = self.block_range(block, off, buf.len());
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(off % self.geometry.prog_size, 0);
        debug_assert_eq!(buf.len() as u32 % self.geometry.prog_size, 0);
        if block >= self.geometry.block_count
            || off + buf.len() as u32 > self.geometry.block_size
        {
            return Err(DeviceError::Io);
        }
        self.prog_count += 1;
        let range = self.block_range(block, off, buf.len());
        self.data[range].copy_from_slice(buf);
        self.erased[block as usize] = false;
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        if block >= self.geometry.block_count {
            return Err(DeviceError::Io);
        }
        self.erase_count += 1;
        let range = self.block_range(block, 0, self.geometry.block_size as usize);
        self.data[range].fill(ERASED_BYTE);
        self.erased[block as usize] = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 8,
        }
    }

    #[test]
    fn erase_resets_to_erased_byte() {
        let mut dev = RamBlockDevice::new(geometry());
        dev.prog(0, 0, &[0u8; 16]).unwrap();
        dev.erase(0).unwrap();
        let mut buf = [0u8; 16];
        dev.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [ERASED_BYTE; 16]);
    }

    #[test]
    fn out_of_range_block_is_io_error() {
        let mut dev = RamBlockDevice::new(geometry());
        let mut buf = [0u8; 16];
        assert_eq!(dev.read(100, 0, &mut buf), Err(DeviceError::Io));
    }
}
