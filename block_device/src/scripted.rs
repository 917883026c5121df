//! Fault-injecting wrapper used by crash-safety tests.
//!
//! Shaped after the teacher's `CacheDiskDriver<T: DiskDriver>`
//! (`disk_driver/src/cache.rs`): a generic pass-through wrapper around any
//! `BlockDevice`. Where the teacher's wrapper wired in transparent caching,
//! this one wires in scripted failures, because the cached layer in this
//! workspace lives inside the engine crate (spec.md component 2) rather
//! than the raw port.

use crate::{BlockDevice, DeviceError, Geometry, Result};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Prog,
    Erase,
}

/// Wraps `inner`, counting `prog`/`erase` calls and returning
/// `DeviceError::Corrupt` the Nth time the scripted op is invoked instead of
/// performing it. This is how spec.md §8 scenarios 2, 5, and 6 ("simulate
/// crash at every prog/erase index") are driven: run the same operation
/// sequence once per candidate crash point, incrementing `at` each time.
pub struct ScriptedBlockDevice<D> {
    inner: D,
    op: Op,
    at: u64,
    calls: u64,
    pub tripped: bool,
}

impl<D: BlockDevice> ScriptedBlockDevice<D> {
    pub fn new(inner: D, op: Op, at: u64) -> Self {
        Self {
            inner,
            op,
            at,
            calls: 0,
            tripped: false,
        }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn maybe_trip(&mut self, op: Op) -> Result<()> {
        if op == self.op {
            let n = self.calls;
            self.calls += 1;
            if n == self.at {
                self.tripped = true;
                warn!("scripted fault: {:?} #{} injected as Corrupt", op, n);
                return Err(DeviceError::Corrupt);
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for ScriptedBlockDevice<D> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        self.inner.read(block, off, buf)
    }

    fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<()> {
        self.maybe_trip(Op::Prog)?;
        self.inner.prog(block, off, buf)
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        self.maybe_trip(Op::Erase)?;
        self.inner.erase(block)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::RamBlockDevice;

    fn geometry() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 8,
        }
    }

    #[test]
    fn trips_on_the_nth_prog() {
        let ram = RamBlockDevice::new(geometry());
        let mut dev = ScriptedBlockDevice::new(ram, Op::Prog, 1);
        dev.prog(0, 0, &[1u8; 16]).unwrap();
        assert_eq!(dev.prog(0, 16, &[1u8; 16]), Err(DeviceError::Corrupt));
        assert!(dev.tripped);
    }
}
