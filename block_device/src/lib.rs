//! Raw block-device port.
//!
//! This crate is the external collaborator spec'd as "out of scope" for the
//! core engine: a `BlockDevice` is just four operations plus a declared
//! geometry. The engine (in the sibling `littlefs_core` crate) never reads
//! or writes a device directly except through this trait.

pub mod file;
pub mod ram;
pub mod scripted;

use std::fmt;

/// Fixed at format time and never renegotiated for the life of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Minimum read granularity and alignment, in bytes.
    pub read_size: u32,
    /// Minimum program granularity and alignment, in bytes.
    pub prog_size: u32,
    /// Erase granularity; every read/prog offset and size must also fit
    /// inside a single block.
    pub block_size: u32,
    /// Total number of addressable blocks on the device.
    pub block_count: u32,
}

impl Geometry {
    pub fn device_size(&self) -> u64 {
        self.block_size as u64 * self.block_count as u64
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The medium could not be read, programmed, or erased; hints that the
    /// block is going bad and should be relocated.
    #[error("corrupt block")]
    Corrupt,
    /// The underlying transport (file, bus, ...) failed for reasons other
    /// than media corruption.
    #[error("i/o error")]
    Io,
}

pub type Result<T> = core::result::Result<T, DeviceError>;

/// The raw storage port. Every offset/size pair passed to `read`/`prog` is
/// aligned to `read_size`/`prog_size` respectively and never crosses a
/// block boundary; callers above this trait (the cached block device in
/// `littlefs_core::cache`) are responsible for enforcing that.
pub trait BlockDevice {
    fn geometry(&self) -> Geometry;

    /// Read `buf.len()` bytes from `block` at `off`. `off` and `buf.len()`
    /// are multiples of `read_size`.
    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `buf.len()` bytes to `block` at `off`, assuming the target
    /// range has been erased and not yet programmed. `off` and `buf.len()`
    /// are multiples of `prog_size`.
    fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<()>;

    /// Erase a whole block, leaving every prog-size unit inside it
    /// programmable exactly once.
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Flush any device-level buffering beyond this trait's control.
    fn sync(&mut self) -> Result<()>;
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} blocks x {} bytes (read={}, prog={})",
            self.block_count, self.block_size, self.read_size, self.prog_size
        )
    }
}
