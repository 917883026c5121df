//! Error surface. One enum, one `code()` mapping onto the exact negative
//! constants spec.md §6.4 defines, so callers bridging to a C-compatible
//! ABI (as the teacher bridges `fuse`'s `c_int` replies) have a stable
//! number to hand back.

use block_device::DeviceError;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("i/o error")]
    Io,
    #[error("corrupt metadata or data")]
    Corrupt,
    #[error("no such file or directory")]
    NoEntry,
    #[error("file or directory already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file too large")]
    TooBig,
    #[error("invalid argument")]
    Invalid,
    #[error("no space left on device")]
    NoSpace,
    #[error("out of memory")]
    NoMemory,
    #[error("no such attribute")]
    NoAttribute,
    #[error("name too long")]
    NameTooLong,
}

impl Error {
    /// The exact codes from spec.md §6.4.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io => -5,
            Error::Corrupt => -84,
            Error::NoEntry => -2,
            Error::Exists => -17,
            Error::NotDir => -20,
            Error::IsDir => -21,
            Error::NotEmpty => -39,
            Error::BadFileDescriptor => -9,
            Error::TooBig => -27,
            Error::Invalid => -22,
            Error::NoSpace => -28,
            Error::NoMemory => -12,
            Error::NoAttribute => -61,
            Error::NameTooLong => -36,
        }
    }
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Corrupt => Error::Corrupt,
            DeviceError::Io => Error::Io,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
