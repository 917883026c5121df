//! A power-loss-resilient, wear-aware embedded filesystem engine.
//!
//! Mirrors the teacher's crate-root shape (`rfs_lib`'s single top-level
//! module tree re-exporting its subsystems) but swapped to littlefs's own
//! module set: cache, alloc, tag, mdir, ctz, gstate, dir, file, fs.

pub mod alloc;
pub mod cache;
pub mod config;
pub mod ctz;
pub mod dir;
pub mod error;
pub mod file;
pub mod fs;
pub mod gstate;
pub mod mdir;
pub mod tag;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use file::File;
pub use fs::{Lfs, Stat};
