//! Boot-counter demo, spec.md §8 scenario 1: mount, bump a persisted u32
//! counter, unmount. Run it repeatedly against the same image file and
//! the count survives process restarts.
//!
//! Grounded in the teacher's `main.rs` (clap-derived CLI, `env_logger`
//! init, `anyhow::Result` at the binary edge) -- the mount/retry loop
//! there becomes a single straight-line mount/bump/close here since this
//! engine has no FUSE event loop to drive.

use anyhow::Context;
use block_device::file::FileBlockDevice;
use block_device::Geometry;
use clap::Parser;
use littlefs_core::{Config, Lfs};

#[derive(Parser)]
#[command(about = "Bump a counter stored in a littlefs image, once per run")]
struct Args {
    /// Path to the backing image file (created if missing).
    #[arg(long, default_value = "boot_count.img")]
    image: String,

    /// Format a fresh image before mounting.
    #[arg(long)]
    format: bool,
}

fn config() -> Config {
    Config {
        geometry: Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 4096,
            block_count: 128,
        },
        cache_size: 64,
        lookahead_size: 1,
        block_cycles: 100,
        name_max: 255,
        file_max: u32::MAX,
        attr_max: 1022,
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let device = FileBlockDevice::open(&args.image, config().geometry)
        .with_context(|| format!("opening image {}", args.image))?;

    let mut fs = if args.format {
        Lfs::format(device, config()).context("formatting image")?
    } else {
        Lfs::mount(device, config()).context("mounting image")?
    };

    let mut file = fs
        .open("boot_count", true)
        .context("opening boot_count")?;

    let mut buf = [0u8; 4];
    let n = fs.read(&mut file, &mut buf).context("reading counter")?;
    let count = if n == 4 {
        u32::from_le_bytes(buf)
    } else {
        0
    };

    let next = count + 1;
    file.seek(0);
    fs.write(&mut file, &next.to_le_bytes())
        .context("writing counter")?;
    fs.sync_file(&mut file).context("syncing counter")?;

    println!("boot_count: {}", next);
    Ok(())
}
