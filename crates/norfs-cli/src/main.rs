#![forbid(unsafe_code)]
//! Host image tool for NorFS.
//!
//! Builds, lists, and copies files in and out of raw flash images: the
//! same byte-for-byte format the on-device engine mounts.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use norfs_core::{FileHandle, Norfs};
use norfs_device::{MemFlash, SharedMemFlash};
use norfs_types::SECTOR_SIZE;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default image geometry: 3 MiB of 4 KiB sectors.
const DEFAULT_SECTORS: u16 = 768;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "norfs", about = "NorFS — NOR-flash filesystem image tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh image, optionally preloading a directory of files.
    Mkfs {
        /// Path of the image file to create.
        #[arg(long)]
        image: PathBuf,
        /// Number of 4 KiB sectors in the image.
        #[arg(long, default_value_t = DEFAULT_SECTORS)]
        sectors: u16,
        /// Directory whose regular files are copied into the image.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List the files in an image.
    Ls {
        /// Path of the image file.
        #[arg(long)]
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Copy a host file into an image.
    Cpto {
        /// Path of the image file.
        #[arg(long)]
        image: PathBuf,
        /// Host file to copy in (its base name becomes the image name).
        #[arg(long)]
        file: PathBuf,
    },
    /// Copy a file out of an image to the host.
    Cpfrom {
        /// Path of the image file.
        #[arg(long)]
        image: PathBuf,
        /// Host path to write (its base name is looked up in the image).
        #[arg(long)]
        file: PathBuf,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ListingOutput {
    epoch: i64,
    total_sectors: u16,
    free_bytes: u64,
    files: Vec<norfs_core::DirEntry>,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs {
            image,
            sectors,
            dir,
        } => mkfs(&image, sectors, dir.as_deref()),
        Command::Ls { image, json } => ls(&image, json),
        Command::Cpto { image, file } => cpto(&image, &file),
        Command::Cpfrom { image, file } => cpfrom(&image, &file),
    }
}

// ── Image plumbing ──────────────────────────────────────────────────────────

fn load_image(path: &Path) -> Result<(SharedMemFlash, Norfs)> {
    let bytes = fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    let flash = SharedMemFlash::new(
        MemFlash::from_image(&bytes).with_context(|| format!("parsing {}", path.display()))?,
    );
    let norfs = Norfs::new(Box::new(flash.clone()));
    norfs
        .mount()
        .with_context(|| format!("mounting {}", path.display()))?;
    Ok((flash, norfs))
}

fn store_image(path: &Path, flash: &SharedMemFlash) -> Result<()> {
    fs::write(path, flash.image()).with_context(|| format!("writing image {}", path.display()))
}

fn image_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))
}

/// Stream a host file into an open image file handle.
fn copy_in(handle: &mut FileHandle, bytes: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        let end = bytes.len().min(offset + SECTOR_SIZE);
        let written = handle.write(&bytes[offset..end])?;
        if written == 0 {
            bail!("image ran out of space");
        }
        offset += written;
    }
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

fn mkfs(image: &Path, sectors: u16, dir: Option<&Path>) -> Result<()> {
    let flash = SharedMemFlash::new(MemFlash::new(sectors));
    let norfs = Norfs::new(Box::new(flash.clone()));
    norfs
        .mkfs()
        .with_context(|| format!("formatting {sectors} sectors"))?;

    if let Some(dir) = dir {
        norfs.mount().context("mounting fresh image")?;
        let mut names: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("reading directory {}", dir.display()))?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        names.sort();
        for path in names {
            let name = image_name(&path)?;
            if name.starts_with('.') {
                continue;
            }
            let bytes =
                fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let mut handle = norfs
                .open(name, "wb")
                .with_context(|| format!("creating {name} in image"))?;
            copy_in(&mut handle, &bytes).with_context(|| format!("copying {name}"))?;
            handle.close().with_context(|| format!("closing {name}"))?;
            println!("added {name} ({} bytes)", bytes.len());
        }
        norfs.umount().context("unmounting image")?;
    }

    store_image(image, &flash)
}

fn ls(image: &Path, json: bool) -> Result<()> {
    let (_flash, norfs) = load_image(image)?;
    let stats = norfs.stats()?;

    let mut files = Vec::new();
    let mut cursor = norfs.opendir()?;
    while let Some(entry) = norfs.readdir(&mut cursor)? {
        files.push(entry);
    }
    norfs.umount()?;

    if json {
        let output = ListingOutput {
            epoch: stats.epoch,
            total_sectors: stats.total_sectors,
            free_bytes: stats.free_bytes,
            files,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "{} sectors, epoch {}, {} bytes free",
            stats.total_sectors, stats.epoch, stats.free_bytes
        );
        for entry in &files {
            println!("{:>10}  {}", entry.len, entry.name);
        }
    }
    Ok(())
}

fn cpto(image: &Path, file: &Path) -> Result<()> {
    let name = image_name(file)?;
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    let (flash, norfs) = load_image(image)?;
    let mut handle = norfs
        .open(name, "wb")
        .with_context(|| format!("creating {name} in image"))?;
    copy_in(&mut handle, &bytes).with_context(|| format!("copying {name}"))?;
    handle.close().with_context(|| format!("closing {name}"))?;
    norfs.umount()?;

    store_image(image, &flash)
}

fn cpfrom(image: &Path, file: &Path) -> Result<()> {
    let name = image_name(file)?;

    let (_flash, norfs) = load_image(image)?;
    let mut handle = norfs
        .open(name, "rb")
        .with_context(|| format!("opening {name} in image"))?;
    let len = handle.size()? as usize;
    let mut bytes = vec![0_u8; len];
    let mut offset = 0;
    while offset < len {
        let read = handle.read(&mut bytes[offset..])?;
        if read == 0 {
            bail!("unexpected end of {name} at {offset}/{len}");
        }
        offset += read;
    }
    handle.close()?;
    norfs.umount()?;

    fs::write(file, &bytes).with_context(|| format!("writing {}", file.display()))?;
    println!("extracted {name} ({len} bytes)");
    Ok(())
}
