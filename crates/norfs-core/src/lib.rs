#![forbid(unsafe_code)]
//! NorFS access engine.
//!
//! A file-oriented API (open/read/write/seek/close plus directory
//! enumeration) over a flat set of 4 KiB NOR-flash sectors. Metadata lives
//! in a single-sector superblock rotated round-robin across eight redundant
//! slots at the head of the device: each flush stamps a fresh epoch and
//! overwrites the oldest copy, so a power cut can never take out the newest
//! valid copy, and mount picks the highest-epoch survivor whose CRC checks.
//!
//! Files are singly-linked chains through a packed 12-bit FAT. Every open
//! writable handle buffers exactly one dirty sector and traverses its chain
//! lazily; reads from the same handle are served from that buffer when they
//! land on the hot sector, which is what makes read-after-write within a
//! handle hold without flushing.
//!
//! The engine is single-owner and non-reentrant by design: one `Norfs`
//! owns the in-RAM superblock, and handles hold a non-owning capability
//! back into it.

mod file;
mod fs;

pub use file::FileHandle;
pub use fs::{DirCursor, DirEntry, FsStats, Norfs};

pub use norfs_error::{NorfsError, Result};
pub use norfs_types::{OpenMode, Whence};
