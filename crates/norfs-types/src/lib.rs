#![forbid(unsafe_code)]
//! Shared vocabulary for the NorFS on-flash format.
//!
//! Constants, geometry derivations, little-endian field codecs, and the
//! open-mode / seek vocabulary used across the workspace. No I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Erase/program granule of the underlying NOR flash, in bytes.
pub const SECTOR_SIZE: usize = 4096;

/// Number of redundant superblock slots rotated at the head of the device.
pub const FAT_COPIES: u16 = 8;

/// Fixed width of a file name field, in bytes. Names are NUL-padded but not
/// required to be NUL-terminated when they fill the field.
pub const NAME_LEN: usize = 24;

/// FAT terminator: last sector of a chain, or a reserved superblock slot.
pub const FAT_EOF: u16 = 0xFFF;

/// 64-bit format magic at byte 0 of every superblock copy.
pub const FS_MAGIC: u64 = 0x00DE_AD0B_EEF0_F00D;

/// Hard ceiling on sector count imposed by the 12-bit FAT entries. The
/// one-sector superblock tightens this further; see [`file_entries_for`].
pub const MAX_SECTORS: u16 = 4096;

/// Fixed superblock header: magic (8) + epoch (8) + totalSectors (4) + crc (4).
pub const SUPERBLOCK_HEADER_LEN: usize = 24;

/// On-flash size of one file entry: name (24) + start sector (4) + length (4).
pub const FILE_ENTRY_LEN: usize = NAME_LEN + 8;

/// Bytes occupied by the packed 12-bit FAT for `total_sectors` entries.
#[must_use]
pub fn fat_len_bytes(total_sectors: u16) -> usize {
    (usize::from(total_sectors) * 12).div_ceil(8)
}

/// Number of file entries that fit in one sector alongside the header and
/// the packed FAT, or `None` when not even one fits (sector count too large
/// for a single-sector superblock).
#[must_use]
pub fn file_entries_for(total_sectors: u16) -> Option<usize> {
    let fixed = SUPERBLOCK_HEADER_LEN + fat_len_bytes(total_sectors);
    let spare = SECTOR_SIZE.checked_sub(fixed)?;
    let entries = spare / FILE_ENTRY_LEN;
    (entries > 0).then_some(entries)
}

// ── Field codecs ────────────────────────────────────────────────────────────

/// Parse-level failure decoding an on-flash structure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    write_le_u64(data, offset, u64::from_le_bytes(value.to_le_bytes()))
}

/// Decode a NUL-padded fixed-width name field into a `String`.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Canonicalize a file name into its fixed-width on-flash field: truncated
/// to [`NAME_LEN`] bytes, cut at the first NUL, zero-padded.
#[must_use]
pub fn name_field(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0_u8; NAME_LEN];
    for (slot, byte) in out.iter_mut().zip(name.bytes()) {
        if byte == 0 {
            break;
        }
        *slot = byte;
    }
    out
}

// ── Open-mode / seek vocabulary ─────────────────────────────────────────────

/// Origin for [`seek`](https://en.cppreference.com/w/c/io/fseek)-style
/// repositioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    /// Absolute offset from the start of the file.
    Set,
    /// Relative to the current read cursor.
    Cur,
    /// Relative to the end of the file.
    End,
}

/// Decoded C-style `fopen` mode string.
///
/// `read`/`write` gate the two data paths; `append` pins the write cursor to
/// end-of-file; `truncate` discards existing content on open; `create` allows
/// the file to not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
}

impl OpenMode {
    /// Parse `r`, `r+`, `w`, `w+`, `a`, `a+`, each with an optional trailing
    /// `b` (accepted and ignored). Anything else is rejected.
    #[must_use]
    pub fn parse(mode: &str) -> Option<Self> {
        let (read, write, append, truncate, create) = match mode {
            "r" | "rb" => (true, false, false, false, false),
            "r+" | "r+b" => (true, true, false, false, false),
            "w" | "wb" => (false, true, false, true, true),
            "w+" | "w+b" => (true, true, false, true, true),
            "a" | "ab" => (false, true, true, false, true),
            "a+" | "a+b" => (true, true, true, false, true),
            _ => return None,
        };
        Some(Self {
            read,
            write,
            append,
            truncate,
            create,
        })
    }

    /// Whether the handle carries the one-sector dirty write buffer.
    #[must_use]
    pub fn writable(self) -> bool {
        self.write || self.append
    }
}
