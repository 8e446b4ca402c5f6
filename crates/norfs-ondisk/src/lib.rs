#![forbid(unsafe_code)]
//! On-flash format parsing and encoding for NorFS.
//!
//! Pure format crate — no I/O, no side effects. Encodes and decodes the
//! one-sector superblock (magic, epoch, sector count, CRC, file-entry
//! table, packed 12-bit FAT), and exposes the packed-FAT codec and the
//! 16-byte slot-header probe used by the mount and flush scans.
//!
//! Superblock layout (all integers little-endian):
//!
//! | offset | field                                          |
//! |--------|------------------------------------------------|
//! | 0      | magic (u64)                                    |
//! | 8      | epoch (i64)                                    |
//! | 16     | totalSectors (u32)                             |
//! | 20     | crc32 (u32), zeroed during CRC computation     |
//! | 24     | file entries: {name[24], start:u32, len:u32} × N |
//! | …      | packed FAT, `(totalSectors*12+7)/8` bytes      |
//! | …      | zero pad to the end of the sector              |
//!
//! The CRC covers the whole sector, pad included, with the crc field read
//! as zero. The function is CRC-32/ISO-HDLC (reflected `0xEDB88320`), the
//! same value `crc32fast` computes.

use norfs_types::{
    FAT_COPIES, FILE_ENTRY_LEN, FS_MAGIC, MAX_SECTORS, NAME_LEN, ParseError, SECTOR_SIZE,
    SUPERBLOCK_HEADER_LEN, fat_len_bytes, file_entries_for, read_fixed, read_le_i64, read_le_u32,
    read_le_u64, write_le_i64, write_le_u32, write_le_u64,
};

mod fat;

pub use fat::PackedFat;

/// Byte offset of the crc32 field inside the superblock.
pub const CRC_OFFSET: usize = 16 + 4;

// ── Slot header ─────────────────────────────────────────────────────────────

/// The first 16 bytes of a superblock slot: enough to rank copies by epoch
/// without reading the full sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHeader {
    pub magic: u64,
    pub epoch: i64,
}

impl SlotHeader {
    pub const LEN: usize = 16;

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_le_u64(bytes, 0)?,
            epoch: read_le_i64(bytes, 8)?,
        })
    }

    /// Whether the slot carries the format magic at all.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == FS_MAGIC
    }
}

// ── File entries ────────────────────────────────────────────────────────────

/// One fixed record in the superblock's file table.
///
/// A slot whose name starts with a zero byte is free; `start` is the first
/// sector of the file's FAT chain and `len` its byte length (0 is a valid
/// length: created, nothing written).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub name: [u8; NAME_LEN],
    pub start: u16,
    pub len: u32,
}

impl FileEntry {
    pub const FREE: Self = Self {
        name: [0; NAME_LEN],
        start: 0,
        len: 0,
    };

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.name[0] == 0
    }

    fn decode(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let name = read_fixed::<NAME_LEN>(bytes, offset)?;
        let start = read_le_u32(bytes, offset + NAME_LEN)?;
        let len = read_le_u32(bytes, offset + NAME_LEN + 4)?;
        let start = u16::try_from(start).map_err(|_| ParseError::InvalidField {
            field: "file_entry.start",
            reason: "start sector exceeds the sector index range",
        })?;
        Ok(Self { name, start, len })
    }

    fn encode(&self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        bytes[offset..offset + NAME_LEN].copy_from_slice(&self.name);
        write_le_u32(bytes, offset + NAME_LEN, u32::from(self.start))?;
        write_le_u32(bytes, offset + NAME_LEN + 4, self.len)
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// In-RAM image of one superblock sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    epoch: i64,
    total_sectors: u16,
    entries: Vec<FileEntry>,
    fat: PackedFat,
}

impl Superblock {
    /// A blank superblock for a part with `total_sectors` sectors, epoch 0,
    /// every file entry free, every FAT entry 0.
    ///
    /// Rejects sector counts the format cannot hold: the FAT plus header
    /// plus at least one file entry must fit one sector, and the head of
    /// the device must leave room for data sectors beyond the superblock
    /// copies.
    pub fn new(total_sectors: u16) -> Result<Self, ParseError> {
        if total_sectors <= FAT_COPIES || total_sectors > MAX_SECTORS {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "must exceed the superblock copy count and fit 12-bit indices",
            });
        }
        let Some(entry_count) = file_entries_for(total_sectors) else {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "superblock does not fit one sector at this size",
            });
        };
        Ok(Self {
            epoch: 0,
            total_sectors,
            entries: vec![FileEntry::FREE; entry_count],
            fat: PackedFat::new(total_sectors),
        })
    }

    #[must_use]
    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: i64) {
        self.epoch = epoch;
    }

    #[must_use]
    pub fn total_sectors(&self) -> u16 {
        self.total_sectors
    }

    #[must_use]
    pub fn fat(&self) -> &PackedFat {
        &self.fat
    }

    pub fn fat_mut(&mut self) -> &mut PackedFat {
        &mut self.fat
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn entry(&self, idx: usize) -> Option<&FileEntry> {
        self.entries.get(idx)
    }

    pub fn entry_mut(&mut self, idx: usize) -> Option<&mut FileEntry> {
        self.entries.get_mut(idx)
    }

    #[must_use]
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Encode into a full sector frame with a freshly computed CRC.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![0_u8; SECTOR_SIZE];
        // Infallible: every offset below is in range by construction.
        let _ = write_le_u64(&mut frame, 0, FS_MAGIC);
        let _ = write_le_i64(&mut frame, 8, self.epoch);
        let _ = write_le_u32(&mut frame, 16, u32::from(self.total_sectors));
        for (idx, entry) in self.entries.iter().enumerate() {
            let _ = entry.encode(&mut frame, SUPERBLOCK_HEADER_LEN + idx * FILE_ENTRY_LEN);
        }
        let fat_offset = SUPERBLOCK_HEADER_LEN + self.entries.len() * FILE_ENTRY_LEN;
        frame[fat_offset..fat_offset + self.fat.as_bytes().len()]
            .copy_from_slice(self.fat.as_bytes());
        let crc = frame_crc(&frame);
        let _ = write_le_u32(&mut frame, CRC_OFFSET, crc);
        frame
    }

    /// Decode and validate a full sector frame: magic, sector-count range,
    /// and the CRC over the whole frame with the crc field zeroed.
    pub fn decode(frame: &[u8]) -> Result<Self, ParseError> {
        if frame.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: frame.len(),
            });
        }
        let frame = &frame[..SECTOR_SIZE];

        let magic = read_le_u64(frame, 0)?;
        if magic != FS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FS_MAGIC,
                actual: magic,
            });
        }

        let stored = read_le_u32(frame, CRC_OFFSET)?;
        let computed = frame_crc(frame);
        if stored != computed {
            return Err(ParseError::CrcMismatch { stored, computed });
        }

        let epoch = read_le_i64(frame, 8)?;
        let total = read_le_u32(frame, 16)?;
        let total = u16::try_from(total)
            .ok()
            .filter(|t| *t > FAT_COPIES && *t <= MAX_SECTORS)
            .ok_or(ParseError::InvalidField {
                field: "total_sectors",
                reason: "out of range",
            })?;
        let Some(entry_count) = file_entries_for(total) else {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "superblock does not fit one sector at this size",
            });
        };

        let mut entries = Vec::with_capacity(entry_count);
        for idx in 0..entry_count {
            let entry = FileEntry::decode(frame, SUPERBLOCK_HEADER_LEN + idx * FILE_ENTRY_LEN)?;
            if !entry.is_free() && entry.start >= total {
                return Err(ParseError::InvalidField {
                    field: "file_entry.start",
                    reason: "live entry points past the end of the device",
                });
            }
            entries.push(entry);
        }

        let fat_offset = SUPERBLOCK_HEADER_LEN + entry_count * FILE_ENTRY_LEN;
        let fat = PackedFat::from_bytes(total, &frame[fat_offset..fat_offset + fat_len_bytes(total)]);

        Ok(Self {
            epoch,
            total_sectors: total,
            entries,
            fat,
        })
    }
}

/// CRC over a superblock frame with the crc field read as zero.
#[must_use]
pub fn frame_crc(frame: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[..CRC_OFFSET]);
    hasher.update(&[0_u8; 4]);
    hasher.update(&frame[CRC_OFFSET + 4..]);
    hasher.finalize()
}
