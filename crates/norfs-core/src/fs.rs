#![forbid(unsafe_code)]
//! Filesystem manager: superblock lifecycle, file-entry services, and the
//! free-sector allocator.

use crate::file::FileHandle;
use norfs_device::{FlashDevice, read_partial};
use norfs_error::{NorfsError, Result};
use norfs_ondisk::{SlotHeader, Superblock};
use norfs_types::{
    FAT_COPIES, FAT_EOF, NAME_LEN, OpenMode, SECTOR_SIZE, name_field, trim_nul_padded,
};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, trace};

pub(crate) fn chain_corrupt(detail: &str) -> NorfsError {
    NorfsError::Corrupt(detail.to_owned())
}

// ── Shared state ────────────────────────────────────────────────────────────

/// Mutable filesystem state shared between `Norfs` and its open handles.
///
/// This is the capability surface the file engine calls back into: FAT
/// access, sector I/O, the allocator, and file-entry accessors. `sb` is
/// `Some` exactly while mounted.
pub(crate) struct FsInner {
    dev: Box<dyn FlashDevice>,
    sb: Option<Superblock>,
    dirty: bool,
    rng: SmallRng,
}

impl FsInner {
    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        if self.sb.is_none() {
            return Err(NorfsError::NotMounted);
        }
        Ok(())
    }

    fn sb(&self) -> Result<&Superblock> {
        self.sb.as_ref().ok_or(NorfsError::NotMounted)
    }

    fn sb_mut(&mut self) -> Result<&mut Superblock> {
        self.sb.as_mut().ok_or(NorfsError::NotMounted)
    }

    pub(crate) fn total_sectors(&self) -> Result<u16> {
        Ok(self.sb()?.total_sectors())
    }

    // ── FAT access ──────────────────────────────────────────────────────

    pub(crate) fn fat_get(&self, sector: u16) -> Option<u16> {
        self.sb.as_ref()?.fat().get(sector)
    }

    pub(crate) fn fat_set(&mut self, sector: u16, value: u16) {
        if let Some(sb) = self.sb.as_mut() {
            if sb.fat_mut().set(sector, value) {
                self.dirty = true;
            }
        }
    }

    /// One FAT hop with the checks every chain walk needs: the successor
    /// must be `FAT_EOF` or a live data-sector index.
    pub(crate) fn fat_next(&self, sector: u16) -> Result<u16> {
        let total = self.total_sectors()?;
        let next = self
            .fat_get(sector)
            .ok_or_else(|| chain_corrupt("FAT walk left the sector range"))?;
        if next != FAT_EOF && next >= total {
            return Err(chain_corrupt("FAT chain points past the end of the device"));
        }
        Ok(next)
    }

    // ── Device access ───────────────────────────────────────────────────

    pub(crate) fn erase_sector(&mut self, sector: u16) -> Result<()> {
        self.dev.erase(sector)
    }

    pub(crate) fn program_sector(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        self.dev.program(sector, data)
    }

    pub(crate) fn read_sector(&mut self, sector: u16, buf: &mut [u8]) -> Result<()> {
        self.dev.read_aligned(sector, 0, buf)
    }

    pub(crate) fn read_partial_sector(
        &mut self,
        sector: u16,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        read_partial(self.dev.as_mut(), sector, offset, buf)
    }

    // ── File-entry accessors ────────────────────────────────────────────

    fn entry_field<T>(&self, idx: usize, f: impl FnOnce(&norfs_ondisk::FileEntry) -> T) -> Result<T> {
        self.sb()?
            .entry(idx)
            .map(f)
            .ok_or_else(|| chain_corrupt("file entry index out of range"))
    }

    pub(crate) fn entry_start(&self, idx: usize) -> Result<u16> {
        self.entry_field(idx, |e| e.start)
    }

    pub(crate) fn entry_len(&self, idx: usize) -> Result<u32> {
        self.entry_field(idx, |e| e.len)
    }

    pub(crate) fn entry_name(&self, idx: usize) -> Result<[u8; NAME_LEN]> {
        self.entry_field(idx, |e| e.name)
    }

    /// Guard for handle I/O: the entry must still be live. A handle whose
    /// file was unlinked underneath it would otherwise walk the freed
    /// chain straight into the reserved superblock slots.
    pub(crate) fn ensure_entry_live(&self, idx: usize) -> Result<()> {
        if self.entry_field(idx, |e| e.is_free())? {
            return Err(NorfsError::NotFound("file was unlinked".to_owned()));
        }
        Ok(())
    }

    pub(crate) fn set_entry_start(&mut self, idx: usize, start: u16) -> Result<()> {
        let entry = self
            .sb_mut()?
            .entry_mut(idx)
            .ok_or_else(|| chain_corrupt("file entry index out of range"))?;
        entry.start = start;
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn set_entry_len(&mut self, idx: usize, len: u32) -> Result<()> {
        let entry = self
            .sb_mut()?
            .entry_mut(idx)
            .ok_or_else(|| chain_corrupt("file entry index out of range"))?;
        entry.len = len;
        self.dirty = true;
        Ok(())
    }

    fn set_entry_name(&mut self, idx: usize, name: [u8; NAME_LEN]) -> Result<()> {
        let entry = self
            .sb_mut()?
            .entry_mut(idx)
            .ok_or_else(|| chain_corrupt("file entry index out of range"))?;
        entry.name = name;
        self.dirty = true;
        Ok(())
    }

    fn find_by_name(&self, name: &[u8; NAME_LEN]) -> Result<Option<usize>> {
        Ok(self.sb()?.entries().iter().position(|e| e.name == *name))
    }

    fn find_free_entry(&self) -> Result<Option<usize>> {
        Ok(self.sb()?.entries().iter().position(|e| e.is_free()))
    }

    // ── Allocator ───────────────────────────────────────────────────────

    /// Linear probe from a random start over the packed FAT. The random
    /// start spreads data-sector wear without a persistent cursor.
    pub(crate) fn find_free_sector(&mut self) -> Result<u16> {
        let total = self.total_sectors()?;
        let mut sector = self.rng.gen_range(0..total);
        let sb = self.sb()?;
        for _ in 0..total {
            if sb.fat().get(sector) == Some(0) {
                trace!(target: "norfs::alloc", event = "alloc", sector);
                return Ok(sector);
            }
            sector = (sector + 1) % total;
        }
        Err(NorfsError::NoSpace)
    }

    // ── Entry services ──────────────────────────────────────────────────

    fn create_entry(&mut self, name: [u8; NAME_LEN]) -> Result<usize> {
        let idx = self.find_free_entry()?.ok_or(NorfsError::NoSpace)?;
        let sector = self.find_free_sector()?;
        {
            let entry = self
                .sb_mut()?
                .entry_mut(idx)
                .ok_or_else(|| chain_corrupt("file entry index out of range"))?;
            entry.name = name;
            entry.start = sector;
            entry.len = 0;
        }
        self.dirty = true;
        self.fat_set(sector, FAT_EOF);
        debug!(target: "norfs::dir", event = "create", idx, start = sector);
        self.flush_superblock()?;
        Ok(idx)
    }

    fn unlink_entry(&mut self, idx: usize) -> Result<()> {
        let total = self.total_sectors()?;
        let mut sector = self.entry_start(idx)?;
        // Free the whole chain, terminator included.
        let mut terminated = false;
        for _ in 0..=total {
            let next = self.fat_next(sector)?;
            self.fat_set(sector, 0);
            if next == FAT_EOF {
                terminated = true;
                break;
            }
            sector = next;
        }
        if !terminated {
            return Err(chain_corrupt("FAT chain does not terminate"));
        }
        {
            let entry = self
                .sb_mut()?
                .entry_mut(idx)
                .ok_or_else(|| chain_corrupt("file entry index out of range"))?;
            *entry = norfs_ondisk::FileEntry::FREE;
        }
        self.dirty = true;
        debug!(target: "norfs::dir", event = "unlink", idx);
        self.flush_superblock()
    }

    // ── Superblock lifecycle ────────────────────────────────────────────

    fn read_slot_header(&mut self, slot: u16) -> Result<SlotHeader> {
        let mut buf = [0_u8; SlotHeader::LEN];
        read_partial(self.dev.as_mut(), slot, 0, &mut buf)?;
        Ok(SlotHeader::decode(&buf)?)
    }

    /// Slot to overwrite next: the first bad-magic slot (cheapest place to
    /// write), else the one with the lowest epoch.
    fn find_oldest_slot(&mut self) -> Result<u16> {
        let mut oldest = 0_u16;
        let mut oldest_epoch = i64::MAX;
        for slot in 0..FAT_COPIES {
            let header = self.read_slot_header(slot)?;
            if !header.is_valid() {
                return Ok(slot);
            }
            if header.epoch < oldest_epoch {
                oldest = slot;
                oldest_epoch = header.epoch;
            }
        }
        Ok(oldest)
    }

    fn find_newest_slot(&mut self) -> Result<Option<(u16, i64)>> {
        let mut newest: Option<(u16, i64)> = None;
        for slot in 0..FAT_COPIES {
            let header = self.read_slot_header(slot)?;
            if !header.is_valid() {
                continue;
            }
            if newest.is_none_or(|(_, epoch)| header.epoch > epoch) {
                newest = Some((slot, header.epoch));
            }
        }
        Ok(newest)
    }

    /// Persist the in-RAM superblock: bump the epoch, recompute the CRC,
    /// and erase-then-program the oldest slot. A no-op while clean or
    /// unmounted. The newest copy is never touched, so interrupting this
    /// anywhere loses at most the oldest redundant copy.
    pub(crate) fn flush_superblock(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(sb) = self.sb.as_mut() else {
            return Ok(());
        };
        sb.set_epoch(sb.epoch() + 1);
        let epoch = sb.epoch();
        let frame = sb.encode();
        let slot = self.find_oldest_slot()?;
        debug!(target: "norfs::sb", event = "flush", slot, epoch);
        self.dev.erase(slot)?;
        self.dev.program(slot, &frame)?;
        self.dirty = false;
        Ok(())
    }

    fn mkfs(&mut self) -> Result<()> {
        if self.sb.is_some() {
            return Err(NorfsError::AlreadyMounted);
        }
        let total = self.dev.sector_count();
        let mut sb =
            Superblock::new(total).map_err(|e| NorfsError::BadArgument(e.to_string()))?;
        sb.set_epoch(1);
        // The head of the device is the superblock's forever; reserving the
        // slots in the FAT is what keeps the allocator out of them.
        for slot in 0..FAT_COPIES {
            sb.fat_mut().set(slot, FAT_EOF);
        }
        let frame = sb.encode();
        for slot in 0..FAT_COPIES {
            self.dev.erase(slot)?;
            self.dev.program(slot, &frame)?;
        }
        info!(target: "norfs::sb", event = "mkfs", total_sectors = total);
        // One real flush so exactly one slot holds the newest epoch.
        self.sb = Some(sb);
        self.dirty = true;
        let flushed = self.flush_superblock();
        self.sb = None;
        self.dirty = false;
        flushed
    }

    fn mount(&mut self) -> Result<()> {
        if self.sb.is_some() {
            return Err(NorfsError::AlreadyMounted);
        }
        let Some((slot, epoch)) = self.find_newest_slot()? else {
            return Err(NorfsError::NotFound("no valid superblock slot".to_owned()));
        };
        let mut frame = vec![0_u8; SECTOR_SIZE];
        self.dev.read_aligned(slot, 0, &mut frame)?;
        let sb = Superblock::decode(&frame)?;
        if sb.total_sectors() > self.dev.sector_count() {
            return Err(NorfsError::Corrupt(format!(
                "superblock claims {} sectors, device has {}",
                sb.total_sectors(),
                self.dev.sector_count()
            )));
        }
        debug!(
            target: "norfs::sb",
            event = "mount",
            slot,
            epoch,
            total_sectors = sb.total_sectors()
        );
        self.sb = Some(sb);
        self.dirty = false;
        Ok(())
    }

    fn umount(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.flush_superblock()?;
        debug!(target: "norfs::sb", event = "umount");
        self.sb = None;
        self.dirty = false;
        Ok(())
    }
}

// ── Public API ──────────────────────────────────────────────────────────────

/// One live directory enumeration. The cursor owns nothing but the next
/// table index to inspect; dropping it is `closedir`.
#[derive(Debug, Clone)]
pub struct DirCursor {
    next: usize,
}

/// One directory listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub len: u32,
}

/// Filesystem-level counters for host tooling.
#[derive(Debug, Clone, Serialize)]
pub struct FsStats {
    pub epoch: i64,
    pub total_sectors: u16,
    pub free_bytes: u64,
    pub live_files: usize,
    pub file_entries: usize,
}

/// A mounted (or mountable) NorFS filesystem over one flash device.
pub struct Norfs {
    inner: Arc<Mutex<FsInner>>,
}

impl Norfs {
    /// Wrap a flash device. The allocator RNG is seeded from the OS.
    #[must_use]
    pub fn new(dev: Box<dyn FlashDevice>) -> Self {
        Self::with_rng(dev, SmallRng::from_entropy())
    }

    /// Wrap a flash device with a caller-supplied allocator RNG, for
    /// reproducible sector placement.
    #[must_use]
    pub fn with_rng(dev: Box<dyn FlashDevice>, rng: SmallRng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FsInner {
                dev,
                sb: None,
                dirty: false,
                rng,
            })),
        }
    }

    /// Format the device: fresh superblock, all data sectors free, the
    /// head slots reserved. Requires unmounted; the device stays unmounted.
    pub fn mkfs(&self) -> Result<()> {
        self.inner.lock().mkfs()
    }

    /// Locate the newest valid superblock copy and go live.
    pub fn mount(&self) -> Result<()> {
        self.inner.lock().mount()
    }

    /// Flush pending metadata and leave the mounted state.
    pub fn umount(&self) -> Result<()> {
        self.inner.lock().umount()
    }

    /// Open a file with a C-style mode string (`r`, `r+`, `w`, `w+`, `a`,
    /// `a+`, optional trailing `b`).
    pub fn open(&self, name: &str, mode: &str) -> Result<FileHandle> {
        let parsed = OpenMode::parse(mode)
            .ok_or_else(|| NorfsError::BadArgument(format!("unsupported mode {mode:?}")))?;
        let field = checked_name(name)?;

        let mut fs = self.inner.lock();
        fs.ensure_mounted()?;

        let existing = fs.find_by_name(&field)?;
        let (idx, created) = if parsed.truncate {
            if let Some(idx) = existing {
                fs.unlink_entry(idx)?;
            }
            (fs.create_entry(field)?, true)
        } else if let Some(idx) = existing {
            (idx, false)
        } else if parsed.create {
            (fs.create_entry(field)?, true)
        } else {
            return Err(NorfsError::NotFound(name.to_owned()));
        };

        if created {
            // Program the fresh start sector to zeros immediately so the
            // chain never references unprogrammed flash.
            let start = fs.entry_start(idx)?;
            let zeros = vec![0_u8; SECTOR_SIZE];
            fs.erase_sector(start)?;
            fs.program_sector(start, &zeros)?;
        }

        let write_pos = if parsed.append { fs.entry_len(idx)? } else { 0 };
        debug!(target: "norfs::file", event = "open", name, mode, idx, created);
        Ok(FileHandle::new(
            Arc::clone(&self.inner),
            idx,
            parsed,
            write_pos,
        ))
    }

    /// Remove a file and free its whole chain.
    pub fn unlink(&self, name: &str) -> Result<()> {
        let field = checked_name(name)?;
        let mut fs = self.inner.lock();
        fs.ensure_mounted()?;
        let idx = fs
            .find_by_name(&field)?
            .ok_or_else(|| NorfsError::NotFound(name.to_owned()))?;
        fs.unlink_entry(idx)
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let field = checked_name(name)?;
        let fs = self.inner.lock();
        fs.ensure_mounted()?;
        Ok(fs.find_by_name(&field)?.is_some())
    }

    /// Rename `old` to `new`. Fails when `old` is missing or `new` exists.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_field = checked_name(old)?;
        let new_field = checked_name(new)?;
        let mut fs = self.inner.lock();
        fs.ensure_mounted()?;
        let idx = fs
            .find_by_name(&old_field)?
            .ok_or_else(|| NorfsError::NotFound(old.to_owned()))?;
        if fs.find_by_name(&new_field)?.is_some() {
            return Err(NorfsError::AlreadyExists(new.to_owned()));
        }
        fs.set_entry_name(idx, new_field)
    }

    /// Free capacity in bytes: `SECTOR_SIZE` times the free FAT entries.
    pub fn available(&self) -> Result<u64> {
        let fs = self.inner.lock();
        Ok(u64::from(fs.sb()?.fat().count_free()) * SECTOR_SIZE as u64)
    }

    /// Byte length of a file.
    pub fn size(&self, name: &str) -> Result<u32> {
        let field = checked_name(name)?;
        let fs = self.inner.lock();
        fs.ensure_mounted()?;
        let idx = fs
            .find_by_name(&field)?
            .ok_or_else(|| NorfsError::NotFound(name.to_owned()))?;
        fs.entry_len(idx)
    }

    pub fn opendir(&self) -> Result<DirCursor> {
        self.inner.lock().ensure_mounted()?;
        Ok(DirCursor { next: 0 })
    }

    /// Advance the cursor to the next live entry, skipping free slots.
    pub fn readdir(&self, cursor: &mut DirCursor) -> Result<Option<DirEntry>> {
        let fs = self.inner.lock();
        let sb = fs.sb()?;
        while cursor.next < sb.entry_count() {
            let idx = cursor.next;
            cursor.next += 1;
            if let Some(entry) = sb.entry(idx).filter(|e| !e.is_free()) {
                return Ok(Some(DirEntry {
                    name: trim_nul_padded(&entry.name),
                    len: entry.len,
                }));
            }
        }
        Ok(None)
    }

    /// Filesystem counters for host tooling.
    pub fn stats(&self) -> Result<FsStats> {
        let fs = self.inner.lock();
        let sb = fs.sb()?;
        Ok(FsStats {
            epoch: sb.epoch(),
            total_sectors: sb.total_sectors(),
            free_bytes: u64::from(sb.fat().count_free()) * SECTOR_SIZE as u64,
            live_files: sb.entries().iter().filter(|e| !e.is_free()).count(),
            file_entries: sb.entry_count(),
        })
    }
}

fn checked_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let field = name_field(name);
    if field[0] == 0 {
        return Err(NorfsError::BadArgument("empty file name".to_owned()));
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use norfs_device::MemFlash;

    fn fresh_fs(sectors: u16) -> Norfs {
        let fs = Norfs::with_rng(
            Box::new(MemFlash::new(sectors)),
            SmallRng::seed_from_u64(0x5EED),
        );
        fs.mkfs().expect("mkfs");
        fs.mount().expect("mount");
        fs
    }

    #[test]
    fn state_machine_enforces_mount_discipline() {
        let fs = Norfs::with_rng(Box::new(MemFlash::new(64)), SmallRng::seed_from_u64(1));
        assert!(matches!(fs.mount(), Err(NorfsError::NotFound(_))));
        assert!(matches!(fs.exists("x"), Err(NorfsError::NotMounted)));

        fs.mkfs().expect("mkfs");
        fs.mkfs().expect("mkfs again while unmounted reformats");
        fs.mount().expect("mount");
        assert!(matches!(fs.mkfs(), Err(NorfsError::AlreadyMounted)));
        assert!(matches!(fs.mount(), Err(NorfsError::AlreadyMounted)));

        fs.umount().expect("umount");
        assert!(matches!(fs.umount(), Err(NorfsError::NotMounted)));
        fs.mount().expect("remount");
    }

    #[test]
    fn mkfs_rejects_undersized_and_oversized_devices() {
        let tiny = Norfs::new(Box::new(MemFlash::new(8)));
        assert!(matches!(tiny.mkfs(), Err(NorfsError::BadArgument(_))));

        let big = Norfs::new(Box::new(MemFlash::new(2694)));
        assert!(matches!(big.mkfs(), Err(NorfsError::BadArgument(_))));
    }

    #[test]
    fn flush_rotates_slots_and_epochs() {
        let fs = fresh_fs(64);
        let before = fs.stats().expect("stats").epoch;
        // Each create flushes once, bumping the epoch.
        for i in 0..10 {
            fs.open(&format!("f{i}"), "w").expect("create").close().expect("close");
        }
        fs.umount().expect("umount");
        fs.mount().expect("mount");
        let after = fs.stats().expect("stats").epoch;
        assert!(after >= before + 10, "epoch {before} -> {after}");
        for i in 0..10 {
            assert!(fs.exists(&format!("f{i}")).expect("exists"));
        }
    }

    #[test]
    fn create_unlink_rename_cycle() {
        let fs = fresh_fs(64);
        fs.open("newfile.txt", "w").expect("create").close().expect("close");
        assert!(fs.exists("newfile.txt").expect("exists"));
        assert_eq!(fs.size("newfile.txt").expect("size"), 0);

        fs.rename("newfile.txt", "gettysburg.txt").expect("rename");
        assert!(!fs.exists("newfile.txt").expect("exists"));
        assert!(fs.exists("gettysburg.txt").expect("exists"));
        assert!(matches!(
            fs.rename("missing", "other"),
            Err(NorfsError::NotFound(_))
        ));

        fs.open("blocker", "w").expect("create").close().expect("close");
        assert!(matches!(
            fs.rename("gettysburg.txt", "blocker"),
            Err(NorfsError::AlreadyExists(_))
        ));

        fs.unlink("gettysburg.txt").expect("unlink");
        assert!(!fs.exists("gettysburg.txt").expect("exists"));
        assert!(matches!(
            fs.unlink("gettysburg.txt"),
            Err(NorfsError::NotFound(_))
        ));
    }

    #[test]
    fn available_accounts_for_superblock_reservation() {
        let fs = fresh_fs(64);
        // 64 sectors minus 8 superblock slots, all still free.
        assert_eq!(fs.available().expect("available"), 56 * SECTOR_SIZE as u64);

        fs.open("a", "w").expect("create").close().expect("close");
        assert_eq!(fs.available().expect("available"), 55 * SECTOR_SIZE as u64);

        fs.unlink("a").expect("unlink");
        assert_eq!(fs.available().expect("available"), 56 * SECTOR_SIZE as u64);
    }

    #[test]
    fn readdir_skips_free_slots_and_sees_all_files() {
        let fs = fresh_fs(64);
        for name in ["one", "two", "three"] {
            fs.open(name, "w").expect("create").close().expect("close");
        }
        fs.unlink("two").expect("unlink");

        let mut cursor = fs.opendir().expect("opendir");
        let mut seen = Vec::new();
        while let Some(entry) = fs.readdir(&mut cursor).expect("readdir") {
            seen.push(entry.name);
        }
        assert_eq!(seen, ["one", "three"]);
    }

    #[test]
    fn directory_and_sector_pools_exhaust_to_no_space() {
        let fs = fresh_fs(12);
        // 12 sectors - 8 reserved = 4 data sectors; each empty file pins one.
        for i in 0..4 {
            fs.open(&format!("f{i}"), "w").expect("create").close().expect("close");
        }
        assert!(matches!(fs.open("f4", "w"), Err(NorfsError::NoSpace)));
        assert_eq!(fs.available().expect("available"), 0);
    }

    #[test]
    fn seeded_rng_gives_reproducible_allocation() {
        let run = |seed: u64| {
            let flash = norfs_device::SharedMemFlash::new(MemFlash::new(64));
            let fs = Norfs::with_rng(Box::new(flash.clone()), SmallRng::seed_from_u64(seed));
            fs.mkfs().expect("mkfs");
            fs.mount().expect("mount");
            let mut handle = fs.open("f", "w").expect("open");
            handle.write(&[7_u8; SECTOR_SIZE * 3]).expect("write");
            handle.close().expect("close");
            fs.umount().expect("umount");
            flash.image()
        };
        assert_eq!(run(42), run(42));
    }
}
