#![forbid(unsafe_code)]
//! Per-open file handle: the streaming read/write engine.
//!
//! Each writable handle owns one sector-sized scratch buffer holding the
//! authoritative bytes of `write_win.sector` whenever `dirty` is set. The
//! read and write cursors are independent; outside append mode each
//! mirrors the other after an operation, which is what `r+`/`w+` need.
//! Chain traversal is lazy: a cursor landing outside the cached window
//! walks the FAT chain from the file's start sector, extending it with
//! zero-programmed sectors when the position lies past the end.

use crate::fs::{FsInner, chain_corrupt};
use norfs_error::{NorfsError, Result};
use norfs_types::{FAT_EOF, OpenMode, SECTOR_SIZE, Whence, trim_nul_padded};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

const SECTOR: u32 = SECTOR_SIZE as u32;

/// Cached location of one chain sector: the file offset of its byte 0.
#[derive(Debug, Clone, Copy)]
struct Window {
    sector: u16,
    base: u32,
}

impl Window {
    fn contains(self, pos: u32) -> bool {
        pos >= self.base && pos - self.base < SECTOR
    }
}

/// An open file. Created by [`crate::Norfs::open`]; released by
/// [`FileHandle::close`] (or best-effort on drop).
pub struct FileHandle {
    fs: Arc<Mutex<FsInner>>,
    file_idx: usize,
    mode: OpenMode,
    read_pos: u32,
    write_pos: u32,
    read_win: Option<Window>,
    write_win: Option<Window>,
    /// One-sector scratch buffer; authoritative for the write window's
    /// sector while `dirty`. Empty for read-only handles.
    buf: Vec<u8>,
    dirty: bool,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(
        fs: Arc<Mutex<FsInner>>,
        file_idx: usize,
        mode: OpenMode,
        write_pos: u32,
    ) -> Self {
        let buf = if mode.writable() {
            vec![0_u8; SECTOR_SIZE]
        } else {
            Vec::new()
        };
        Self {
            fs,
            file_idx,
            mode,
            read_pos: 0,
            write_pos,
            read_win: None,
            write_win: None,
            buf,
            dirty: false,
            closed: false,
        }
    }

    // ── Write engine ────────────────────────────────────────────────────

    /// Write `data` at the write cursor, extending the file as needed.
    ///
    /// Follows the `std::io::Write` convention for mid-write failures: if
    /// some bytes landed before the error, their count is returned and the
    /// error is swallowed; only a failure before any byte lands surfaces
    /// as `Err`.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.mode.writable() {
            return Err(NorfsError::BadArgument(
                "handle not open for writing".to_owned(),
            ));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let shared = Arc::clone(&self.fs);
        let mut fs = shared.lock();
        fs.ensure_mounted()?;
        fs.ensure_entry_live(self.file_idx)?;
        let mut written = 0_usize;
        match self.write_locked(&mut fs, data, &mut written) {
            Err(err) if written == 0 => Err(err),
            _ => Ok(written),
        }
    }

    fn write_locked(&mut self, fs: &mut FsInner, data: &[u8], written: &mut usize) -> Result<()> {
        let mut win = self.align_write_window(fs)?;

        let mut remaining = data;
        while !remaining.is_empty() {
            if self.write_pos - win.base >= SECTOR {
                // Crossing the sector boundary: flush, then follow the
                // chain (overwrite) or grow it (extend).
                self.flush_buffer(fs)?;
                let next = fs.fat_next(win.sector)?;
                if next == FAT_EOF {
                    let fresh = fs.find_free_sector()?;
                    fs.fat_set(win.sector, fresh);
                    fs.fat_set(fresh, FAT_EOF);
                    win.sector = fresh;
                    self.buf.fill(0);
                } else {
                    win.sector = next;
                    fs.read_sector(win.sector, &mut self.buf)?;
                }
                win.base = self.write_pos;
                self.write_win = Some(win);
            }

            let off = (self.write_pos - win.base) as usize;
            let take = remaining.len().min(SECTOR_SIZE - off);
            self.buf[off..off + take].copy_from_slice(&remaining[..take]);
            self.dirty = true;
            self.write_pos += take as u32;
            *written += take;
            if !self.mode.append {
                self.read_pos = self.write_pos;
            }
            let len = fs.entry_len(self.file_idx)?;
            if self.write_pos > len {
                fs.set_entry_len(self.file_idx, self.write_pos)?;
            }
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Park the dirty buffer on the sector containing `write_pos`,
    /// walking (and if needed extending) the chain from the start sector.
    fn align_write_window(&mut self, fs: &mut FsInner) -> Result<Window> {
        if let Some(win) = self.write_win {
            if win.contains(self.write_pos) {
                return Ok(win);
            }
        }
        self.flush_buffer(fs)?;

        let total = fs.total_sectors()?;
        let mut sector = fs.entry_start(self.file_idx)?;
        let mut base = 0_u32;
        let mut prev: Option<u16> = None;
        let mut hops = 0_u32;
        while !(Window { sector, base }).contains(self.write_pos) {
            prev = Some(sector);
            let next = fs.fat_next(sector)?;
            if next == FAT_EOF {
                // Past the end: grow the chain with a zero-programmed
                // sector so the gap reads back as zeroes.
                let fresh = fs.find_free_sector()?;
                fs.fat_set(sector, fresh);
                fs.fat_set(fresh, FAT_EOF);
                sector = fresh;
                self.buf.fill(0);
                fs.erase_sector(sector)?;
                fs.program_sector(sector, &self.buf)?;
            } else {
                sector = next;
            }
            base += SECTOR;
            hops += 1;
            if hops > u32::from(total) {
                return Err(chain_corrupt("FAT chain does not terminate"));
            }
        }

        let len = fs.entry_len(self.file_idx)?;
        if len > base {
            // Overwriting stored bytes: merge with the old contents, and
            // relocate to a fresh sector when one is free so repeated
            // rewrites of the same file offset spread across the device.
            fs.read_sector(sector, &mut self.buf)?;
            if let Ok(fresh) = fs.find_free_sector() {
                let next = fs.fat_next(sector)?;
                match prev {
                    None => fs.set_entry_start(self.file_idx, fresh)?,
                    Some(prev) => fs.fat_set(prev, fresh),
                }
                fs.fat_set(fresh, next);
                self.dirty = true;
                fs.fat_set(sector, 0);
                // A cached read window on the freed sector would now see
                // stale flash; force a re-walk.
                if self.read_win.is_some_and(|r| r.sector == sector) {
                    self.read_win = None;
                }
                sector = fresh;
            }
        } else {
            self.buf.fill(0);
        }
        // Commit the length up to this sector now so a crash mid-write
        // leaves the recorded size consistent with the chain.
        if base > len {
            fs.set_entry_len(self.file_idx, base)?;
        }

        let win = Window { sector, base };
        self.write_win = Some(win);
        Ok(win)
    }

    /// Erase-then-program the write window's sector from the scratch
    /// buffer, if dirty.
    fn flush_buffer(&mut self, fs: &mut FsInner) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(win) = self.write_win else {
            return Ok(());
        };
        fs.erase_sector(win.sector)?;
        fs.program_sector(win.sector, &self.buf)?;
        self.dirty = false;
        Ok(())
    }

    // ── Read engine ─────────────────────────────────────────────────────

    /// Read up to `out.len()` bytes at the read cursor. Returns 0 at end
    /// of file. A chain that ends before the cursor while the recorded
    /// length says otherwise is corruption, not EOF.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if !self.mode.read {
            return Err(NorfsError::BadArgument(
                "handle not open for reading".to_owned(),
            ));
        }
        if out.is_empty() {
            return Ok(0);
        }
        let shared = Arc::clone(&self.fs);
        let mut fs = shared.lock();
        fs.ensure_mounted()?;
        fs.ensure_entry_live(self.file_idx)?;

        let len = fs.entry_len(self.file_idx)?;
        let want = out.len().min(len.saturating_sub(self.read_pos) as usize);
        if want == 0 {
            return Ok(0);
        }

        let mut done = 0_usize;
        match self.read_locked(&mut fs, out, want, &mut done) {
            Err(err) if done == 0 => Err(err),
            _ => Ok(done),
        }
    }

    fn read_locked(
        &mut self,
        fs: &mut FsInner,
        out: &mut [u8],
        want: usize,
        done: &mut usize,
    ) -> Result<()> {
        let mut win = match self.read_win {
            Some(win) if win.contains(self.read_pos) => win,
            _ => self.align_read_window(fs)?,
        };

        while *done < want {
            if self.read_pos - win.base >= SECTOR {
                let next = fs.fat_next(win.sector)?;
                if next == FAT_EOF {
                    return Err(chain_corrupt("file chain shorter than recorded length"));
                }
                win.sector = next;
                win.base += SECTOR;
                self.read_win = Some(win);
            }

            let off = (self.read_pos - win.base) as usize;
            let take = (want - *done).min(SECTOR_SIZE - off);
            let hot = self
                .write_win
                .is_some_and(|w| w.sector == win.sector && self.mode.writable());
            if hot {
                // Read-after-write: the scratch buffer holds newer bytes
                // for this sector than the flash does.
                out[*done..*done + take].copy_from_slice(&self.buf[off..off + take]);
            } else {
                fs.read_partial_sector(win.sector, off, &mut out[*done..*done + take])?;
            }
            self.read_pos += take as u32;
            *done += take;
            if !self.mode.append {
                self.write_pos = self.read_pos;
            }
        }
        Ok(())
    }

    fn align_read_window(&mut self, fs: &mut FsInner) -> Result<Window> {
        let total = fs.total_sectors()?;
        let mut sector = fs.entry_start(self.file_idx)?;
        let mut base = 0_u32;
        let mut hops = 0_u32;
        while !(Window { sector, base }).contains(self.read_pos) {
            let next = fs.fat_next(sector)?;
            if next == FAT_EOF {
                return Err(chain_corrupt("file chain shorter than recorded length"));
            }
            sector = next;
            base += SECTOR;
            hops += 1;
            if hops > u32::from(total) {
                return Err(chain_corrupt("FAT chain does not terminate"));
            }
        }
        let win = Window { sector, base };
        self.read_win = Some(win);
        Ok(win)
    }

    // ── Cursor control ──────────────────────────────────────────────────

    /// Reposition the cursors. In `a+` only the read cursor moves (writes
    /// stay pinned to end-of-file); pure `a` rejects seeks; everywhere
    /// else both cursors move together.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u32> {
        let fs = self.fs.lock();
        fs.ensure_mounted()?;
        let len = fs.entry_len(self.file_idx)?;
        drop(fs);

        let origin = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::from(self.read_pos),
            Whence::End => i64::from(len),
        };
        let absolute = origin
            .checked_add(offset)
            .ok_or_else(|| NorfsError::BadArgument("seek offset overflow".to_owned()))?;
        if absolute < 0 {
            return Err(NorfsError::BadArgument(
                "seek before start of file".to_owned(),
            ));
        }
        if absolute > i64::from(i32::MAX) {
            return Err(NorfsError::BadArgument(
                "seek beyond representable file size".to_owned(),
            ));
        }
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)] // bounded above
        let absolute = absolute as u32;

        if self.mode.append {
            if !self.mode.read {
                return Err(NorfsError::BadArgument(
                    "seek on append-only handle".to_owned(),
                ));
            }
            self.read_pos = absolute;
        } else {
            self.read_pos = absolute;
            self.write_pos = absolute;
        }
        Ok(absolute)
    }

    /// Current cursor: the read cursor on readable handles, the write
    /// cursor otherwise.
    #[must_use]
    pub fn tell(&self) -> u32 {
        if self.mode.read {
            self.read_pos
        } else {
            self.write_pos
        }
    }

    /// Whether the read cursor sits at end-of-file. Always false for
    /// write-only handles.
    pub fn eof(&self) -> Result<bool> {
        if !self.mode.read {
            return Ok(false);
        }
        let fs = self.fs.lock();
        fs.ensure_mounted()?;
        Ok(self.read_pos >= fs.entry_len(self.file_idx)?)
    }

    /// Current byte length of the file.
    pub fn size(&self) -> Result<u32> {
        let fs = self.fs.lock();
        fs.ensure_mounted()?;
        fs.entry_len(self.file_idx)
    }

    /// The file's name.
    pub fn name(&self) -> Result<String> {
        let fs = self.fs.lock();
        fs.ensure_mounted()?;
        Ok(trim_nul_padded(&fs.entry_name(self.file_idx)?))
    }

    // ── Byte conveniences ───────────────────────────────────────────────

    /// Read one byte; `None` at end of file.
    pub fn get_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0_u8; 1];
        Ok((self.read(&mut byte)? == 1).then_some(byte[0]))
    }

    /// Write one byte.
    pub fn put_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte])?;
        Ok(())
    }

    // ── Durability ──────────────────────────────────────────────────────

    /// Flush the dirty sector and persist the superblock, keeping the
    /// handle open.
    pub fn sync(&mut self) -> Result<()> {
        if !self.mode.writable() {
            return Ok(());
        }
        let shared = Arc::clone(&self.fs);
        let mut fs = shared.lock();
        fs.ensure_mounted()?;
        self.flush_buffer(&mut fs)?;
        fs.flush_superblock()
    }

    /// Flush the dirty sector and release the handle. Metadata (length and
    /// FAT updates) persists at the next superblock flush point
    /// (`sync` on another handle, any namespace operation, or `umount`).
    pub fn close(mut self) -> Result<()> {
        let result = self.close_impl();
        self.closed = true;
        result
    }

    fn close_impl(&mut self) -> Result<()> {
        if !self.mode.writable() || !self.dirty {
            return Ok(());
        }
        let shared = Arc::clone(&self.fs);
        let mut fs = shared.lock();
        fs.ensure_mounted()?;
        self.flush_buffer(&mut fs)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(error) = self.close_impl() {
            warn!(
                target: "norfs::file",
                %error,
                file_idx = self.file_idx,
                "flush on handle drop failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Norfs;
    use norfs_device::MemFlash;
    use norfs_error::NorfsError;
    use norfs_types::{SECTOR_SIZE, Whence};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn fresh_fs() -> Norfs {
        let fs = Norfs::with_rng(
            Box::new(MemFlash::new(64)),
            SmallRng::seed_from_u64(0xF00D),
        );
        fs.mkfs().expect("mkfs");
        fs.mount().expect("mount");
        fs
    }

    #[test]
    fn write_then_read_within_one_sector() {
        let fs = fresh_fs();
        let mut f = fs.open("small", "w+").expect("open");
        assert_eq!(f.write(b"hello, flash").expect("write"), 12);
        assert_eq!(f.size().expect("size"), 12);

        f.seek(0, Whence::Set).expect("seek");
        let mut buf = [0_u8; 12];
        assert_eq!(f.read(&mut buf).expect("read"), 12);
        assert_eq!(&buf, b"hello, flash");
        assert!(f.eof().expect("eof"));
        assert_eq!(f.read(&mut buf).expect("read at eof"), 0);
        f.close().expect("close");
    }

    #[test]
    fn read_after_write_is_served_from_hot_buffer() {
        let fs = fresh_fs();
        let mut f = fs.open("hot", "w+").expect("open");
        f.write(b"abcdef").expect("write");
        // Nothing flushed yet; the read must come from the dirty buffer.
        f.seek(2, Whence::Set).expect("seek");
        let mut buf = [0_u8; 3];
        assert_eq!(f.read(&mut buf).expect("read"), 3);
        assert_eq!(&buf, b"cde");
        f.close().expect("close");
    }

    #[test]
    fn cursors_mirror_except_in_append_mode() {
        let fs = fresh_fs();
        let mut f = fs.open("mirror", "w+").expect("open");
        f.write(b"0123456789").expect("write");
        assert_eq!(f.tell(), 10);
        f.seek(4, Whence::Set).expect("seek");
        let mut one = [0_u8; 1];
        f.read(&mut one).expect("read");
        // Read advanced both cursors; the next write overwrites offset 5.
        f.write(b"X").expect("write");
        f.seek(0, Whence::Set).expect("seek");
        let mut buf = [0_u8; 10];
        f.read(&mut buf).expect("read");
        assert_eq!(&buf, b"01234X6789");
        f.close().expect("close");
    }

    #[test]
    fn append_mode_pins_writes_to_end() {
        let fs = fresh_fs();
        let mut f = fs.open("log", "w").expect("open");
        f.write(b"first|").expect("write");
        f.close().expect("close");

        let mut f = fs.open("log", "a+").expect("open append");
        assert_eq!(f.tell(), 0, "a+ reads start at the beginning");
        let mut buf = [0_u8; 6];
        f.read(&mut buf).expect("read");
        assert_eq!(&buf, b"first|");
        f.write(b"second").expect("append");
        // The read cursor was not dragged to the end by the write.
        f.seek(0, Whence::Set).expect("seek");
        let mut all = [0_u8; 12];
        assert_eq!(f.read(&mut all).expect("read"), 12);
        assert_eq!(&all, b"first|second");
        f.close().expect("close");
    }

    #[test]
    fn pure_append_rejects_seek() {
        let fs = fresh_fs();
        let mut f = fs.open("log", "a").expect("open");
        f.write(b"x").expect("write");
        assert!(matches!(
            f.seek(0, Whence::Set),
            Err(NorfsError::BadArgument(_))
        ));
        f.close().expect("close");
    }

    #[test]
    fn seek_rejects_negative_positions() {
        let fs = fresh_fs();
        let mut f = fs.open("s", "w+").expect("open");
        f.write(b"abc").expect("write");
        assert!(matches!(
            f.seek(-4, Whence::Cur),
            Err(NorfsError::BadArgument(_))
        ));
        assert_eq!(f.seek(-1, Whence::End).expect("seek"), 2);
        f.close().expect("close");
    }

    #[test]
    fn write_only_handle_rejects_read_and_vice_versa() {
        let fs = fresh_fs();
        let mut w = fs.open("x", "w").expect("open w");
        w.write(b"data").expect("write");
        let mut buf = [0_u8; 4];
        assert!(matches!(w.read(&mut buf), Err(NorfsError::BadArgument(_))));
        w.close().expect("close");

        let mut r = fs.open("x", "r").expect("open r");
        assert!(matches!(r.write(b"no"), Err(NorfsError::BadArgument(_))));
        r.close().expect("close");
    }

    #[test]
    fn truncate_discards_previous_contents() {
        let fs = fresh_fs();
        let mut f = fs.open("t", "w").expect("open");
        f.write(&[0xAA_u8; SECTOR_SIZE * 2]).expect("write");
        f.close().expect("close");
        assert_eq!(fs.size("t").expect("size"), SECTOR_SIZE as u32 * 2);

        let f = fs.open("t", "w").expect("reopen truncating");
        f.close().expect("close");
        assert_eq!(fs.size("t").expect("size"), 0);
    }

    #[test]
    fn drop_flushes_dirty_buffer() {
        let fs = fresh_fs();
        {
            let mut f = fs.open("d", "w").expect("open");
            f.write(b"persisted").expect("write");
            // Dropped without close.
        }
        let mut f = fs.open("d", "r").expect("open r");
        let mut buf = [0_u8; 9];
        assert_eq!(f.read(&mut buf).expect("read"), 9);
        assert_eq!(&buf, b"persisted");
        f.close().expect("close");
    }

    #[test]
    fn stale_handle_after_unlink_is_rejected() {
        let fs = fresh_fs();
        let mut f = fs.open("gone", "w+").expect("open");
        f.write(b"abc").expect("write");
        fs.unlink("gone").expect("unlink");
        assert!(matches!(f.write(b"more"), Err(NorfsError::NotFound(_))));
        let mut buf = [0_u8; 3];
        assert!(matches!(f.read(&mut buf), Err(NorfsError::NotFound(_))));
    }

    #[test]
    fn overwrite_relocation_does_not_serve_stale_reads() {
        let fs = fresh_fs();
        let mut f = fs.open("rw", "w+").expect("open");
        f.write(&[b'o'; 100]).expect("write");
        f.close().expect("close");

        let mut f = fs.open("rw", "r+").expect("open r+");
        let mut head = [0_u8; 10];
        f.read(&mut head).expect("read caches a window");
        f.seek(50, Whence::Set).expect("seek");
        // This overwrite relocates the sector to spread wear; the cached
        // read window must not keep pointing at the freed sector.
        f.write(b"NEW").expect("write");
        f.seek(50, Whence::Set).expect("seek back");
        let mut back = [0_u8; 3];
        f.read(&mut back).expect("read");
        assert_eq!(&back, b"NEW");
        f.close().expect("close");
    }

    #[test]
    fn get_put_byte_roundtrip() {
        let fs = fresh_fs();
        let mut f = fs.open("b", "w+").expect("open");
        for byte in b"seq" {
            f.put_byte(*byte).expect("put");
        }
        f.seek(0, Whence::Set).expect("seek");
        assert_eq!(f.get_byte().expect("get"), Some(b's'));
        assert_eq!(f.get_byte().expect("get"), Some(b'e'));
        assert_eq!(f.get_byte().expect("get"), Some(b'q'));
        assert_eq!(f.get_byte().expect("get"), None);
        f.close().expect("close");
    }
}
