#![forbid(unsafe_code)]
//! Flash device capability for NorFS.
//!
//! Defines the `FlashDevice` trait the access engine is built over, the
//! host-simulated `MemFlash` backing store (with erase-discipline
//! enforcement and raw-image import/export), the byte-granular
//! `read_partial` helper for aligned-only devices, and the `FaultFlash`
//! operation-budget decorator used by crash-resilience tests.

use norfs_error::{NorfsError, Result};
use norfs_types::{MAX_SECTORS, SECTOR_SIZE};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Word size of the flash bus. Whole-sector programs/reads and the aligned
/// read path operate on multiples of this.
pub const WORD: usize = 4;

/// A NOR-flash part exposed as a flat array of erase sectors.
///
/// Program is only legal on a sector that has been erased since its last
/// program; the host simulation enforces this the way real parts enforce
/// the 1→0 transition rule. Aligned reads require `offset` and the buffer
/// length to be multiples of [`WORD`]; use [`read_partial`] for arbitrary
/// byte ranges.
pub trait FlashDevice: Send {
    /// Total number of sectors on the part.
    fn sector_count(&self) -> u16;

    /// Reset sector `sector` to its erased state (all zero bytes in this
    /// device model).
    fn erase(&mut self, sector: u16) -> Result<()>;

    /// Program one full sector. `data.len()` MUST equal [`SECTOR_SIZE`].
    fn program(&mut self, sector: u16, data: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes from `sector` starting at `offset`, both
    /// word-aligned.
    fn read_aligned(&mut self, sector: u16, offset: usize, buf: &mut [u8]) -> Result<()>;
}

fn check_sector(sector: u16, total: u16) -> Result<()> {
    if sector >= total {
        return Err(NorfsError::BadArgument(format!(
            "sector {sector} out of range (device has {total})"
        )));
    }
    Ok(())
}

// ── Host-simulated flash array ──────────────────────────────────────────────

/// In-RAM flash array standing in for the real part on the host.
///
/// Tracks per-sector erase state so a program without a preceding erase
/// fails the way it would corrupt data on hardware. Round-trips raw images
/// as flat byte vectors for the host tools.
#[derive(Debug, Clone)]
pub struct MemFlash {
    sectors: Vec<u8>,
    erased: Vec<bool>,
    total: u16,
}

impl MemFlash {
    /// A blank (all-zero, unerased) part with `total` sectors.
    #[must_use]
    pub fn new(total: u16) -> Self {
        let total = total.min(MAX_SECTORS);
        Self {
            sectors: vec![0_u8; usize::from(total) * SECTOR_SIZE],
            erased: vec![false; usize::from(total)],
            total,
        }
    }

    /// Reconstruct a part from a raw image dump. The image length must be a
    /// whole number of sectors.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        if image.is_empty() || image.len() % SECTOR_SIZE != 0 {
            return Err(NorfsError::BadArgument(format!(
                "image length {} is not a whole number of {SECTOR_SIZE}-byte sectors",
                image.len()
            )));
        }
        let count = image.len() / SECTOR_SIZE;
        if count > usize::from(MAX_SECTORS) {
            return Err(NorfsError::BadArgument(format!(
                "image holds {count} sectors, device limit is {MAX_SECTORS}"
            )));
        }
        #[allow(clippy::cast_possible_truncation)] // count <= MAX_SECTORS
        let total = count as u16;
        Ok(Self {
            sectors: image.to_vec(),
            erased: vec![false; count],
            total,
        })
    }

    /// Raw image dump of the whole part.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        self.sectors.clone()
    }

    fn span(&self, sector: u16) -> std::ops::Range<usize> {
        let base = usize::from(sector) * SECTOR_SIZE;
        base..base + SECTOR_SIZE
    }
}

impl FlashDevice for MemFlash {
    fn sector_count(&self) -> u16 {
        self.total
    }

    fn erase(&mut self, sector: u16) -> Result<()> {
        check_sector(sector, self.total)?;
        trace!(target: "norfs::dev", event = "erase", sector);
        let span = self.span(sector);
        self.sectors[span].fill(0);
        self.erased[usize::from(sector)] = true;
        Ok(())
    }

    fn program(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        check_sector(sector, self.total)?;
        if data.len() != SECTOR_SIZE {
            return Err(NorfsError::BadArgument(format!(
                "program needs a full {SECTOR_SIZE}-byte sector, got {}",
                data.len()
            )));
        }
        if !self.erased[usize::from(sector)] {
            return Err(NorfsError::Io(format!(
                "program of sector {sector} without a preceding erase"
            )));
        }
        trace!(target: "norfs::dev", event = "program", sector);
        let span = self.span(sector);
        self.sectors[span].copy_from_slice(data);
        self.erased[usize::from(sector)] = false;
        Ok(())
    }

    fn read_aligned(&mut self, sector: u16, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_sector(sector, self.total)?;
        if offset % WORD != 0 || buf.len() % WORD != 0 {
            return Err(NorfsError::BadArgument(format!(
                "misaligned flash read: offset={offset} len={}",
                buf.len()
            )));
        }
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= SECTOR_SIZE)
            .ok_or_else(|| {
                NorfsError::BadArgument(format!(
                    "flash read out of bounds: offset={offset} len={}",
                    buf.len()
                ))
            })?;
        let base = usize::from(sector) * SECTOR_SIZE;
        buf.copy_from_slice(&self.sectors[base + offset..base + end]);
        Ok(())
    }
}

/// Clonable handle to one shared `MemFlash`, so a host tool can hand the
/// part to the filesystem and still pull the image back out after umount.
#[derive(Debug, Clone)]
pub struct SharedMemFlash(Arc<Mutex<MemFlash>>);

impl SharedMemFlash {
    #[must_use]
    pub fn new(flash: MemFlash) -> Self {
        Self(Arc::new(Mutex::new(flash)))
    }

    /// Raw image dump of the shared part.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        self.0.lock().image()
    }
}

impl FlashDevice for SharedMemFlash {
    fn sector_count(&self) -> u16 {
        self.0.lock().sector_count()
    }

    fn erase(&mut self, sector: u16) -> Result<()> {
        self.0.lock().erase(sector)
    }

    fn program(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        self.0.lock().program(sector, data)
    }

    fn read_aligned(&mut self, sector: u16, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.0.lock().read_aligned(sector, offset, buf)
    }
}

// ── Partial-read alignment shim ─────────────────────────────────────────────

/// Bounce buffer span for the misaligned remainder path.
const BOUNCE_LEN: usize = 72;

/// Read an arbitrary byte range out of an aligned-only device.
///
/// The aligned middle of the range is pulled straight into the destination
/// and shifted left to strip the leading slack; the misaligned head and the
/// ragged tail bounce through a small stack buffer.
pub fn read_partial(
    dev: &mut dyn FlashDevice,
    sector: u16,
    offset: usize,
    buf: &mut [u8],
) -> Result<()> {
    let len = buf.len();
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= SECTOR_SIZE)
        .ok_or_else(|| {
            NorfsError::BadArgument(format!(
                "partial read out of bounds: offset={offset} len={len}"
            ))
        })?;
    if len == 0 {
        return Ok(());
    }

    if offset % WORD == 0 && len % WORD == 0 {
        return dev.read_aligned(sector, offset, buf);
    }

    let aligned_start = offset & !(WORD - 1);
    let lead = offset - aligned_start;
    let aligned_mid_end = end & !(WORD - 1);

    let mut done = 0_usize;
    if aligned_mid_end > aligned_start {
        let mid_len = aligned_mid_end - aligned_start;
        if mid_len <= len {
            dev.read_aligned(sector, aligned_start, &mut buf[..mid_len])?;
            buf.copy_within(lead..mid_len, 0);
            done = mid_len - lead;
        }
    }

    // Head (when the direct path could not run) and tail via the bounce
    // buffer, a whole word at each end.
    let mut bounce = [0_u8; BOUNCE_LEN];
    while done < len {
        let src = offset + done;
        let chunk_start = src & !(WORD - 1);
        let want_end = end.min(chunk_start + BOUNCE_LEN);
        let chunk_end = (want_end + WORD - 1) & !(WORD - 1);
        let chunk = chunk_end - chunk_start;
        dev.read_aligned(sector, chunk_start, &mut bounce[..chunk])?;
        let from = src - chunk_start;
        let take = (want_end - src).min(len - done);
        buf[done..done + take].copy_from_slice(&bounce[from..from + take]);
        done += take;
    }
    Ok(())
}

// ── Fault injection ─────────────────────────────────────────────────────────

/// Decorator that simulates power loss: after `budget` successful
/// operations every further erase/program/read fails.
#[derive(Debug)]
pub struct FaultFlash<D> {
    inner: D,
    budget: u64,
}

impl<D: FlashDevice> FaultFlash<D> {
    #[must_use]
    pub fn new(inner: D, budget: u64) -> Self {
        Self { inner, budget }
    }

    /// Operations remaining before the injected failure.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.budget
    }

    fn spend(&mut self) -> Result<()> {
        if self.budget == 0 {
            return Err(NorfsError::Io("injected power loss".to_owned()));
        }
        self.budget -= 1;
        Ok(())
    }
}

impl<D: FlashDevice> FlashDevice for FaultFlash<D> {
    fn sector_count(&self) -> u16 {
        self.inner.sector_count()
    }

    fn erase(&mut self, sector: u16) -> Result<()> {
        self.spend()?;
        self.inner.erase(sector)
    }

    fn program(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        self.spend()?;
        self.inner.program(sector, data)
    }

    fn read_aligned(&mut self, sector: u16, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.spend()?;
        self.inner.read_aligned(sector, offset, buf)
    }
}
