#![forbid(unsafe_code)]
//! Power-loss simulation: a workload is cut off after every possible
//! number of device operations, and the surviving image must always mount
//! to a committed prefix of the workload's history.

use norfs_core::{Norfs, NorfsError};
use norfs_device::{FaultFlash, MemFlash, SharedMemFlash};
use norfs_types::SECTOR_SIZE;
use rand::SeedableRng;
use rand::rngs::SmallRng;

const COMMITTED: &[u8] = b"committed before the lights went out";

/// A formatted 64-sector image holding one fully committed file.
fn base_image() -> Vec<u8> {
    let flash = SharedMemFlash::new(MemFlash::new(64));
    let fs = Norfs::with_rng(Box::new(flash.clone()), SmallRng::seed_from_u64(11));
    fs.mkfs().expect("mkfs");
    fs.mount().expect("mount");
    let mut f = fs.open("anchor", "w").expect("open");
    f.write(COMMITTED).expect("write");
    f.close().expect("close");
    fs.umount().expect("umount");
    flash.image()
}

/// Workload interrupted by the fault budget: grow a second file across
/// several sectors with a sync in the middle, then rename it.
fn workload(fs: &Norfs) -> norfs_core::Result<()> {
    fs.mount()?;
    let mut f = fs.open("victim", "w")?;
    f.write(&vec![0xA5_u8; SECTOR_SIZE + 100])?;
    f.sync()?;
    f.write(&vec![0x5A_u8; SECTOR_SIZE])?;
    f.close()?;
    fs.rename("victim", "renamed")?;
    fs.umount()
}

/// What a healthy survivor must satisfy: mounts, the anchor file is byte
/// identical, and whatever state of the victim survived is readable in
/// full (its chain is at least as long as its recorded length).
fn assert_recoverable(image: &[u8]) {
    let fs = Norfs::with_rng(
        Box::new(MemFlash::from_image(image).expect("image")),
        SmallRng::seed_from_u64(13),
    );
    fs.mount().expect("mount after power loss");

    let mut f = fs.open("anchor", "r").expect("anchor must survive");
    let mut buf = vec![0_u8; COMMITTED.len()];
    assert_eq!(f.read(&mut buf).expect("read anchor"), COMMITTED.len());
    assert_eq!(buf, COMMITTED);
    f.close().expect("close");

    for name in ["victim", "renamed"] {
        if fs.exists(name).expect("exists") {
            let len = fs.size(name).expect("size") as usize;
            let mut f = fs.open(name, "r").expect("open survivor");
            let mut data = vec![0_u8; len];
            assert_eq!(f.read(&mut data).expect("survivor readable"), len);
            f.close().expect("close");
        }
    }
    assert!(
        !(fs.exists("victim").expect("exists") && fs.exists("renamed").expect("exists")),
        "rename must never leave both names live"
    );
    fs.umount().expect("umount");
}

#[test]
fn mount_succeeds_after_power_loss_at_every_io_boundary() {
    let base = base_image();
    let mut completed = false;

    for budget in 0_u64..500 {
        let flash = SharedMemFlash::new(MemFlash::from_image(&base).expect("image"));
        let fs = Norfs::with_rng(
            Box::new(FaultFlash::new(flash.clone(), budget)),
            SmallRng::seed_from_u64(17),
        );
        match workload(&fs) {
            Ok(()) => {
                // Budget large enough: the whole workload committed.
                assert_recoverable(&flash.image());
                let fs = Norfs::new(Box::new(
                    MemFlash::from_image(&flash.image()).expect("image"),
                ));
                fs.mount().expect("mount");
                assert!(fs.exists("renamed").expect("exists"));
                assert_eq!(
                    fs.size("renamed").expect("size") as usize,
                    2 * SECTOR_SIZE + 100
                );
                completed = true;
                break;
            }
            Err(NorfsError::Io(_)) => assert_recoverable(&flash.image()),
            Err(other) => panic!("budget {budget}: unexpected error {other}"),
        }
    }
    assert!(completed, "workload never ran to completion");
}

#[test]
fn interrupted_flush_still_leaves_a_mountable_copy() {
    let base = base_image();

    // Drive the filesystem through enough flushes to cycle all eight
    // superblock slots, then cut power right between the oldest slot's
    // erase and its program.
    let flash = SharedMemFlash::new(MemFlash::from_image(&base).expect("image"));
    let fs = Norfs::with_rng(
        Box::new(flash.clone()),
        SmallRng::seed_from_u64(19),
    );
    fs.mount().expect("mount");
    for i in 0..10 {
        fs.open(&format!("spin{i}"), "w")
            .expect("open")
            .close()
            .expect("close");
    }
    fs.umount().expect("umount");

    // Manually erase the slot a future flush would claim; this is the
    // on-flash state after a flush that died mid-pair.
    let mut torn = MemFlash::from_image(&flash.image()).expect("image");
    use norfs_device::FlashDevice;
    torn.erase(3).expect("erase");
    let fs = Norfs::new(Box::new(torn));
    fs.mount().expect("mount with one slot torn away");
    assert!(fs.exists("anchor").expect("exists"));
}
