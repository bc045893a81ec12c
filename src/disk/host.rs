//! Boundary between disk image logic and the kernel.
//!
//! Everything that touches loop devices, mount tables or filesystem tools goes
//! through [`Host`]. [`NativeHost`] is the implementation backed by the system
//! tools; tests use an in-process fake.

use log::{debug, trace};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::error::{DiskError, Result};
use super::filesystem::{self, FsKind};
use super::loopdev::{self, LoopDev};
use super::mount::{self, UnmountStrategy};

/// Tools required by [`NativeHost`].
const REQUIRED_TOOLS: &[&str] = &[
    "losetup",
    "partx",
    "mount",
    "umount",
    "mkfs.ext4",
    "e2fsck",
    "resize2fs",
    "fsck.vfat",
];

/// Kernel facing primitives used by disk image pipelines.
pub trait Host {
    /// Attach image file to a free loop device with partition scanning.
    fn attach(&self, image: &Path) -> Result<LoopDev>;

    /// Detach loop device. Detaching a device which is not attached is a no-op.
    fn detach(&self, loopdev: &LoopDev) -> Result<()>;

    /// Ask the kernel to re-read partition boundaries of the loop device.
    fn reread_partitions(&self, loopdev: &LoopDev) -> Result<()>;

    /// Mount `device` at `mountpoint`.
    fn mount(&self, device: &Path, mountpoint: &Path, kind: FsKind) -> Result<()>;

    /// Unmount `mountpoint` using given strategy.
    fn umount(&self, mountpoint: &Path, strategy: UnmountStrategy) -> Result<()>;

    /// Device currently mounted at `mountpoint`, if any.
    fn mounted_device(&self, mountpoint: &Path) -> Result<Option<PathBuf>>;

    /// Flush filesystem buffers.
    fn sync(&self);

    /// Wait for pending I/O to settle.
    fn settle(&self, delay: Duration);

    /// Create new filesystem on `device`.
    fn format(&self, device: &Path, kind: FsKind) -> Result<()>;

    /// Check filesystem on `device`.
    fn check(&self, device: &Path, kind: FsKind) -> Result<()>;

    /// Grow ext4 filesystem on unmounted `device` to fill the partition.
    fn grow(&self, device: &Path) -> Result<()>;

    /// Percentage of used space of filesystem mounted at `mountpoint`.
    fn usage(&self, mountpoint: &Path) -> Result<u8>;
}

/// Host implementation running system tools.
#[derive(Clone, Debug)]
pub struct NativeHost {
    _private: (),
}

impl NativeHost {
    /// Create native host checking that required tools are available.
    pub fn new() -> Result<Self> {
        let missing = REQUIRED_TOOLS
            .iter()
            .filter(|tool| {
                let found = which::which(tool);
                trace!("looking for {}: {:?}", tool, &found);
                found.is_err()
            })
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(DiskError::Config(format!(
                "required tools not found in PATH: {}",
                missing.join(", ")
            )));
        }
        debug!("all required tools found");
        Ok(Self { _private: () })
    }
}

impl Host for NativeHost {
    fn attach(&self, image: &Path) -> Result<LoopDev> {
        loopdev::native::attach(image)
    }

    fn detach(&self, loopdev: &LoopDev) -> Result<()> {
        loopdev::native::detach(loopdev)
    }

    fn reread_partitions(&self, loopdev: &LoopDev) -> Result<()> {
        loopdev::native::reread_partitions(loopdev)
    }

    fn mount(&self, device: &Path, mountpoint: &Path, kind: FsKind) -> Result<()> {
        mount::native::mount(device, mountpoint, kind)
    }

    fn umount(&self, mountpoint: &Path, strategy: UnmountStrategy) -> Result<()> {
        mount::native::umount(mountpoint, strategy)
    }

    fn mounted_device(&self, mountpoint: &Path) -> Result<Option<PathBuf>> {
        mount::native::mounted_device(mountpoint)
    }

    fn sync(&self) {
        nix::unistd::sync();
    }

    fn settle(&self, delay: Duration) {
        thread::sleep(delay);
    }

    fn format(&self, device: &Path, kind: FsKind) -> Result<()> {
        match kind {
            FsKind::Fat32 => filesystem::fat32::format_device(device),
            FsKind::Ext4 => filesystem::ext4::format(device),
        }
    }

    fn check(&self, device: &Path, kind: FsKind) -> Result<()> {
        match kind {
            FsKind::Fat32 => filesystem::fat32::check(device),
            FsKind::Ext4 => filesystem::ext4::check(device),
        }
    }

    fn grow(&self, device: &Path) -> Result<()> {
        filesystem::ext4::grow(device)
    }

    fn usage(&self, mountpoint: &Path) -> Result<u8> {
        filesystem::native_usage(mountpoint)
    }
}
