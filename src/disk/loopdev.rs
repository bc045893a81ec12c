use log::{debug, error, info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::core::Step;
use super::error::{DiskError, Result};
use super::host::Host;
use super::DiskContext;

/// Number of partition node checks after attaching.
const PARTITION_POLL_ATTEMPTS: u32 = 20;

/// Delay between partition node checks.
const PARTITION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Loop device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopDev {
    path: PathBuf,
}

impl LoopDev {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Get partitioned device, e.g. `/dev/loop1p1`.
    pub fn part(&self, n: u32) -> PathBuf {
        let mut name = self.name().to_os_string();
        name.push(format!("p{}", n));
        self.path.with_file_name(name)
    }

    /// Kernel name of the device, e.g. `loop1`.
    pub fn name(&self) -> &OsStr {
        self.path.file_name().unwrap_or(self.path.as_os_str())
    }

    /// Path to loop device.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl fmt::Display for LoopDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}

impl AsRef<OsStr> for LoopDev {
    fn as_ref(&self) -> &OsStr {
        self.path.as_os_str()
    }
}

/// Attached loop device.
///
/// The device is detached when the guard is dropped. Use [`LoopGuard::release`]
/// to detach it explicitly and observe errors.
pub struct LoopGuard<'h, H: Host> {
    host: &'h H,
    loopdev: LoopDev,
    attached: bool,
}

impl<'h, H: Host> LoopGuard<'h, H> {
    /// Attach image file to a loop device.
    pub fn attach(host: &'h H, image: &Path) -> Result<Self> {
        let loopdev = host.attach(image)?;
        info!("loop device attached: {} -> {}", image.display(), &loopdev);
        Ok(Self {
            host,
            loopdev,
            attached: true,
        })
    }

    pub fn loopdev(&self) -> &LoopDev {
        &self.loopdev
    }

    /// Detach loop device.
    ///
    /// If detaching fails, the guard will try again on drop.
    pub fn release(mut self) -> Result<()> {
        self.host.detach(&self.loopdev)?;
        self.attached = false;
        debug!("loop device detached: {}", &self.loopdev);
        Ok(())
    }
}

impl<H: Host> Drop for LoopGuard<'_, H> {
    fn drop(&mut self) {
        if self.attached {
            warn!("detaching loop device on cleanup: {}", &self.loopdev);
            if let Err(err) = self.host.detach(&self.loopdev) {
                error!("{}", err);
            }
        }
    }
}

/// Wait until partition device nodes `1..=count` of the loop device appear.
pub fn wait_for_partitions(loopdev: &LoopDev, count: u32) -> Result<()> {
    for attempt in 0..PARTITION_POLL_ATTEMPTS {
        let missing = (1..=count)
            .map(|n| loopdev.part(n))
            .find(|part| !part.exists());
        match missing {
            None => return Ok(()),
            Some(part) if attempt + 1 == PARTITION_POLL_ATTEMPTS => {
                return Err(DiskError::PartitionToolError {
                    action: "find partition device",
                    resource: part,
                    message: "device node did not appear".to_string(),
                })
            }
            Some(part) => {
                debug!("waiting for {}", part.display());
                thread::sleep(PARTITION_POLL_INTERVAL);
            }
        }
    }
    Ok(())
}

pub mod native {
    use log::debug;
    use std::ffi::OsStr;
    use std::fs;
    use std::path::Path;

    use super::LoopDev;
    use crate::disk::error::{DiskError, Result};
    use crate::disk::utils::{run_command, CommandError};

    /// Markers of exhausted loop devices in `losetup` output, current and older util-linux.
    const NO_FREE_DEVICE: [&str; 2] = [
        "cannot find an unused loop device",
        "could not find any free loop device",
    ];

    /// Attach file with `losetup --find --show --partscan`.
    pub fn attach(image: &Path) -> Result<LoopDev> {
        fs::File::open(image).map_err(|err| DiskError::DeviceAllocationFailed {
            action: "open backing file",
            resource: image.to_path_buf(),
            message: err.to_string(),
        })?;

        let (stdout, _) = run_command([
            OsStr::new("losetup"),
            OsStr::new("--find"),
            OsStr::new("--show"),
            OsStr::new("--partscan"),
            image.as_os_str(),
        ])
        .map_err(|err| attach_error(image, err))?;

        let path = stdout.trim();
        if path.is_empty() {
            return Err(DiskError::DeviceAllocationFailed {
                action: "attach",
                resource: image.to_path_buf(),
                message: "losetup did not report a device".to_string(),
            });
        }
        Ok(LoopDev::new(path))
    }

    /// Classify failed `losetup` attach.
    pub(super) fn attach_error(image: &Path, err: CommandError) -> DiskError {
        let stderr = err.stderr();
        if NO_FREE_DEVICE.iter().any(|marker| stderr.contains(marker)) {
            DiskError::ResourceBusy {
                action: "attach",
                resource: image.to_path_buf(),
            }
        } else {
            DiskError::DeviceAllocationFailed {
                action: "attach",
                resource: image.to_path_buf(),
                message: err.to_string(),
            }
        }
    }

    /// Whether the kernel has a backing file for this loop device.
    pub fn is_attached(loopdev: &LoopDev) -> bool {
        Path::new("/sys/block")
            .join(loopdev.name())
            .join("loop")
            .exists()
    }

    /// Detach with `losetup --detach`.
    pub fn detach(loopdev: &LoopDev) -> Result<()> {
        if !is_attached(loopdev) {
            debug!("{} is not attached", loopdev);
            return Ok(());
        }
        match run_command([
            OsStr::new("losetup"),
            OsStr::new("--detach"),
            loopdev.path().as_os_str(),
        ]) {
            Ok(_) => Ok(()),
            // Someone else released it meanwhile
            Err(_) if !is_attached(loopdev) => Ok(()),
            Err(err) => Err(DiskError::DeviceAllocationFailed {
                action: "detach",
                resource: loopdev.path().to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    /// Re-read partition table with `partx --update`.
    pub fn reread_partitions(loopdev: &LoopDev) -> Result<()> {
        run_command([
            OsStr::new("partx"),
            OsStr::new("--update"),
            loopdev.path().as_os_str(),
        ])
        .map_err(|err| DiskError::PartitionToolError {
            action: "re-read partitions of",
            resource: loopdev.path().to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(())
    }
}

/// Attach image file to a loop device.
pub struct AttachLoopDevice;

impl<'h, H: Host> Step<DiskContext<'h, H>> for AttachLoopDevice {
    fn run(&mut self, ctx: &mut DiskContext<'h, H>) -> Result<()> {
        let image = ctx.image("attach loop device")?.path().to_path_buf();
        let guard = LoopGuard::attach(ctx.host, &image)?;
        ctx.loopdev = Some(guard);
        Ok(())
    }
}

/// Make sure both partitions of the attached image have device nodes.
pub struct WaitForPartitions;

impl<H: Host> Step<DiskContext<'_, H>> for WaitForPartitions {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        wait_for_partitions(ctx.loopdev("find partitions")?, 2)
    }
}

/// Ask kernel to pick up changed partition boundaries.
pub struct RereadPartitions;

impl<H: Host> Step<DiskContext<'_, H>> for RereadPartitions {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let loopdev = ctx.loopdev("re-read partitions")?;
        ctx.host.reread_partitions(loopdev)
    }
}

/// Detach loop device.
pub struct DetachLoopDevice;

impl<H: Host> Step<DiskContext<'_, H>> for DetachLoopDevice {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        if let Some(guard) = ctx.loopdev.take() {
            guard.release()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::native::attach_error;
    use super::{wait_for_partitions, LoopDev, LoopGuard};
    use crate::disk::error::DiskError;
    use crate::disk::testing::FakeHost;
    use crate::disk::utils::run_command;
    use std::path::{Path, PathBuf};
    use tempdir::TempDir;

    #[test]
    fn test_part() {
        let loopdev = LoopDev::new("/dev/loop7");
        assert_eq!(loopdev.part(1), PathBuf::from("/dev/loop7p1"));
        assert_eq!(loopdev.part(2), PathBuf::from("/dev/loop7p2"));
        assert_eq!(loopdev.name(), "loop7");
    }

    #[test]
    fn test_wait_for_partitions() {
        let tmp = TempDir::new("loopdev-tests").unwrap();
        let loopdev = LoopDev::new(tmp.path().join("loop0"));
        std::fs::write(loopdev.part(1), b"").unwrap();
        assert!(wait_for_partitions(&loopdev, 1).is_ok());
        assert!(wait_for_partitions(&loopdev, 2).is_err());
    }

    #[test]
    fn test_guard_detaches_on_drop() {
        let tmp = TempDir::new("loopdev-tests").unwrap();
        let host = FakeHost::new(tmp.path());
        let image = host.blank_image("disk.img");

        let guard = LoopGuard::attach(&host, &image).unwrap();
        assert_eq!(host.attached().len(), 1);
        drop(guard);
        assert!(host.attached().is_empty());
    }

    #[test]
    fn test_guard_retries_failed_release() {
        let tmp = TempDir::new("loopdev-tests").unwrap();
        let host = FakeHost::new(tmp.path());
        let image = host.blank_image("disk.img");

        let guard = LoopGuard::attach(&host, &image).unwrap();
        host.fail_once("detach");
        assert!(guard.release().is_err());
        // drop of the failed guard detached it
        assert!(host.attached().is_empty());
    }

    fn losetup_failure(stderr: &str) -> DiskError {
        let script = format!("echo 'losetup: {}' >&2; exit 1", stderr);
        let err = run_command(["sh", "-c", script.as_str()]).unwrap_err();
        attach_error(Path::new("/tmp/disk.img"), err)
    }

    #[test]
    fn test_attach_exhausted_is_busy() {
        for message in [
            "cannot find an unused loop device",
            "could not find any free loop device",
        ] {
            let err = losetup_failure(message);
            assert!(matches!(err, DiskError::ResourceBusy { .. }), "{message}: {err:?}");
        }
    }

    #[test]
    fn test_attach_other_failure() {
        let err = losetup_failure("/tmp/disk.img: failed to set up loop device: Permission denied");
        let DiskError::DeviceAllocationFailed { message, .. } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("Permission denied"));
    }
}
