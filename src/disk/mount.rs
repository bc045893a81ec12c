use log::{debug, error, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempdir::TempDir;

use super::core::Step;
use super::error::{DiskError, Result};
use super::filesystem::FsKind;
use super::host::Host;
use super::DiskContext;

/// Time given to pending writes before unmounting.
pub const UNMOUNT_SETTLE: Duration = Duration::from_millis(500);

/// The way to unmount a filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmountStrategy {
    /// `umount`
    Graceful,
    /// `umount --force`
    Forced,
    /// `umount --lazy`
    Lazy,
}

impl UnmountStrategy {
    /// Strategies in the order they are tried.
    pub const ESCALATION: [Self; 3] = [Self::Graceful, Self::Forced, Self::Lazy];

    /// Extra `umount` flag.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            Self::Graceful => None,
            Self::Forced => Some("--force"),
            Self::Lazy => Some("--lazy"),
        }
    }
}

impl fmt::Display for UnmountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Forced => f.write_str("forced"),
            Self::Lazy => f.write_str("lazy"),
        }
    }
}

/// Mount `device` at `mountpoint`.
///
/// Mounting a device at the mount point it is already mounted at is a no-op.
pub fn mount<H: Host>(host: &H, device: &Path, mountpoint: &Path, kind: FsKind) -> Result<()> {
    match host.mounted_device(mountpoint)? {
        Some(current) if current == device => {
            debug!(
                "{} is already mounted at {}",
                device.display(),
                mountpoint.display()
            );
            Ok(())
        }
        Some(current) => Err(DiskError::MountFailed {
            action: "mount",
            resource: device.to_path_buf(),
            message: format!(
                "{} is already a mount point of {}",
                mountpoint.display(),
                current.display()
            ),
        }),
        None => {
            host.mount(device, mountpoint, kind)?;
            debug!("mounted {} at {}", device.display(), mountpoint.display());
            Ok(())
        }
    }
}

/// Unmount `mountpoint`, escalating through [`UnmountStrategy::ESCALATION`].
///
/// Unmounting a path which is not a mount point is a no-op.
pub fn unmount<H: Host>(host: &H, mountpoint: &Path) -> Result<()> {
    if host.mounted_device(mountpoint)?.is_none() {
        debug!("{} is not mounted", mountpoint.display());
        return Ok(());
    }

    host.sync();
    host.settle(UNMOUNT_SETTLE);

    let mut failures = Vec::new();
    for strategy in UnmountStrategy::ESCALATION {
        match host.umount(mountpoint, strategy) {
            Ok(()) => {
                debug!("{} unmount of {} succeeded", strategy, mountpoint.display());
                return Ok(());
            }
            Err(err) => {
                warn!("{} unmount of {} failed: {}", strategy, mountpoint.display(), err);
                failures.push(format!("{}: {}", strategy, err));
            }
        }
    }

    Err(DiskError::MountFailed {
        action: "unmount",
        resource: mountpoint.to_path_buf(),
        message: failures.join("; "),
    })
}

/// Entry of `/proc/self/mountinfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub source: PathBuf,
}

/// Parse content of `/proc/<pid>/mountinfo`.
///
/// Malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let separator = fields.iter().position(|field| *field == "-")?;
            let mountpoint = fields.get(4).filter(|_| separator > 4)?;
            let fstype = fields.get(separator + 1)?;
            let source = fields.get(separator + 2)?;
            Some(MountInfo {
                mountpoint: PathBuf::from(unescape(mountpoint)),
                fstype: fstype.to_string(),
                source: PathBuf::from(unescape(source)),
            })
        })
        .collect()
}

/// Decode octal escapes (`\040` and friends) used in mountinfo fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub mod native {
    use std::ffi::OsStr;
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::{parse_mountinfo, UnmountStrategy};
    use crate::disk::error::{DiskError, Result};
    use crate::disk::filesystem::FsKind;
    use crate::disk::utils::run_command;

    const MOUNTINFO: &str = "/proc/self/mountinfo";

    pub fn mount(device: &Path, mountpoint: &Path, kind: FsKind) -> Result<()> {
        run_command([
            OsStr::new("mount"),
            OsStr::new("-t"),
            OsStr::new(kind.mount_type()),
            device.as_os_str(),
            mountpoint.as_os_str(),
        ])
        .map_err(|err| DiskError::MountFailed {
            action: "mount",
            resource: device.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    pub fn umount(mountpoint: &Path, strategy: UnmountStrategy) -> Result<()> {
        let mut command = vec![OsStr::new("umount")];
        command.extend(strategy.flag().map(OsStr::new));
        command.push(mountpoint.as_os_str());
        run_command(command).map_err(|err| DiskError::MountFailed {
            action: "unmount",
            resource: mountpoint.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    pub fn mounted_device(mountpoint: &Path) -> Result<Option<PathBuf>> {
        let content = fs::read_to_string(MOUNTINFO).map_err(DiskError::io("read", MOUNTINFO))?;
        let mountpoint = fs::canonicalize(mountpoint).unwrap_or_else(|_| mountpoint.to_path_buf());
        // Stacked mounts: the last one is visible
        Ok(parse_mountinfo(&content)
            .into_iter()
            .filter(|info| info.mountpoint == mountpoint)
            .last()
            .map(|info| info.source))
    }
}

/// Filesystem mounted at a temporary directory.
///
/// The filesystem is unmounted when the guard is dropped. If unmounting fails,
/// the directory is left in place.
pub struct MountGuard<'h, H: Host> {
    host: &'h H,
    device: PathBuf,
    path: PathBuf,
    tmp: Option<TempDir>,
    mounted: bool,
}

impl<'h, H: Host> MountGuard<'h, H> {
    /// Mount `device` at new temporary directory.
    pub fn new(host: &'h H, device: &Path, kind: FsKind, prefix: &str) -> Result<Self> {
        let tmp = TempDir::new(prefix).map_err(DiskError::io("create mount point for", device))?;
        mount(host, device, tmp.path(), kind)?;
        Ok(Self {
            host,
            device: device.to_path_buf(),
            path: tmp.path().to_path_buf(),
            tmp: Some(tmp),
            mounted: true,
        })
    }

    /// Mount point.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Mounted device.
    pub fn device(&self) -> &Path {
        self.device.as_path()
    }

    /// Unmount filesystem.
    ///
    /// If unmounting fails, the guard will try again on drop.
    pub fn release(mut self) -> Result<()> {
        unmount(self.host, &self.path)?;
        self.mounted = false;
        Ok(())
    }
}

impl<H: Host> fmt::Display for MountGuard<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!(
            "{} at {}",
            self.device.display(),
            self.path.display()
        ))
    }
}

impl<H: Host> Drop for MountGuard<'_, H> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        warn!("unmounting on cleanup: {}", &self);
        if let Err(err) = unmount(self.host, &self.path) {
            error!("{}", err);
            // Never remove a directory which may still hold a live filesystem
            if let Some(tmp) = self.tmp.take() {
                let _ = tmp.into_path();
            }
        }
    }
}

/// Mount both partitions of the attached image.
pub struct MountPartitions;

impl<'h, H: Host> Step<DiskContext<'h, H>> for MountPartitions {
    fn run(&mut self, ctx: &mut DiskContext<'h, H>) -> Result<()> {
        info!("mounting partitions");
        let loopdev = ctx.loopdev("mount partitions")?.clone();

        let esp = MountGuard::new(ctx.host, &loopdev.part(1), FsKind::Fat32, "vmdisk-esp")?;
        debug!("mounted ESP: {}", &esp);
        ctx.esp_mount = Some(esp);

        let root = MountGuard::new(ctx.host, &loopdev.part(2), FsKind::Ext4, "vmdisk-root")?;
        debug!("mounted root: {}", &root);
        ctx.root_mount = Some(root);

        Ok(())
    }
}

/// Unmount both partitions.
pub struct UnmountPartitions;

impl<H: Host> Step<DiskContext<'_, H>> for UnmountPartitions {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        info!("unmounting partitions");
        if let Some(root) = ctx.root_mount.take() {
            root.release()?;
        }
        if let Some(esp) = ctx.esp_mount.take() {
            esp.release()?;
        }
        Ok(())
    }
}
