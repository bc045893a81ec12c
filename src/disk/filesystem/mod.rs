use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::Path;

use super::core::Step;
use super::error::{DiskError, Result};
use super::host::Host;
use super::DiskContext;

pub mod ext4;
pub mod fat32;

/// Filesystem kinds used on the disk image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Fat32,
    Ext4,
}

impl FsKind {
    /// Type name passed to `mount -t`.
    pub fn mount_type(&self) -> &'static str {
        match self {
            Self::Fat32 => "vfat",
            Self::Ext4 => "ext4",
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fat32 => f.write_str("FAT32"),
            Self::Ext4 => f.write_str("ext4"),
        }
    }
}

/// Percentage of used space the way `df` reports it.
///
/// Blocks reserved for the super-user are counted neither as used nor as
/// available. The result is rounded up.
pub fn percent_used(total: u64, free: u64, available: u64) -> u8 {
    let used = total.saturating_sub(free);
    let usable = used + available;
    if usable == 0 {
        return 0;
    }
    (used * 100).div_ceil(usable).min(100) as u8
}

/// Usage of mounted filesystem from `statvfs`.
pub fn native_usage(mountpoint: &Path) -> Result<u8> {
    let stat = nix::sys::statvfs::statvfs(mountpoint)
        .map_err(|errno| DiskError::io("measure usage of", mountpoint)(errno.into()))?;
    Ok(percent_used(
        u64::from(stat.blocks()),
        u64::from(stat.blocks_free()),
        u64::from(stat.blocks_available()),
    ))
}

/// Create FAT32 on the ESP and ext4 on the root partition.
pub struct FormatPartitions;

impl<H: Host> Step<DiskContext<'_, H>> for FormatPartitions {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let loopdev = ctx.loopdev("format partitions")?;

        info!("creating FAT32 filesystem on ESP");
        ctx.host.format(&loopdev.part(1), FsKind::Fat32)?;

        info!("creating ext4 filesystem on root partition");
        ctx.host.format(&loopdev.part(2), FsKind::Ext4)?;

        Ok(())
    }
}

/// Check filesystems of both partitions.
///
/// Problems found by the checks are reported but never stop the pipeline.
pub struct CheckFileSystems;

impl<H: Host> Step<DiskContext<'_, H>> for CheckFileSystems {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let loopdev = ctx.loopdev("check filesystems")?;
        for (n, kind) in [(1, FsKind::Fat32), (2, FsKind::Ext4)] {
            let device = loopdev.part(n);
            debug!("checking {} filesystem on {}", kind, device.display());
            match ctx.host.check(&device, kind) {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => warn!("{}", err),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Measure usage of mounted root filesystem.
pub struct MeasureUsage;

impl<H: Host> Step<DiskContext<'_, H>> for MeasureUsage {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let mountpoint = ctx.root_mountpoint("measure usage")?;
        let usage = ctx.host.usage(mountpoint)?;
        info!("root filesystem usage: {}%", usage);
        ctx.usage = Some(usage);
        Ok(())
    }
}

/// Grow unmounted root filesystem to fill its partition.
pub struct GrowRootFs;

impl<H: Host> Step<DiskContext<'_, H>> for GrowRootFs {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        if ctx.root_mount.is_some() {
            return Err(DiskError::GrowthFailed {
                action: "grow",
                resource: ctx.loopdev("grow root filesystem")?.part(2),
                message: "filesystem is mounted".to_string(),
            });
        }
        let device = ctx.loopdev("grow root filesystem")?.part(2);
        info!("growing root filesystem on {}", device.display());
        ctx.host.grow(&device)
    }
}
