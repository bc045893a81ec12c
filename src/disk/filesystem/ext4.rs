use log::{debug, warn};
use std::ffi::OsStr;
use std::path::Path;

use crate::disk::error::{DiskError, Result};
use crate::disk::utils::{run_command, CommandError};

/// Volume label of the root filesystem.
const VOLUME_LABEL: &str = "root";

/// Filesystem block size in bytes.
const BLOCK_SIZE: u64 = 0x1000;

/// `e2fsck` exit codes meaning the filesystem is consistent now.
///
/// 1 - errors corrected, 2 - errors corrected, reboot required.
const E2FSCK_CORRECTED: [i32; 2] = [1, 2];

/// Create new filesystem with `mkfs.ext4`.
pub fn format(device: &Path) -> Result<()> {
    run_command([
        OsStr::new("mkfs.ext4"),
        // quiet
        OsStr::new("-q"),
        // don't ask about existing filesystems
        OsStr::new("-F"),
        // block size
        OsStr::new("-b"),
        OsStr::new(BLOCK_SIZE.to_string().as_str()),
        // don't reserve blocks for super-user
        OsStr::new("-m"),
        OsStr::new("0"),
        OsStr::new("-L"),
        OsStr::new(VOLUME_LABEL),
        device.as_os_str(),
    ])
    .map_err(|err| DiskError::PartitionToolError {
        action: "create ext4 filesystem on",
        resource: device.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(())
}

/// Run `e2fsck -f -p`, treating corrected errors as success.
fn e2fsck(device: &Path) -> std::result::Result<(), CommandError> {
    match run_command([
        OsStr::new("e2fsck"),
        // force check even if the filesystem seems clean
        OsStr::new("-f"),
        // repair automatically
        OsStr::new("-p"),
        device.as_os_str(),
    ]) {
        Ok(_) => Ok(()),
        Err(err) if err.code().is_some_and(|code| E2FSCK_CORRECTED.contains(&code)) => {
            warn!("e2fsck corrected errors on {}", device.display());
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Check filesystem with `e2fsck -f -p`.
pub fn check(device: &Path) -> Result<()> {
    e2fsck(device).map_err(|err| DiskError::IntegrityCheckInconclusive {
        resource: device.to_path_buf(),
        message: err.to_string(),
    })
}

/// Grow unmounted filesystem to the size of its partition.
///
/// `resize2fs` refuses to resize a filesystem which wasn't checked recently,
/// so the check runs first.
pub fn grow(device: &Path) -> Result<()> {
    let growth_err = |err: CommandError| DiskError::GrowthFailed {
        action: "grow filesystem on",
        resource: device.to_path_buf(),
        message: err.to_string(),
    };
    e2fsck(device).map_err(growth_err)?;
    run_command([OsStr::new("resize2fs"), device.as_os_str()]).map_err(growth_err)?;
    debug!("filesystem on {} resized", device.display());
    Ok(())
}
