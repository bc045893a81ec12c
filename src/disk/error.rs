//! Error taxonomy of disk image operations.

use std::io;
use std::path::{Path, PathBuf};

/// Result of disk image operations.
pub type Result<T, E = DiskError> = std::result::Result<T, E>;

/// Disk image operation error.
///
/// Every variant names the action that failed and the resource involved.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// No free loop device is available.
    #[error("cannot {action} {}: no free loop device", .resource.display())]
    ResourceBusy {
        action: &'static str,
        resource: PathBuf,
    },

    /// Loop device could not be set up or released.
    #[error("failed to {action} {}: {message}", .resource.display())]
    DeviceAllocationFailed {
        action: &'static str,
        resource: PathBuf,
        message: String,
    },

    /// Partition table cannot be written or read, or partition cannot be formatted.
    #[error("failed to {action} {}: {message}", .resource.display())]
    PartitionToolError {
        action: &'static str,
        resource: PathBuf,
        message: String,
    },

    #[error("failed to {action} {}: {message}", .resource.display())]
    MountFailed {
        action: &'static str,
        resource: PathBuf,
        message: String,
    },

    /// Filesystem refused to expand.
    #[error("failed to {action} {}: {message}", .resource.display())]
    GrowthFailed {
        action: &'static str,
        resource: PathBuf,
        message: String,
    },

    /// Consistency check reported problems. Never fatal.
    #[error("consistency check of {} was inconclusive: {message}", .resource.display())]
    IntegrityCheckInconclusive { resource: PathBuf, message: String },

    /// Required boot file is absent on an otherwise mountable partition.
    #[error("boot artifact {} is missing on {}", .artifact.display(), .resource.display())]
    MissingArtifact { artifact: PathBuf, resource: PathBuf },

    /// Image was found broken and has to be recreated.
    #[error("disk image {} is invalid", .resource.display())]
    InvalidImage {
        resource: PathBuf,
        #[source]
        reason: Box<DiskError>,
    },

    /// Creation of a fresh image failed. The image file was removed.
    #[error("failed to create disk image {}", .resource.display())]
    FatalCreationError {
        resource: PathBuf,
        #[source]
        source: Box<DiskError>,
    },

    #[error("failed to {action} {}: {source}", .resource.display())]
    Io {
        action: &'static str,
        resource: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Step ran without something an earlier step had to provide.
    #[error("internal error: cannot {action}: {element} not found")]
    InvalidContext {
        action: &'static str,
        element: &'static str,
    },
}

impl DiskError {
    /// Map I/O error on `resource` into [`DiskError::Io`].
    pub fn io<P: AsRef<Path>>(action: &'static str, resource: P) -> impl FnOnce(io::Error) -> Self {
        let resource = resource.as_ref().to_path_buf();
        move |source| Self::Io {
            action,
            resource,
            source,
        }
    }

    pub fn invalid_context(action: &'static str, element: &'static str) -> Self {
        Self::InvalidContext { action, element }
    }

    /// Wrap validation failure into [`DiskError::InvalidImage`].
    pub fn invalid<P: AsRef<Path>>(resource: P) -> impl FnOnce(DiskError) -> Self {
        let resource = resource.as_ref().to_path_buf();
        move |reason| match reason {
            already @ Self::InvalidImage { .. } => already,
            reason => Self::InvalidImage {
                resource,
                reason: Box::new(reason),
            },
        }
    }

    /// Whether the image this error came from must be discarded and recreated.
    pub fn invalidates_image(&self) -> bool {
        matches!(self, Self::InvalidImage { .. })
    }

    /// Whether the pipeline may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::IntegrityCheckInconclusive { .. })
    }
}
