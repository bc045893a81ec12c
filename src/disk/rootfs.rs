//! Root filesystem content.
//!
//! Main type is [`RootContent`], which represents files to put on the root
//! partition of the image.

use bytesize::ByteSize;
use log::{debug, info};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::core::Step;
use super::directory::Directory;
use super::error::{DiskError, Result};
use super::host::Host;
use super::DiskContext;

/// Source of root filesystem content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootContent {
    /// Directory tree copied as is.
    Dir(PathBuf),
    /// Tar archive unpacked into the filesystem.
    Tar(PathBuf),
}

impl RootContent {
    /// Detect content kind of given path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(DiskError::io("read root content", path))?;
        if metadata.is_dir() {
            Ok(Self::Dir(path.to_path_buf()))
        } else {
            Ok(Self::Tar(path.to_path_buf()))
        }
    }

    /// Path to root content on host machine.
    pub fn path(&self) -> &Path {
        match self {
            Self::Dir(path) | Self::Tar(path) => path.as_path(),
        }
    }

    /// Install content into mounted filesystem.
    pub fn install(&self, mountpoint: &Path) -> Result<()> {
        match self {
            Self::Dir(path) => {
                let directory = Directory::from_path(path)?;
                debug!(
                    "copying {} ({})",
                    &directory,
                    ByteSize::b(directory.size()?)
                );
                directory.copy_content(mountpoint)
            }
            Self::Tar(path) => {
                let file = fs::File::open(path).map_err(DiskError::io("open", path))?;
                let mut archive = tar::Archive::new(file);
                archive.set_preserve_permissions(true);
                archive.set_unpack_xattrs(true);
                archive
                    .unpack(mountpoint)
                    .map_err(DiskError::io("unpack", path))
            }
        }
    }
}

impl fmt::Display for RootContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path().display()))
    }
}

/// Install configured root content to the root partition.
pub struct InstallRootContent;

impl<H: Host> Step<DiskContext<'_, H>> for InstallRootContent {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let Some(path) = &ctx.config.root_content else {
            debug!("no root content configured");
            return Ok(());
        };
        let content = RootContent::from_path(path)?;
        info!("installing root content: {}", &content);
        content.install(ctx.root_mountpoint("install root content")?)?;
        debug!("root content installed");
        Ok(())
    }
}
