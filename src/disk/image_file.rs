use bytesize::ByteSize;
use log::{debug, info};
use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::core::Step;
use super::error::{DiskError, Result};
use super::host::Host;
use super::{DiskContext, ImageState};

/// Disk image file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageFile {
    /// Path to the file.
    path: PathBuf,
}

impl ImageFile {
    /// Create new zero-filled image file with given size, replacing existing one.
    pub fn create<P>(path: P, size: u64) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if size == 0 {
            return Err(DiskError::Config("image size must be positive".to_string()));
        }
        if path.exists() {
            fs::remove_file(path).map_err(DiskError::io("remove image file", path))?;
        }
        let mut file = File::create_new(path).map_err(DiskError::io("create image file", path))?;

        // This will create sparse file on Linux
        file.seek(SeekFrom::Start(size - 1))
            .map_err(DiskError::io("seek for image size", path))?;
        file.write_all(&[0])
            .map_err(DiskError::io("extend image file", path))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Use existing image file.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(DiskError::io("open image file", path))?;
        if !meta.is_file() {
            return Err(DiskError::Io {
                action: "open image file",
                resource: path.to_path_buf(),
                source: std::io::Error::other("not a regular file"),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Extend file by `value` bytes returning old size.
    pub fn extend(&self, value: u64) -> Result<u64> {
        let current_size = self.size()?;

        if value == 0 {
            return Ok(current_size);
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(DiskError::io("open image file", &self.path))?;

        file.seek(SeekFrom::Start(current_size + value - 1))
            .map_err(DiskError::io("seek for image size", &self.path))?;
        file.write_all(&[0])
            .map_err(DiskError::io("extend image file", &self.path))?;

        Ok(current_size)
    }

    /// Double the file size returning the new size.
    pub fn double(&self) -> Result<u64> {
        let old = self.extend(self.size()?)?;
        Ok(old * 2)
    }

    /// Delete image file.
    pub fn delete(self) -> Result<()> {
        fs::remove_file(&self.path).map_err(DiskError::io("delete image file", &self.path))
    }

    /// Path to file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Current size of the file.
    pub fn size(&self) -> Result<u64> {
        let meta =
            fs::metadata(&self.path).map_err(DiskError::io("get image file metadata", &self.path))?;
        Ok(meta.len())
    }
}

impl fmt::Display for ImageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}

impl AsRef<OsStr> for ImageFile {
    fn as_ref(&self) -> &OsStr {
        self.path.as_os_str()
    }
}

/// Create new disk image file of the configured size.
pub struct CreateImageFile;

impl<H: Host> Step<DiskContext<'_, H>> for CreateImageFile {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        info!("creating image file: {}", ctx.config.image.display());
        ctx.state = ImageState::Creating;
        let image_file = ImageFile::create(&ctx.config.image, ctx.config.size.as_u64())?;
        debug!(
            "image file created: {} ({})",
            &image_file,
            ByteSize::b(image_file.size()?),
        );
        ctx.image = Some(image_file);
        Ok(())
    }
}

/// Use existing disk image file.
pub struct OpenImageFile;

impl<H: Host> Step<DiskContext<'_, H>> for OpenImageFile {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let image_file = ImageFile::open(&ctx.config.image)?;
        debug!(
            "using image file: {} ({})",
            &image_file,
            ByteSize::b(image_file.size()?)
        );
        ctx.image = Some(image_file);
        Ok(())
    }
}

/// Double the size of detached image file.
pub struct GrowImageFile;

impl<H: Host> Step<DiskContext<'_, H>> for GrowImageFile {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        if ctx.loopdev.is_some() {
            return Err(DiskError::invalid_context("grow image file", "detached image"));
        }
        ctx.state = ImageState::Growing;
        let image_file = ctx.image("grow image file")?;
        let old_size = image_file.size()?;
        let new_size = image_file.double()?;
        info!(
            "image file resized: {} -> {}",
            ByteSize::b(old_size),
            ByteSize::b(new_size)
        );
        Ok(())
    }
}
