use log::trace;
use std::path::{Path, PathBuf};
use std::{fmt, fs, io, os::unix};

use super::error::{DiskError, Result};

/// Directory adapter.
///
/// Provides some helpful methods to operate on directories.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Directory<'a> {
    path: &'a Path,
}

impl<'a> Directory<'a> {
    /// Create new adapter for directory at given path.
    ///
    /// # Errors
    ///
    /// - Returns error if `path` is not a directory.
    pub fn from_path(path: &'a Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(DiskError::io("read directory", path))?;
        if metadata.is_dir() {
            Ok(Self { path })
        } else {
            Err(DiskError::io("read directory", path)(io::Error::other(
                "not a directory",
            )))
        }
    }

    /// Path to directory.
    pub fn path(&self) -> &'a Path {
        self.path
    }

    /// Size of all content in directory in bytes.
    pub fn size(&self) -> Result<u64> {
        fs_extra::dir::get_size(self.path)
            .map_err(|e| DiskError::io("get size of", self.path)(io::Error::other(e.to_string())))
    }

    /// Copy all the content of the directory into another directory.
    ///
    /// This function **DOES NOT** follow symlinks.
    /// They are copied as they are.
    /// So it is possible to copy a symlink to non-existing file.
    pub fn copy_content(&self, target_dir: &Path) -> Result<()> {
        let mut stack = vec![self.path.to_path_buf()];

        let input_root = self.path.components().count();
        let io_err = |err: io::Error| DiskError::Io {
            action: "copy directory content",
            resource: self.path.to_path_buf(),
            source: err,
        };

        while let Some(working_path) = stack.pop() {
            trace!("entering: {}", working_path.display());
            let dest = target_dir.join(
                working_path
                    .components()
                    .skip(input_root)
                    .collect::<PathBuf>(),
            );

            if !dest.is_dir() {
                trace!(" mkdir: {}", dest.display());
                fs::create_dir_all(&dest).map_err(io_err)?;
            }

            for entry in fs::read_dir(&working_path).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let path = entry.path();
                let dest_path = dest.join(entry.file_name());
                // Not following symlinks here
                let file_type = entry.file_type().map_err(io_err)?;

                if file_type.is_symlink() {
                    let target = fs::read_link(&path).map_err(io_err)?;
                    trace!("  symlink {} -> {}", dest_path.display(), target.display());
                    unix::fs::symlink(target, dest_path).map_err(io_err)?;
                } else if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    trace!("  copy: {} -> {}", path.display(), dest_path.display());
                    fs::copy(&path, &dest_path).map_err(io_err)?;
                } else {
                    return Err(io_err(io::Error::other(format!(
                        "unknown type of the file: {}",
                        path.display()
                    ))));
                }
            }
            trace!("exiting: {}", working_path.display());
        }
        Ok(())
    }

    /// Remove everything inside the directory, keeping the directory itself.
    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(self.path).map_err(DiskError::io("clear", self.path))? {
            let entry = entry.map_err(DiskError::io("clear", self.path))?;
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .map_err(DiskError::io("clear", &path))?
                .is_dir();
            if is_dir {
                fs::remove_dir_all(&path).map_err(DiskError::io("remove", &path))?;
            } else {
                fs::remove_file(&path).map_err(DiskError::io("remove", &path))?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Directory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

impl fmt::Display for Directory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}
