use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};
use fscommon::StreamSlice;
use std::ffi::OsStr;
use std::fs;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::disk::error::{DiskError, Result};
use crate::disk::utils::run_command;

/// Volume label of the ESP.
const VOLUME_LABEL: [u8; 11] = *b"ESP        ";

/// FAT32 filesystem adapter.
///
/// This adapter doesn't assume any mounting.
/// Reading/writing can be done with [`Self::fs()`] handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fat32<'a> {
    /// Path to image file or device.
    path: &'a Path,

    /// Inclusive offset of the filesystem in bytes.
    start: u64,

    /// Exclusive offset of the filesystem in bytes.
    end: u64,
}

impl<'a> Fat32<'a> {
    /// Format new FAT32 filesystem.
    ///
    /// # Arguments
    /// - `path` - image file or block device
    /// - `start` - inclusive starting offset of the partition in bytes
    /// - `end` - exclusive ending offset of the partition in bytes
    pub fn format(path: &'a Path, start: u64, end: u64) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(DiskError::io("open", path))?;
        let slice = StreamSlice::new(file, start, end).map_err(DiskError::io("seek", path))?;
        let options = FormatVolumeOptions::new()
            .fat_type(FatType::Fat32)
            .volume_label(VOLUME_LABEL);
        fatfs::format_volume(slice, options).map_err(|err| DiskError::PartitionToolError {
            action: "create FAT32 filesystem on",
            resource: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Self { path, start, end })
    }

    /// Read existing FAT32 filesystem.
    ///
    /// # Arguments
    /// - `path` - image file or block device
    /// - `start` - inclusive starting offset of the partition in bytes
    /// - `end` - exclusive ending offset of the partition in bytes
    pub fn read_from(path: &'a Path, start: u64, end: u64) -> Result<Self> {
        let adapter = Self { path, start, end };
        let _ = adapter.fs()?;
        Ok(adapter)
    }

    /// Filesystem handler.
    pub fn fs(&self) -> Result<FileSystem<StreamSlice<fs::File>>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path)
            .map_err(DiskError::io("open", self.path))?;
        let slice = StreamSlice::new(file, self.start, self.end)
            .map_err(DiskError::io("seek", self.path))?;
        FileSystem::new(slice, FsOptions::new()).map_err(|err| DiskError::MountFailed {
            action: "read FAT32 filesystem on",
            resource: self.path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Paths of all regular files, relative to the filesystem root.
    pub fn files(&self) -> Result<Vec<String>> {
        let fs = self.fs()?;
        let mut files = Vec::new();
        let mut stack = vec![(String::new(), fs.root_dir())];
        while let Some((prefix, dir)) = stack.pop() {
            for entry in dir.iter() {
                let entry = entry.map_err(DiskError::io("list FAT32 files on", self.path))?;
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let path = format!("{}{}", prefix, name);
                if entry.is_dir() {
                    stack.push((format!("{}/", path), entry.to_dir()));
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Format whole block device as FAT32.
pub fn format_device(device: &Path) -> Result<()> {
    let size = fs::File::open(device)
        .and_then(|mut file| file.seek(SeekFrom::End(0)))
        .map_err(DiskError::io("get size of", device))?;
    Fat32::format(device, 0, size)?;
    Ok(())
}

/// Check FAT filesystem with `fsck.vfat -a`.
pub fn check(device: &Path) -> Result<()> {
    match run_command([OsStr::new("fsck.vfat"), OsStr::new("-a"), device.as_os_str()]) {
        Ok(_) => Ok(()),
        Err(err) => Err(DiskError::IntegrityCheckInconclusive {
            resource: device.to_path_buf(),
            message: err.to_string(),
        }),
    }
}
