//! Disk image configuration.
//!
//! Values are layered: built-in defaults, then config file, then command line
//! flags and environment variables (see [`ConfigOverrides`]).

use bytesize::ByteSize;
use clap::ValueHint;
use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::disk::error::{DiskError, Result};

/// Smallest image able to hold ESP and a usable root partition.
pub const MIN_IMAGE_SIZE: ByteSize = ByteSize::mib(96);

/// Name of the config file inside the config directory.
const CONFIG_FILE: &str = "config.toml";

/// Disk image configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Disk image file.
    pub image: PathBuf,

    /// Size of newly created image.
    pub size: ByteSize,

    /// Root filesystem usage (percent) triggering growth.
    pub grow_threshold: u8,

    /// Kernel image.
    pub kernel: PathBuf,

    /// Payload archive loaded by the kernel at early boot.
    pub payload: PathBuf,

    /// Directory or tar archive unpacked into root filesystem.
    pub root_content: Option<PathBuf>,

    /// UEFI bootloader binary.
    pub bootloader: PathBuf,

    /// Bootloader support modules installed next to the binary.
    pub bootloader_modules: Vec<PathBuf>,

    /// Kernel console.
    pub console: String,

    /// Root device as seen by the guest kernel.
    pub root_device: String,

    pub launcher: LauncherConfig,
}

/// Settings passed through to the emulator launcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    pub memory: ByteSize,
    pub firmware: PathBuf,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            memory: ByteSize::gib(1),
            firmware: PathBuf::from("/usr/share/ovmf/OVMF.fd"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: PathBuf::from("disk.img"),
            size: ByteSize::mib(128),
            grow_threshold: 90,
            kernel: PathBuf::from("bzImage"),
            payload: PathBuf::from("initramfs.img"),
            root_content: None,
            bootloader: PathBuf::from("/usr/share/syslinux/efi64/syslinux.efi"),
            bootloader_modules: vec![PathBuf::from("/usr/share/syslinux/efi64/ldlinux.e64")],
            console: "ttyS0".to_string(),
            root_device: "/dev/vda2".to_string(),
            launcher: LauncherConfig::default(),
        }
    }
}

impl Config {
    /// Parse config from TOML. Missing fields take default values.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| DiskError::Config(err.to_string()))
    }

    /// Default location of the config file.
    ///
    /// Normally it will be `$HOME/.config/vmdisk/config.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "vmdisk").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from `path`.
    ///
    /// Without explicit path the default location is used if the file exists there.
    /// Otherwise built-in defaults are returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|path| path.is_file()) {
                Some(path) => path,
                None => {
                    debug!("no config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        debug!("loading config: {}", path.display());
        let content = fs::read_to_string(&path).map_err(DiskError::io("read config", &path))?;
        Self::from_toml(&content)
            .map_err(|err| DiskError::Config(format!("{}: {}", path.display(), err)))
    }

    /// Check values which can't be expressed by types.
    pub fn validate(&self) -> Result<()> {
        if self.size < MIN_IMAGE_SIZE {
            return Err(DiskError::Config(format!(
                "image size {} is less than minimum {}",
                self.size, MIN_IMAGE_SIZE
            )));
        }
        if !(1..=100).contains(&self.grow_threshold) {
            return Err(DiskError::Config(format!(
                "grow threshold must be within 1..=100, got {}",
                self.grow_threshold
            )));
        }
        if self.image.as_os_str().is_empty() {
            return Err(DiskError::Config("image path is empty".to_string()));
        }
        Ok(())
    }
}

/// Command line and environment overrides of [`Config`].
#[derive(Clone, Debug, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Disk image file.
    #[arg(
        global = true,
        long,
        short,
        env = "VMDISK_IMAGE",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    pub image: Option<PathBuf>,

    /// Size of newly created image (e.g. "256 MiB").
    #[arg(global = true, long, short, env = "VMDISK_SIZE", value_name = "SIZE")]
    pub size: Option<ByteSize>,

    /// Root filesystem usage (percent) triggering growth.
    #[arg(
        global = true,
        long,
        env = "VMDISK_GROW_THRESHOLD",
        value_name = "PERCENT",
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub grow_threshold: Option<u8>,

    /// Kernel image.
    #[arg(
        global = true,
        long,
        env = "VMDISK_KERNEL",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    pub kernel: Option<PathBuf>,

    /// Payload archive loaded by the kernel at early boot.
    #[arg(
        global = true,
        long,
        env = "VMDISK_PAYLOAD",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    pub payload: Option<PathBuf>,

    /// Directory or tar archive with root filesystem content.
    #[arg(
        global = true,
        long,
        env = "VMDISK_ROOT_CONTENT",
        value_name = "PATH",
        value_hint = ValueHint::AnyPath
    )]
    pub root_content: Option<PathBuf>,

    /// UEFI bootloader binary.
    #[arg(
        global = true,
        long,
        env = "VMDISK_BOOTLOADER",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    pub bootloader: Option<PathBuf>,

    /// Kernel console.
    #[arg(global = true, long, env = "VMDISK_CONSOLE")]
    pub console: Option<String>,

    /// Root device as seen by the guest kernel.
    #[arg(global = true, long, env = "VMDISK_ROOT_DEVICE", value_name = "DEVICE")]
    pub root_device: Option<String>,

    /// Memory of the virtual machine.
    #[arg(global = true, long, env = "VMDISK_MEMORY", value_name = "SIZE")]
    pub memory: Option<ByteSize>,

    /// UEFI firmware used by the launcher.
    #[arg(
        global = true,
        long,
        env = "VMDISK_FIRMWARE",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    pub firmware: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Replace config values with the ones set here.
    pub fn apply(&self, config: &mut Config) {
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(size) = self.size {
            config.size = size;
        }
        if let Some(grow_threshold) = self.grow_threshold {
            config.grow_threshold = grow_threshold;
        }
        if let Some(kernel) = &self.kernel {
            config.kernel = kernel.clone();
        }
        if let Some(payload) = &self.payload {
            config.payload = payload.clone();
        }
        if let Some(root_content) = &self.root_content {
            config.root_content = Some(root_content.clone());
        }
        if let Some(bootloader) = &self.bootloader {
            config.bootloader = bootloader.clone();
        }
        if let Some(console) = &self.console {
            config.console = console.clone();
        }
        if let Some(root_device) = &self.root_device {
            config.root_device = root_device.clone();
        }
        if let Some(memory) = self.memory {
            config.launcher.memory = memory;
        }
        if let Some(firmware) = &self.firmware {
            config.launcher.firmware = firmware.clone();
        }
    }
}
