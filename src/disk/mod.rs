//! Disk image lifecycle.
//!
//! [`DiskManager`] keeps a bootable GPT disk image (FAT32 ESP and ext4 root)
//! ready for the launcher: creates it when absent, validates it when present,
//! recreates it when broken and grows it when the root filesystem fills up.
//!
//! Every operation is a [`Pipeline`] of steps sharing one [`DiskContext`].
//! Loop devices and mounts acquired by the steps live in the context as guards
//! and are released when the context is dropped, whatever the outcome.

use bytesize::ByteSize;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Config;

pub mod bootloader;
pub mod core;
pub mod directory;
pub mod error;
pub mod filesystem;
pub mod gpt;
pub mod host;
pub mod image_file;
pub mod loopdev;
pub mod mount;
pub mod rootfs;
#[cfg(test)]
pub mod testing;
pub mod utils;

use self::core::{Pipeline, Step, Steps};
use bootloader::{
    InstallBootArtifacts, InstallBootloader, InstallBootloaderCfg, VerifyBootArtifacts,
};
use error::{DiskError, Result};
use filesystem::{CheckFileSystems, FormatPartitions, GrowRootFs, MeasureUsage};
use gpt::{CreatePartitionTable, ExpandRootPartition, PartitionLayout, ReadPartitionTable};
use host::Host;
use image_file::{CreateImageFile, GrowImageFile, ImageFile, OpenImageFile};
use loopdev::{
    AttachLoopDevice, DetachLoopDevice, LoopDev, LoopGuard, RereadPartitions, WaitForPartitions,
};
use mount::{MountGuard, MountPartitions, UnmountPartitions};
use rootfs::InstallRootContent;

/// Lifecycle state of the disk image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Absent,
    Creating,
    Valid,
    Invalid,
    Growing,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Growing => "growing",
        };
        f.write_str(state)
    }
}

/// Context shared by the steps of one operation.
pub struct DiskContext<'h, H: Host> {
    pub host: &'h H,
    pub config: &'h Config,
    pub state: ImageState,
    pub image: Option<ImageFile>,
    pub layout: Option<PartitionLayout>,
    pub loopdev: Option<LoopGuard<'h, H>>,
    pub esp_mount: Option<MountGuard<'h, H>>,
    pub root_mount: Option<MountGuard<'h, H>>,
    /// Root filesystem usage in percent.
    pub usage: Option<u8>,
}

impl<'h, H: Host> DiskContext<'h, H> {
    pub fn new(host: &'h H, config: &'h Config) -> Self {
        Self {
            host,
            config,
            state: ImageState::Absent,
            image: None,
            layout: None,
            loopdev: None,
            esp_mount: None,
            root_mount: None,
            usage: None,
        }
    }

    pub fn image(&self, action: &'static str) -> Result<&ImageFile> {
        self.image
            .as_ref()
            .ok_or(DiskError::invalid_context(action, "image file"))
    }

    pub fn loopdev(&self, action: &'static str) -> Result<&LoopDev> {
        self.loopdev
            .as_ref()
            .map(|guard| guard.loopdev())
            .ok_or(DiskError::invalid_context(action, "loop device"))
    }

    pub fn esp_mountpoint(&self, action: &'static str) -> Result<&Path> {
        self.esp_mount
            .as_ref()
            .map(|guard| guard.path())
            .ok_or(DiskError::invalid_context(action, "ESP mount point"))
    }

    pub fn root_mountpoint(&self, action: &'static str) -> Result<&Path> {
        self.root_mount
            .as_ref()
            .map(|guard| guard.path())
            .ok_or(DiskError::invalid_context(action, "root mount point"))
    }
}

impl<'h, H: Host> Drop for DiskContext<'h, H> {
    fn drop(&mut self) {
        // Filesystems go before the loop device backing them
        drop(self.root_mount.take());
        drop(self.esp_mount.take());
        drop(self.loopdev.take());
    }
}

/// Step wrapper marking the image invalid when the wrapped step finds it broken.
///
/// Only errors describing the image content are classified. Host failures
/// (I/O, missing tools, busy devices) pass through unchanged.
struct Invalidates<S>(S);

impl<'h, H: Host, S: Step<DiskContext<'h, H>>> Step<DiskContext<'h, H>> for Invalidates<S> {
    fn run(&mut self, ctx: &mut DiskContext<'h, H>) -> Result<()> {
        match self.0.run(ctx) {
            Err(
                err @ (DiskError::PartitionToolError { .. }
                | DiskError::MountFailed { .. }
                | DiskError::MissingArtifact { .. }),
            ) => Err(DiskError::invalid(&ctx.config.image)(err)),
            result => result,
        }
    }

    fn name(&self) -> &'static str {
        self.0.name()
    }
}

fn create_steps<'h, H: Host>() -> Steps<'static, DiskContext<'h, H>> {
    let mut steps: Steps<_> = Vec::new();
    steps.push(Box::new(CreateImageFile));
    steps.push(Box::new(CreatePartitionTable));
    steps.push(Box::new(AttachLoopDevice));
    steps.push(Box::new(WaitForPartitions));
    steps.push(Box::new(FormatPartitions));
    steps.push(Box::new(MountPartitions));
    steps.push(Box::new(InstallRootContent));
    steps.push(Box::new(InstallBootloader));
    steps.push(Box::new(InstallBootArtifacts));
    steps.push(Box::new(InstallBootloaderCfg));
    steps.push(Box::new(UnmountPartitions));
    steps.push(Box::new(DetachLoopDevice));
    steps
}

/// Validation leaves the image attached and mounted.
fn validate_steps<'h, H: Host>() -> Steps<'static, DiskContext<'h, H>> {
    let mut steps: Steps<_> = Vec::new();
    steps.push(Box::new(OpenImageFile));
    steps.push(Box::new(Invalidates(ReadPartitionTable)));
    steps.push(Box::new(AttachLoopDevice));
    steps.push(Box::new(Invalidates(WaitForPartitions)));
    steps.push(Box::new(CheckFileSystems));
    steps.push(Box::new(Invalidates(MountPartitions)));
    steps.push(Box::new(Invalidates(VerifyBootArtifacts)));
    steps.push(Box::new(MeasureUsage));
    steps
}

fn release_steps<'h, H: Host>() -> Steps<'static, DiskContext<'h, H>> {
    let mut steps: Steps<_> = Vec::new();
    steps.push(Box::new(UnmountPartitions));
    steps.push(Box::new(DetachLoopDevice));
    steps
}

/// GPT repair and partition resize happen on the detached file,
/// filesystem growth on the re-attached one.
fn grow_steps<'h, H: Host>() -> Steps<'static, DiskContext<'h, H>> {
    let mut steps: Steps<_> = Vec::new();
    steps.push(Box::new(UnmountPartitions));
    steps.push(Box::new(DetachLoopDevice));
    steps.push(Box::new(GrowImageFile));
    steps.push(Box::new(ExpandRootPartition));
    steps.push(Box::new(AttachLoopDevice));
    steps.push(Box::new(RereadPartitions));
    steps.push(Box::new(WaitForPartitions));
    steps.push(Box::new(GrowRootFs));
    steps.push(Box::new(DetachLoopDevice));
    steps
}

/// Action taken on the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Validated,
    Recreated,
    Grown,
}

/// Settings the launcher boots the image with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchParams {
    pub memory: ByteSize,
    pub firmware: PathBuf,
    pub console: String,
}

/// Outcome of a disk image operation.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub image: PathBuf,
    pub state: ImageState,
    pub actions: Vec<Action>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<ByteSize>,

    /// Root filesystem usage in percent, measured during validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<u8>,

    /// Why the image was found invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub launcher: LaunchParams,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<PartitionLayout>,
}

impl Report {
    fn new(config: &Config) -> Self {
        Self {
            image: config.image.clone(),
            state: ImageState::Absent,
            actions: Vec::new(),
            size: None,
            usage: None,
            reason: None,
            launcher: LaunchParams {
                memory: config.launcher.memory,
                firmware: config.launcher.firmware.clone(),
                console: config.console.clone(),
            },
            layout: None,
        }
    }

    /// Fill in size and layout of the image file.
    fn describe_image(&mut self) -> Result<()> {
        let image = ImageFile::open(&self.image)?;
        self.size = Some(ByteSize::b(image.size()?));
        self.layout = gpt::read_layout(image.path()).ok();
        Ok(())
    }
}

/// Error message followed by messages of all its sources.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

/// Disk image orchestrator.
pub struct DiskManager<'h, H: Host> {
    host: &'h H,
    config: &'h Config,
}

impl<'h, H: Host> DiskManager<'h, H> {
    pub fn new(host: &'h H, config: &'h Config) -> Self {
        Self { host, config }
    }

    /// Make sure the image exists, is valid and has free space.
    ///
    /// - absent image is created
    /// - invalid image is deleted and created again
    /// - image with root usage at or above the threshold is grown
    ///
    /// No loop device or mount acquired here outlives the call.
    pub fn ensure_ready(&self) -> Result<Report> {
        self.config.validate()?;
        let mut report = Report::new(self.config);

        if !self.config.image.exists() {
            info!("disk image {} is absent", self.config.image.display());
            report.state = self.create_image()?;
            report.actions.push(Action::Created);
        } else {
            let mut ctx = DiskContext::new(self.host, self.config);
            let validation = Pipeline::from_steps(&mut ctx, validate_steps()).run();
            match validation {
                Ok(()) => {
                    ctx.state = ImageState::Valid;
                    report.actions.push(Action::Validated);
                    let usage = ctx
                        .usage
                        .ok_or(DiskError::invalid_context("decide growth", "root usage"))?;
                    report.usage = Some(usage);
                    if usage >= self.config.grow_threshold {
                        info!(
                            "root filesystem usage {}% reached threshold {}%, growing image",
                            usage, self.config.grow_threshold
                        );
                        Pipeline::from_steps(&mut ctx, grow_steps()).run()?;
                        ctx.state = ImageState::Valid;
                        report.actions.push(Action::Grown);
                    } else {
                        Pipeline::from_steps(&mut ctx, release_steps()).run()?;
                    }
                    report.state = ctx.state;
                }
                Err(err) if err.invalidates_image() => {
                    // Release everything before the file goes away
                    drop(ctx);
                    warn!("{}", error_chain(&err));
                    report.reason = Some(error_chain(&err));
                    self.discard()?;
                    report.state = self.create_image()?;
                    report.actions.push(Action::Recreated);
                }
                Err(err) => return Err(err),
            }
        }

        report.describe_image()?;
        info!("disk image {} is ready", self.config.image.display());
        Ok(report)
    }

    /// Create fresh image, replacing existing one.
    pub fn create(&self) -> Result<Report> {
        self.config.validate()?;
        let mut report = Report::new(self.config);
        if self.config.image.exists() {
            self.discard()?;
        }
        report.state = self.create_image()?;
        report.actions.push(Action::Created);
        report.describe_image()?;
        Ok(report)
    }

    /// Validate existing image without changing it.
    ///
    /// Broken image is reported as [`ImageState::Invalid`] with a reason
    /// instead of an error.
    pub fn validate(&self) -> Result<Report> {
        let mut report = Report::new(self.config);
        if !self.config.image.exists() {
            return Ok(report);
        }

        let mut ctx = DiskContext::new(self.host, self.config);
        let validation = Pipeline::from_steps(&mut ctx, validate_steps()).run();
        match validation {
            Ok(()) => {
                report.usage = ctx.usage;
                Pipeline::from_steps(&mut ctx, release_steps()).run()?;
                report.state = ImageState::Valid;
            }
            Err(err) if err.invalidates_image() => {
                drop(ctx);
                report.state = ImageState::Invalid;
                report.reason = Some(error_chain(&err));
            }
            Err(err) => return Err(err),
        }
        report.actions.push(Action::Validated);
        report.describe_image()?;
        Ok(report)
    }

    /// Delete image file.
    fn discard(&self) -> Result<()> {
        info!("discarding disk image {}", self.config.image.display());
        ImageFile::open(&self.config.image)?.delete()
    }

    /// Run creation pipeline. On failure the partial image is deleted.
    fn create_image(&self) -> Result<ImageState> {
        let mut ctx = DiskContext::new(self.host, self.config);
        let creation = Pipeline::from_steps(&mut ctx, create_steps()).run();
        match creation {
            Ok(()) => {
                ctx.state = ImageState::Valid;
                if let Some(layout) = &ctx.layout {
                    debug!(
                        "disk image {} created:\n{}",
                        self.config.image.display(),
                        layout
                    );
                }
                Ok(ctx.state)
            }
            Err(err) => {
                // Detach before removing the backing file
                drop(ctx);
                let image = &self.config.image;
                if image.exists() {
                    if let Err(err) = ImageFile::open(image).and_then(ImageFile::delete) {
                        warn!("{}", err);
                    } else {
                        info!("partial disk image {} removed", image.display());
                    }
                }
                Err(DiskError::FatalCreationError {
                    resource: image.clone(),
                    source: Box::new(err),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::{error_chain, Action, DiskManager, ImageState};
    use crate::config::Config;
    use crate::disk::bootloader::KERNEL_PATH;
    use crate::disk::error::DiskError;
    use crate::disk::gpt::{read_layout, SECTOR_SIZE};
    use bytesize::ByteSize;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::Path;
    use tempdir::TempDir;

    const MIB: u64 = 1 << 20;

    fn setup(tmp: &Path) -> (FakeHost, Config) {
        let host = FakeHost::new(&tmp.join("host"));
        let artifacts = tmp.join("artifacts");
        fs::create_dir_all(artifacts.join("root/etc")).unwrap();
        for name in ["bzImage", "initramfs.img", "syslinux.efi", "ldlinux.e64"] {
            fs::write(artifacts.join(name), name.as_bytes()).unwrap();
        }
        fs::write(artifacts.join("root/etc/hostname"), vec![b'x'; MIB as usize]).unwrap();

        let config = Config {
            image: tmp.join("disk.img"),
            size: ByteSize::mib(128),
            kernel: artifacts.join("bzImage"),
            payload: artifacts.join("initramfs.img"),
            root_content: Some(artifacts.join("root")),
            bootloader: artifacts.join("syslinux.efi"),
            bootloader_modules: vec![artifacts.join("ldlinux.e64")],
            ..Default::default()
        };
        (host, config)
    }

    fn assert_released(host: &FakeHost) {
        assert!(host.attached().is_empty(), "attached: {:?}", host.attached());
        assert!(host.mounts().is_empty(), "mounted: {:?}", host.mounts());
    }

    #[test]
    fn test_fresh_image() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());

        let report = DiskManager::new(&host, &config).ensure_ready().unwrap();
        assert_eq!(report.state, ImageState::Valid);
        assert_eq!(report.actions, vec![Action::Created]);
        assert_eq!(report.size, Some(ByteSize::mib(128)));

        let layout = read_layout(&config.image).unwrap();
        assert_eq!(layout.esp.number, 1);
        assert_eq!(layout.root.number, 2);
        assert!(layout.esp.end_lba < layout.root.start_lba);
        assert_eq!(report.layout, Some(layout));

        let esp = host.content(&config.image, 1).unwrap();
        assert!(esp.join(KERNEL_PATH).is_file());
        assert!(esp.join("boot/initramfs.img").is_file());
        assert!(esp.join("EFI/BOOT/syslinux.cfg").is_file());
        assert!(esp.join("EFI/BOOT/ldlinux.e64").is_file());
        let root = host.content(&config.image, 2).unwrap();
        assert!(root.join("etc/hostname").is_file());

        assert_released(&host);
    }

    #[test]
    fn test_ensure_ready_is_idempotent() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();
        let formats = host.count("format");
        let image = fs::read(&config.image).unwrap();

        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.state, ImageState::Valid);
        assert_eq!(report.actions, vec![Action::Validated]);
        assert_eq!(report.usage, Some(2));
        assert_eq!(host.count("format"), formats);
        assert_eq!(host.count("grow"), 0);
        assert_eq!(fs::read(&config.image).unwrap(), image);
        assert_released(&host);
    }

    #[test]
    fn test_grow_when_full() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();
        let usage_before = manager.validate().unwrap().usage.unwrap();

        host.set_usage(Some(95));
        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Validated, Action::Grown]);
        assert_eq!(report.state, ImageState::Valid);
        assert_eq!(report.size, Some(ByteSize::mib(256)));
        assert_eq!(host.count("grow"), 1);
        assert_released(&host);

        let layout = read_layout(&config.image).unwrap();
        let sectors = 256 * MIB / SECTOR_SIZE;
        assert_eq!(layout.disk_sectors, sectors);
        assert_eq!(layout.root.end_lba, sectors - 34);

        host.set_usage(None);
        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Validated]);
        assert!(report.usage.unwrap() < usage_before);
        assert_eq!(host.count("grow"), 1);
        // content survived growth
        let root = host.content(&config.image, 2).unwrap();
        assert!(root.join("etc/hostname").is_file());
    }

    #[test]
    fn test_zeroed_table_is_recreated() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();

        let mut file = OpenOptions::new().write(true).open(&config.image).unwrap();
        file.write_all(&[0; 34 * SECTOR_SIZE as usize]).unwrap();
        drop(file);

        let report = manager.validate().unwrap();
        assert_eq!(report.state, ImageState::Invalid);
        assert!(report.reason.is_some());
        assert_released(&host);

        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Recreated]);
        assert_eq!(report.state, ImageState::Valid);
        assert!(read_layout(&config.image).is_ok());
        assert_released(&host);
    }

    #[test]
    fn test_missing_kernel_is_recreated() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();

        let esp = host.content(&config.image, 1).unwrap();
        fs::remove_file(esp.join(KERNEL_PATH)).unwrap();

        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Recreated]);
        assert!(report.reason.unwrap().contains("boot/vmlinuz"));
        assert!(esp.join(KERNEL_PATH).is_file());
        assert_released(&host);
    }

    #[test]
    fn test_failed_creation_cleans_up() {
        for op in ["attach", "format", "mount", "detach"] {
            let tmp = TempDir::new("manager-tests").unwrap();
            let (host, config) = setup(tmp.path());
            host.fail_once(op);

            let err = DiskManager::new(&host, &config).ensure_ready().unwrap_err();
            assert!(
                matches!(err, DiskError::FatalCreationError { .. }),
                "{}: {}",
                op,
                error_chain(&err)
            );
            assert!(!config.image.exists(), "{}", op);
            assert_released(&host);
        }
    }

    #[test]
    fn test_failed_unmount_cleans_up() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        host.fail_times("umount", 3);

        let err = DiskManager::new(&host, &config).ensure_ready().unwrap_err();
        assert!(matches!(err, DiskError::FatalCreationError { .. }));
        assert!(!config.image.exists());
        assert_released(&host);
    }

    #[test]
    fn test_unmount_escalation_during_creation() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        host.fail_once("umount");

        let report = DiskManager::new(&host, &config).ensure_ready().unwrap();
        assert_eq!(report.state, ImageState::Valid);
        assert_released(&host);
    }

    #[test]
    fn test_failed_check_is_not_fatal() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();

        host.fail_once("check");
        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Validated]);
        assert_released(&host);
    }

    #[test]
    fn test_failed_growth_is_fatal() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();

        host.set_usage(Some(95));
        host.fail_once("grow");
        let err = manager.ensure_ready().unwrap_err();
        assert!(matches!(err, DiskError::GrowthFailed { .. }));
        assert!(config.image.exists());
        assert_released(&host);
    }

    #[test]
    fn test_failed_attach_on_validation() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();

        host.fail_once("attach");
        let err = manager.ensure_ready().unwrap_err();
        assert!(!err.invalidates_image());
        // host failures never discard the image
        assert!(read_layout(&config.image).is_ok());
        assert_released(&host);
    }

    #[test]
    fn test_unmountable_filesystem_is_recreated() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();
        let formats = host.count("format");

        host.fail_once("mount");
        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Recreated]);
        assert_eq!(report.state, ImageState::Valid);
        assert!(report.reason.unwrap().contains("failed to mount"));
        assert!(host.count("format") > formats);
        assert!(read_layout(&config.image).is_ok());
        assert_released(&host);
    }

    #[test]
    fn test_failed_detach_on_validation() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let manager = DiskManager::new(&host, &config);
        manager.ensure_ready().unwrap();

        host.fail_once("detach");
        let err = manager.ensure_ready().unwrap_err();
        assert!(!err.invalidates_image(), "{}", error_chain(&err));
        assert!(read_layout(&config.image).is_ok());
        assert_released(&host);

        // next run starts from a clean host
        let report = manager.ensure_ready().unwrap();
        assert_eq!(report.actions, vec![Action::Validated]);
        assert_released(&host);
    }

    #[test]
    fn test_create_replaces_image() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, mut config) = setup(tmp.path());
        DiskManager::new(&host, &config).ensure_ready().unwrap();

        config.size = ByteSize::mib(192);
        let report = DiskManager::new(&host, &config).create().unwrap();
        assert_eq!(report.actions, vec![Action::Created]);
        assert_eq!(report.size, Some(ByteSize::mib(192)));
        assert_released(&host);
    }

    #[test]
    fn test_validate_absent() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let report = DiskManager::new(&host, &config).validate().unwrap();
        assert_eq!(report.state, ImageState::Absent);
        assert!(report.actions.is_empty());
        assert_eq!(host.count("attach"), 0);
    }

    #[test]
    fn test_invalid_config() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, mut config) = setup(tmp.path());
        config.size = ByteSize::mib(32);
        let err = DiskManager::new(&host, &config).ensure_ready().unwrap_err();
        assert!(matches!(err, DiskError::Config(_)));
        assert!(!config.image.exists());
    }

    #[test]
    fn test_missing_kernel_source_fails_creation() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, mut config) = setup(tmp.path());
        config.kernel = tmp.path().join("missing");
        let err = DiskManager::new(&host, &config).ensure_ready().unwrap_err();
        assert!(matches!(err, DiskError::FatalCreationError { .. }));
        assert!(!config.image.exists());
        assert_released(&host);
    }

    #[test]
    fn test_report_serializes() {
        let tmp = TempDir::new("manager-tests").unwrap();
        let (host, config) = setup(tmp.path());
        let report = DiskManager::new(&host, &config).ensure_ready().unwrap();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["state"], "valid");
        assert_eq!(value["actions"][0], "created");
        assert_eq!(value["launcher"]["console"], "ttyS0");
        assert!(toml::to_string(&report).is_ok());
    }
}
