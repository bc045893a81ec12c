use log::{debug, info};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::core::Step;
use super::error::{DiskError, Result};
use super::host::Host;
use super::DiskContext;

/// Removable media boot directory on the ESP.
pub const EFI_BOOT_DIR: &str = "EFI/BOOT";

/// Default boot file name for the target architecture.
#[cfg(target_arch = "aarch64")]
pub const BOOT_FILE: &str = "BOOTAA64.EFI";
#[cfg(not(target_arch = "aarch64"))]
pub const BOOT_FILE: &str = "BOOTX64.EFI";

/// Bootloader configuration file name.
pub const CONFIG_FILE: &str = "syslinux.cfg";

/// Kernel location on the ESP.
pub const KERNEL_PATH: &str = "boot/vmlinuz";

/// Payload archive location on the ESP.
pub const PAYLOAD_PATH: &str = "boot/initramfs.img";

/// Files which must be present on the ESP of a valid image.
pub fn required_artifacts() -> [PathBuf; 3] {
    [
        Path::new(EFI_BOOT_DIR).join(BOOT_FILE),
        PathBuf::from(KERNEL_PATH),
        PathBuf::from(PAYLOAD_PATH),
    ]
}

/// Kernel command line.
pub fn kernel_cmdline(console: &str, root_device: &str) -> String {
    format!("console={} root={} rootfstype=ext4 rw", console, root_device)
}

/// Render bootloader configuration.
pub fn render_config(cmdline: &str) -> String {
    format!(
        r#"DEFAULT linux
PROMPT 0
TIMEOUT 0

LABEL linux
    LINUX /{}
    INITRD /{}
    APPEND {}
"#,
        KERNEL_PATH, PAYLOAD_PATH, cmdline,
    )
}

/// Copy `source` into `esp` at relative path `target`, creating parent directories.
///
/// Source must be a non-empty regular file.
fn install_file(source: &Path, esp: &Path, target: &Path) -> Result<u64> {
    let metadata = fs::metadata(source).map_err(DiskError::io("read", source))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(DiskError::Config(format!(
            "{} is not a non-empty regular file",
            source.display()
        )));
    }
    let destination = esp.join(target);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(DiskError::io("create directory", parent))?;
    }
    let bytes = fs::copy(source, &destination).map_err(DiskError::io("copy", source))?;
    debug!(
        "installed {} -> {} ({} bytes)",
        source.display(),
        target.display(),
        bytes
    );
    Ok(bytes)
}

/// UEFI bootloader installed at the removable media path.
#[derive(Clone, Debug)]
pub struct Bootloader {
    directory: PathBuf,
}

impl Default for Bootloader {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(EFI_BOOT_DIR),
        }
    }
}

impl Bootloader {
    /// Installation directory relative to the ESP root.
    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }

    /// Install bootloader binary and its support modules.
    pub fn install<P: AsRef<Path>>(esp: &Path, binary: &Path, modules: &[P]) -> Result<Self> {
        let bootloader = Self::default();
        install_file(binary, esp, &bootloader.directory().join(BOOT_FILE))?;
        for module in modules {
            let module = module.as_ref();
            let name = module.file_name().ok_or_else(|| {
                DiskError::Config(format!("bad bootloader module path: {}", module.display()))
            })?;
            install_file(module, esp, &bootloader.directory().join(name))?;
        }
        Ok(bootloader)
    }

    /// Install bootloader config file.
    pub fn install_config(&self, esp: &Path, cfg: &str) -> Result<()> {
        let cfg_path = esp.join(self.directory()).join(CONFIG_FILE);
        let mut file =
            fs::File::create(&cfg_path).map_err(DiskError::io("create", &cfg_path))?;
        file.write_all(cfg.as_bytes())
            .map_err(DiskError::io("write", &cfg_path))?;
        Ok(())
    }
}

/// Install bootloader to the ESP.
pub struct InstallBootloader;

impl<H: Host> Step<DiskContext<'_, H>> for InstallBootloader {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        info!("installing bootloader");
        let esp = ctx.esp_mountpoint("install bootloader")?;
        Bootloader::install(
            esp,
            &ctx.config.bootloader,
            ctx.config.bootloader_modules.as_slice(),
        )?;
        Ok(())
    }
}

/// Install kernel and payload archive to the ESP.
pub struct InstallBootArtifacts;

impl<H: Host> Step<DiskContext<'_, H>> for InstallBootArtifacts {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        info!("installing kernel and payload archive");
        let esp = ctx.esp_mountpoint("install boot artifacts")?;
        install_file(&ctx.config.kernel, esp, Path::new(KERNEL_PATH))?;
        install_file(&ctx.config.payload, esp, Path::new(PAYLOAD_PATH))?;
        Ok(())
    }
}

/// Write bootloader configuration entry.
pub struct InstallBootloaderCfg;

impl<H: Host> Step<DiskContext<'_, H>> for InstallBootloaderCfg {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        info!("installing bootloader config");
        let esp = ctx.esp_mountpoint("install bootloader config")?;
        let cmdline = kernel_cmdline(&ctx.config.console, &ctx.config.root_device);
        Bootloader::default().install_config(esp, &render_config(&cmdline))?;
        debug!("kernel command line: {}", cmdline);
        Ok(())
    }
}

/// Ensure the ESP holds everything needed to boot.
pub struct VerifyBootArtifacts;

impl<H: Host> Step<DiskContext<'_, H>> for VerifyBootArtifacts {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let esp = ctx
            .esp_mount
            .as_ref()
            .ok_or(DiskError::invalid_context("verify boot artifacts", "ESP mount"))?;
        for artifact in required_artifacts() {
            if !esp.path().join(&artifact).is_file() {
                return Err(DiskError::MissingArtifact {
                    artifact,
                    resource: esp.device().to_path_buf(),
                });
            }
            debug!("found {}", artifact.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{install_file, kernel_cmdline, render_config, required_artifacts, Bootloader};
    use std::fs;
    use std::path::Path;
    use tempdir::TempDir;

    #[test]
    fn test_render_config() {
        let cfg = render_config(&kernel_cmdline("ttyS0", "/dev/vda2"));
        assert!(cfg.starts_with("DEFAULT linux\n"));
        assert!(cfg.contains("    LINUX /boot/vmlinuz\n"));
        assert!(cfg.contains("    INITRD /boot/initramfs.img\n"));
        assert!(cfg.contains("    APPEND console=ttyS0 root=/dev/vda2 rootfstype=ext4 rw\n"));
    }

    #[test]
    fn test_install() {
        let host = TempDir::new("bootloader-tests").unwrap();
        let esp = TempDir::new("bootloader-tests").unwrap();
        let binary = host.path().join("syslinux.efi");
        let module = host.path().join("ldlinux.e64");
        fs::write(&binary, b"efi").unwrap();
        fs::write(&module, b"module").unwrap();

        let bootloader = Bootloader::install(esp.path(), &binary, &[&module]).unwrap();
        bootloader
            .install_config(esp.path(), &render_config("console=ttyS0"))
            .unwrap();

        let dir = esp.path().join(bootloader.directory());
        assert_eq!(fs::read(dir.join(super::BOOT_FILE)).unwrap(), b"efi");
        assert_eq!(fs::read(dir.join("ldlinux.e64")).unwrap(), b"module");
        assert!(dir.join("syslinux.cfg").is_file());
        assert!(esp.path().join(&required_artifacts()[0]).is_file());
    }

    #[test]
    fn test_install_rejects_empty_source() {
        let host = TempDir::new("bootloader-tests").unwrap();
        let esp = TempDir::new("bootloader-tests").unwrap();
        let kernel = host.path().join("bzImage");
        fs::write(&kernel, b"").unwrap();

        assert!(install_file(&kernel, esp.path(), Path::new("boot/vmlinuz")).is_err());
        assert!(install_file(
            &host.path().join("missing"),
            esp.path(),
            Path::new("boot/vmlinuz")
        )
        .is_err());
        assert!(!esp.path().join("boot/vmlinuz").exists());
    }
}
