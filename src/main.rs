use anyhow::{bail, Context as _};
use clap::{CommandFactory as _, Parser as _, ValueHint};
use clap_complete::Shell;
use log::{debug, warn, LevelFilter};
use patharg::OutputArg;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

mod config;
mod disk;
mod utils;
mod version;

use config::{Config, ConfigOverrides};
use disk::filesystem::fat32::Fat32;
use disk::host::NativeHost;
use disk::{gpt, DiskManager, ImageState};
use utils::*;
use version::get_long_version;

/// Bootable VM disk image lifecycle manager.
#[derive(Clone, Debug, clap::Parser)]
#[command(version, long_version = get_long_version(), about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Sets the output format.
    #[arg(
        global = true,
        short = 'F',
        long,
        default_value_t,
        env = "VMDISK_FORMAT"
    )]
    format: OutputFormat,

    /// Config file.
    ///
    /// Defaults to '$HOME/.config/vmdisk/config.toml' on Linux if it exists.
    #[arg(
        global = true,
        short,
        long,
        env = "VMDISK_CONFIG",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(global = true, short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print errors only.
    #[arg(global = true, short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

impl Cli {
    /// Match the command and run it.
    pub fn run(&self) -> anyhow::Result<()> {
        match &self.command {
            Command::Ensure => {
                let config = self.load_config()?;
                let host = NativeHost::new()?;
                let report = DiskManager::new(&host, &config)
                    .ensure_ready()
                    .with_context(|| format!("failed to prepare {}", config.image.display()))?;
                print_object(self.format, &report)
            }
            Command::Create => {
                let config = self.load_config()?;
                let host = NativeHost::new()?;
                let report = DiskManager::new(&host, &config)
                    .create()
                    .with_context(|| format!("failed to create {}", config.image.display()))?;
                print_object(self.format, &report)
            }
            Command::Validate => {
                let config = self.load_config()?;
                let host = NativeHost::new()?;
                let report = DiskManager::new(&host, &config)
                    .validate()
                    .with_context(|| format!("failed to validate {}", config.image.display()))?;
                print_object(self.format, &report)?;
                if report.state != ImageState::Valid {
                    bail!("disk image {} is {}", config.image.display(), report.state);
                }
                Ok(())
            }
            Command::Info => {
                let config = self.load_config()?;
                image_info(&config.image, self.format)
            }
            Command::GenerateCompletion { shell, file } => {
                generate_completion(*shell, file.path_ref())
            }
        }
    }

    /// Load config file and apply command line overrides.
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config =
            Config::load(self.config.as_deref()).context("failed to load configuration")?;
        self.overrides.apply(&mut config);
        config.validate()?;
        debug!("configuration: {:?}", &config);
        Ok(config)
    }
}

/// Main commands of the CLI application.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Make sure the disk image is ready to boot.
    ///
    /// Absent image is created, broken image is recreated,
    /// image with almost full root filesystem is grown.
    Ensure,

    /// Create fresh disk image, replacing existing one.
    Create,

    /// Check disk image without changing it.
    Validate,

    /// Print partition table of disk image and files on its ESP.
    ///
    /// Image is read directly, no loop device is used.
    Info,

    /// Generate shell completion scripts.
    GenerateCompletion {
        /// The shell to generate the completion scripts for.
        shell: clap_complete::Shell,

        /// The file to write the completion scripts to or '-' to write to stdout.
        #[arg(short, long, default_value_t)]
        file: OutputArg,
    },
}

/// Initialize logger. `RUST_LOG` takes precedence over command line flags.
fn init_logger(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Main entry point for the CLI application.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.quiet);
    cli.run()
}

/// Prints partition layout and ESP content of the image.
fn image_info(image: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let layout = gpt::read_layout(image)
        .with_context(|| format!("failed to read partition table of {}", image.display()))?;
    debug!("partition table:\n{}", layout.pretty_print());

    let esp_files = match Fat32::read_from(image, layout.esp.start(), layout.esp.end())
        .and_then(|fat| fat.files())
    {
        Ok(files) => files,
        Err(err) => {
            warn!("cannot read ESP: {}", err);
            Vec::new()
        }
    };

    let output = serde_json::json!({
        "image": image,
        "layout": layout,
        "esp_files": esp_files,
    });
    print_object(format, &output)
}

/// Generates shell completion scripts for the vmdisk command-line tool.
fn generate_completion(shell: Shell, path: Option<&PathBuf>) -> anyhow::Result<()> {
    eprintln!("Generating completion file for {shell}...");
    let mut cmd = Cli::command();
    if let Some(file) = path {
        let mut file = File::create(file)
            .with_context(|| format!("failed to create {}", file.display()))?;
        clap_complete::generate(shell, &mut cmd, "vmdisk", &mut file);
    } else {
        clap_complete::generate(shell, &mut cmd, "vmdisk", &mut io::stdout());
    }
    Ok(())
}
