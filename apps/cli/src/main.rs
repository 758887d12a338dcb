//! homestore CLI - command line front end for the storage core.
//!
//! Every command prints its JSON response to stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use homestore_core::api::Storage;
use homestore_core::config::StorageConfig;
use homestore_core::disk::parse_size;
use homestore_core::executor::PrivilegeEscalation;
use homestore_core::fstab::PersistMode;
use homestore_core::mount::MountRequest;
use homestore_core::preset::MountOptions;
use homestore_core::setup::{AutoSetupConfig, SelectionCriteria};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Home server storage tool.
#[derive(Parser)]
#[command(name = "homestore")]
#[command(about = "Discover, mount and monitor removable drives", long_about = None)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run privileged commands through sudo.
    #[arg(long, global = true)]
    sudo: bool,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List removable disks and partitions.
    Devices,

    /// Mount one device.
    Mount {
        /// Device path, e.g. /dev/sdb1.
        device: PathBuf,

        /// Mount here instead of under the auto-mount root.
        #[arg(long)]
        mount_point: Option<PathBuf>,

        #[arg(long)]
        read_only: bool,

        #[arg(long)]
        no_exec: bool,

        /// Skip the long ext journal commit interval.
        #[arg(long)]
        no_media_optimize: bool,

        /// Extra mount option, appended verbatim. Repeatable.
        #[arg(long = "option")]
        options: Vec<String>,

        /// Add an fstab entry.
        #[arg(long)]
        persistent: bool,

        /// With --persistent, skip if the source already has an entry.
        #[arg(long, requires = "persistent")]
        if_absent: bool,

        /// Mount even if the device looks like a system disk.
        #[arg(long)]
        force: bool,
    },

    /// Unmount a mount point. fstab is left untouched.
    Unmount { mount_point: PathBuf },

    /// Mount every matching device.
    AutoSetup {
        /// Explicit device to mount. Repeatable; overrides the filters.
        #[arg(long = "device")]
        devices: Vec<PathBuf>,

        /// Minimum size, e.g. 32G.
        #[arg(long)]
        min_size: Option<String>,

        /// Maximum size, e.g. 4T.
        #[arg(long)]
        max_size: Option<String>,

        /// Allowed filesystem type. Repeatable.
        #[arg(long = "fs")]
        filesystems: Vec<String>,

        /// Case-insensitive label pattern (glob or substring).
        #[arg(long)]
        label: Option<String>,

        /// Add fstab entries for mounted devices.
        #[arg(long)]
        persistent: bool,

        /// Link mounted devices into the links directory.
        #[arg(long)]
        links: bool,
    },

    /// Show SMART health for one drive, or all drives.
    Health {
        device: Option<PathBuf>,

        /// Query through the SAT transport (USB bridges).
        #[arg(long)]
        sat: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_response<T: Serialize>(response: &T, success: bool) -> ExitCode {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: failed to encode response: {}", e);
            return ExitCode::FAILURE;
        }
    }
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn parse_size_arg(value: Option<&str>) -> Option<u64> {
    value.map(parse_size).filter(|size| *size > 0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match StorageConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if cli.sudo {
        config = config.with_escalation(PrivilegeEscalation::Sudo);
    }
    let storage = Storage::from_config(config);

    match cli.command {
        Commands::Devices => {
            let response = storage.list_devices();
            print_response(&response, response.success)
        }
        Commands::Mount {
            device,
            mount_point,
            read_only,
            no_exec,
            no_media_optimize,
            options,
            persistent,
            if_absent,
            force,
        } => {
            let mut mount_options = MountOptions {
                read_only,
                no_exec,
                optimize_for_media: !no_media_optimize,
                extra_options: Vec::new(),
            };
            for option in options {
                mount_options = mount_options.with_extra(option);
            }

            let mut request = MountRequest::new(device).with_options(mount_options);
            if let Some(mount_point) = mount_point {
                request = request.with_mount_point(mount_point);
            }
            if persistent {
                let mode = if if_absent {
                    PersistMode::IfAbsent
                } else {
                    PersistMode::Append
                };
                request = request.persistent(mode);
            }
            if force {
                request = request.force();
            }

            let response = storage.smart_mount(&request);
            print_response(&response, response.success && response.persist_error.is_none())
        }
        Commands::Unmount { mount_point } => {
            let response = storage.unmount(&mount_point);
            print_response(&response, response.success)
        }
        Commands::AutoSetup {
            devices,
            min_size,
            max_size,
            filesystems,
            label,
            persistent,
            links,
        } => {
            let criteria = SelectionCriteria {
                min_size_bytes: parse_size_arg(min_size.as_deref()),
                max_size_bytes: parse_size_arg(max_size.as_deref()),
                filesystems,
                label_pattern: label,
            };
            let setup = AutoSetupConfig {
                devices,
                criteria: Some(criteria),
                persistent,
                create_links: links,
                ..AutoSetupConfig::default()
            };

            let response = storage.auto_setup(&setup);
            print_response(&response, response.success)
        }
        Commands::Health { device, sat } => {
            let response = match device.as_deref() {
                Some(device) => storage.health(device, sat),
                None => storage.health_all(),
            };
            print_response(&response, response.success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mount_flags() {
        let cli = Cli::parse_from([
            "homestore",
            "--sudo",
            "mount",
            "/dev/sdb1",
            "--read-only",
            "--option",
            "nofail",
            "--persistent",
            "--if-absent",
        ]);
        assert!(cli.sudo);
        match cli.command {
            Commands::Mount {
                device,
                read_only,
                options,
                persistent,
                if_absent,
                ..
            } => {
                assert_eq!(device, Path::new("/dev/sdb1"));
                assert!(read_only);
                assert_eq!(options, vec!["nofail"]);
                assert!(persistent && if_absent);
            }
            _ => panic!("expected mount"),
        }
    }

    #[test]
    fn test_size_args() {
        assert_eq!(parse_size_arg(Some("32G")), Some(32 << 30));
        assert_eq!(parse_size_arg(Some("nonsense")), None);
        assert_eq!(parse_size_arg(None), None);
    }
}
