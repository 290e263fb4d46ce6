//! stackfs - stackable pass-through filesystem
//!
//! Usage:
//!   stackfs mount <lower_dir> <mount_point>  - Mount a pass-through view
//!   stackfs check <lower_dir>                - Verify a lower directory
//!   stackfs init <lower_dir>                 - Write a default config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fuser::MountOption;
use stackfs::fs::{MountSession, ShadowFs};
use stackfs::lower::{LocalFs, LowerFs};
use stackfs::MountConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "stackfs")]
#[command(author = "stackfs Contributors")]
#[command(version)]
#[command(about = "Stackable pass-through filesystem layer")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a pass-through view of a lower directory
    Mount {
        /// Lower directory to stack on (defaults to the configured one)
        lower_dir: Option<PathBuf>,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Verify that a lower directory is mountable and show its identity
    Check {
        /// Lower directory to inspect
        lower_dir: PathBuf,
    },

    /// Write a default configuration file
    Init {
        /// Lower directory to record in the config
        lower_dir: PathBuf,
    },
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stackfs")
        .join("config.json")
}

fn load_config(cli_path: &Option<PathBuf>, lower_dir: &Option<PathBuf>) -> Result<MountConfig> {
    let path = cli_path.clone().unwrap_or_else(default_config_path);
    let mut config = if path.exists() {
        MountConfig::load(&path).with_context(|| format!("loading config {}", path.display()))?
    } else if let Some(lower) = lower_dir {
        MountConfig::new(lower.clone())
    } else {
        anyhow::bail!(
            "no lower directory given and no config at {}",
            path.display()
        );
    };
    if let Some(lower) = lower_dir {
        config.lower_root = lower.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    match cli.command {
        Commands::Mount {
            lower_dir,
            mount_point,
            allow_other,
        } => {
            let config = load_config(&cli.config, &lower_dir)?;
            let lower = Arc::new(
                LocalFs::new(config.lower_root.clone()).with_context(|| {
                    format!("opening lower directory {}", config.lower_root.display())
                })?,
            );
            let session = Arc::new(
                MountSession::mount(lower, config).context("mounting shadow session")?,
            );

            let mut options = vec![
                MountOption::FSName("stackfs".to_string()),
                MountOption::DefaultPermissions,
            ];
            if allow_other {
                options.push(MountOption::AllowOther);
            }

            info!("mounting on {}", mount_point.display());
            fuser::mount2(ShadowFs::new(session), &mount_point, &options)
                .context("FUSE mount failed")?;
        }

        Commands::Check { lower_dir } => {
            let lower = Arc::new(LocalFs::new(lower_dir.clone()).with_context(|| {
                format!("opening lower directory {}", lower_dir.display())
            })?);
            let fsid = lower.fsid();
            let session = MountSession::mount(lower, MountConfig::new(lower_dir.clone()))
                .context("mounting shadow session")?;
            let root_attrs = session.getattr(&session.root().clone())?;
            println!("lower root:     {}", lower_dir.display());
            println!("lower fsid:     {:#x}", fsid);
            println!("root mode:      {:o}", root_attrs.mode);
            println!("root links:     {}", root_attrs.nlink);
            println!("max file size:  {} bytes", session.max_size_bytes());
            session.unmount();
        }

        Commands::Init { lower_dir } => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            let config = MountConfig::new(lower_dir);
            config
                .save(&path)
                .with_context(|| format!("writing config {}", path.display()))?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}
