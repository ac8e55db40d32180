use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use drivefs::config::{AccountPaths, SyncSettings};
use drivefs::prelude::*;
use drivefs::MountConfig;

const LOG_FILE: &str = "drivefs.log";

/// Mounts a Google Drive account as a local filesystem.
#[derive(Parser, Debug)]
#[command(name = "drivefs")]
struct Args {
    /// Directory holding one subdirectory per account
    #[arg(long)]
    base_dir: PathBuf,

    /// Where cached file contents go (default: <base_dir>/<account>/cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory to mount the drive on
    #[arg(long)]
    mount_point: PathBuf,

    /// Account name, used as the subdirectory of the base dir
    #[arg(long, default_value = "default")]
    account: String,

    /// Write logs to <log_dir>/drivefs.log instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Installed-app OAuth client secret downloaded from the Google console
    #[arg(long, default_value = "auth/client_secret.json")]
    client_secret: PathBuf,

    /// Longest wait between two polls of the change feed, in seconds
    #[arg(long, default_value_t = 60)]
    poll_interval: u64,

    /// How long the kernel may cache attributes, in seconds
    #[arg(long, default_value_t = 2)]
    ttl: u64,

    /// Authorization code for the first login
    #[arg(long)]
    auth_code: Option<String>,

    /// Gitignore-style file of remote paths to leave out
    #[arg(long)]
    ignore_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_dir.as_ref())?;

    let settings = SyncSettings::new(
        Duration::from_secs(args.ttl),
        Duration::from_secs(args.poll_interval),
    )
    .with_ignore_file(args.ignore_file);
    let config = MountConfig {
        paths: AccountPaths::new(&args.base_dir, &args.account, args.cache_dir),
        mount_point: args.mount_point,
        client_secret: args.client_secret,
        auth_code: args.auth_code,
        settings,
    };
    tracing::info!("starting with {}", config.settings);
    drivefs::run(config).await
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .with_target(true);
    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("could not open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    tracing::info!("tracing initialized");
    Ok(())
}
