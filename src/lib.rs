use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use fuser::{MountOption, Session, SessionUnmounter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use prelude::*;

use crate::cache::ContentCache;
use crate::config::{AccountPaths, CommonFileFilter, SyncSettings};
use crate::fs::DriveFilesystem;
use crate::google_drive::{Credentials, GoogleDrive, OAuthClient, RemoteDrive};
use crate::store::MetadataStore;
use crate::sync::{ShutdownFlag, SyncEngine};

mod macros;

pub mod async_helper;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod google_drive;
pub mod prelude;
pub mod store;
pub mod sync;


/// Everything needed to mount one account.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub paths: AccountPaths,
    pub mount_point: PathBuf,
    pub client_secret: PathBuf,
    /// Authorization code for the first login; read from stdin if missing and needed.
    pub auth_code: Option<String>,
    pub settings: SyncSettings,
}

/// Opens the account, starts the sync engine and serves the mount until it is
/// unmounted or the process gets ctrl-c.
pub async fn run(config: MountConfig) -> Result<()> {
    let account_dir = config.paths.account_dir();
    std::fs::create_dir_all(account_dir)
        .with_context(|| format!("could not create {}", account_dir.display()))?;
    let database = config.paths.database();
    let store = Arc::new(
        MetadataStore::open(&database)
            .with_context(|| format!("could not open metadata store {}", database.display()))?,
    );
    let cache = Arc::new(ContentCache::new(config.paths.cache_dir(), store.clone())?);

    let oauth = OAuthClient::from_secret_file(&config.client_secret).await?;
    let consent_url = oauth.consent_url()?;
    let credentials = Arc::new(Credentials::load(store.clone(), Arc::new(oauth))?);
    if !credentials.has_session().await {
        let code = match &config.auth_code {
            Some(code) => code.clone(),
            None => read_auth_code(&consent_url).await?,
        };
        credentials
            .login(&code)
            .await
            .context("could not log in with the authorization code")?;
        info!("logged in");
    }

    let remote: Arc<dyn RemoteDrive> = Arc::new(GoogleDrive::new(
        credentials.clone(),
        config.settings.page_size(),
    ));
    let filter = match config.settings.ignore_file() {
        Some(path) => CommonFileFilter::from_path(path)?,
        None => CommonFileFilter::empty(),
    };
    let shutdown = ShutdownFlag::default();
    let engine = SyncEngine::new(
        store.clone(),
        cache.clone(),
        remote.clone(),
        credentials,
        config.settings.clone(),
        filter,
        shutdown.clone(),
    )?;
    let engine_handle: JoinHandle<()> = tokio::spawn(engine.run());

    let fs = DriveFilesystem::new(store, cache, remote, config.settings, shutdown.clone());
    let options = [
        MountOption::FSName("drivefs".to_string()),
        MountOption::RW,
        MountOption::DefaultPermissions,
    ];
    debug!("mounting at {}", config.mount_point.display());
    let mut session = Session::new(fs, &config.mount_point, &options)
        .with_context(|| format!("could not mount {}", config.mount_point.display()))?;
    let unmounter = session.unmount_callable();
    let signal_handle = tokio::spawn(end_program_signal_awaiter(shutdown.clone(), unmounter));

    info!("serving {}", config.mount_point.display());
    let served = tokio::task::block_in_place(|| session.run());
    shutdown.trigger();
    signal_handle.abort();
    debug!("waiting for the sync engine");
    if let Err(e) = engine_handle.await {
        error!("sync engine task failed: {}", e);
    }
    served.map_err(|e| anyhow!("fuse session ended with an error: {}", e))?;
    info!("unmounted {}", config.mount_point.display());
    Ok(())
}

async fn read_auth_code(consent_url: &str) -> Result<String> {
    println!("Open this URL in a browser and paste the authorization code:\n{consent_url}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = lines
        .next_line()
        .await?
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("no authorization code given"))?;
    Ok(code)
}

async fn end_program_signal_awaiter(shutdown: ShutdownFlag, mut unmounter: SessionUnmounter) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not listen for ctrl-c: {}", e);
        return;
    }
    info!("got signal to end program");
    shutdown.trigger();
    info!("unmounting...");
    if let Err(e) = unmounter.unmount() {
        error!("could not unmount: {}", e);
    }
}
