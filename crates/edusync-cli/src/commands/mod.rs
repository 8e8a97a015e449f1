//! Command handlers

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use edusync_core::{
    Config, EngineConfig, MemoryRemote, RemoteAdapter, SyncEngine, SyncError, WsRemote,
};

pub mod config;
pub mod record;
pub mod serve;
pub mod status;
pub mod sync;

/// Open the local store, connecting to the remote store when one is configured
///
/// Each invocation is short-lived, so the timers are off and connectivity is
/// decided by a single ping up front. Without a remote the engine stays
/// offline and every change remains pending.
pub async fn open_engine(config: &Config) -> Result<SyncEngine> {
    let mut engine_config = EngineConfig::from_config(config);
    engine_config.sync.auto_sync = false;
    engine_config.probe_remote = false;

    let remote: Arc<dyn RemoteAdapter> = match &config.remote_url {
        Some(url) => {
            let remote = WsRemote::new(url, config.sync.request_timeout());
            engine_config.start_online = match remote.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Remote store unreachable, working offline: {}", e);
                    false
                }
            };
            Arc::new(remote)
        }
        None => {
            debug!("No remote configured; working offline");
            engine_config.start_online = false;
            Arc::new(MemoryRemote::new())
        }
    };

    let engine = SyncEngine::new(engine_config, remote);
    if let Err(e) = engine.init() {
        if let SyncError::Initialization(ref cause) = e {
            if let Some(hint) = cause.recovery_suggestion() {
                eprintln!("{}", hint);
            }
        }
        return Err(e).context("Failed to open local store");
    }
    Ok(engine)
}
