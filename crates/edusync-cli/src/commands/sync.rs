//! Sync command handler

use anyhow::{bail, Result};

use edusync_core::{Config, SyncEngine, SyncError};

use crate::output::Output;

/// Sync with the remote store
pub async fn sync(engine: &SyncEngine, config: &Config, output: &Output) -> Result<()> {
    let Some(ref remote_url) = config.remote_url else {
        bail!(
            "Remote store not configured. Set it with:\n  \
             edusync config set remote_url ws://your-server:3030"
        );
    };

    output.message(&format!("Syncing with {}...", remote_url));

    match engine.sync_now().await {
        Ok(report) => {
            if report.is_clean() {
                output.success("Sync complete");
            } else {
                output.message("Sync finished with errors; failed records will be retried");
            }
            output.print_report(&report);
            Ok(())
        }
        Err(SyncError::Offline) => {
            bail!("Remote store {} is unreachable; changes stay pending", remote_url)
        }
        Err(e) => {
            output.message(&format!("Sync failed: {}", e));
            Err(e.into())
        }
    }
}
