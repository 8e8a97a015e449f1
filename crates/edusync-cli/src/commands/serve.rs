//! Serve command handler

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use edusync_core::remote::server;
use edusync_core::MemoryRemote;

use crate::output::Output;

/// Run an in-memory remote store until interrupted
///
/// Documents live only as long as the process. Point devices at it with
/// `edusync config set remote_url ws://<bind>`.
pub async fn run(bind: &str, output: &Output) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let addr = listener.local_addr()?;
    output.message(&format!("Remote store listening on ws://{} (Ctrl-C to stop)", addr));

    let store = MemoryRemote::new();
    tokio::select! {
        result = server::serve(listener, store) => {
            result.context("Remote store stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down remote store");
            output.message("Stopped.");
        }
    }

    Ok(())
}
