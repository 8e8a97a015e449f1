//! Status command handler

use anyhow::Result;

use edusync_core::{Config, SyncEngine};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(engine: &SyncEngine, config: &Config, output: &Output) -> Result<()> {
    let status = engine.status();
    let collections = engine
        .manager()?
        .store()
        .collections()
        .into_iter()
        .map(|name| {
            let count = engine
                .collection::<serde_json::Value>(&name)
                .and_then(|c| c.count())
                .unwrap_or(0);
            (name, count)
        })
        .collect::<Vec<_>>();

    match output.format {
        OutputFormat::Json => {
            let counts: serde_json::Map<String, serde_json::Value> = collections
                .iter()
                .map(|(name, count)| (name.clone(), (*count).into()))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "status": status,
                    "remote_url": config.remote_url,
                    "database": config.sqlite_path(),
                    "counts": counts
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", status.pending);
        }
        OutputFormat::Human => {
            println!("EduSync Status");
            println!("==============");
            println!();
            println!("Sync:");
            println!("  State:   {}", status.state);
            println!(
                "  Network: {}",
                if status.online { "online" } else { "offline" }
            );
            println!(
                "  Remote:  {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!("  Pending: {}", status.pending);
            if let Some(at) = status.last_sync_at {
                println!("  Last:    {}", at.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(ref error) = status.last_error {
                println!("  Error:   {}", error);
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.sqlite_path().display());
            println!();
            println!("Contents:");
            for (name, count) in &collections {
                println!("  {:<14} {}", format!("{}:", name), count);
            }
        }
    }

    Ok(())
}
