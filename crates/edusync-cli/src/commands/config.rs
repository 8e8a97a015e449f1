//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use edusync_core::{Config, ConflictResolution};

use crate::output::{Output, OutputFormat};

fn load(config_path: Option<&PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config = load(config_path)?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_url": config.remote_url,
                    "sync": config.sync,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!(
                "  remote_url:          {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!("  auto_sync:           {}", config.sync.auto_sync);
            println!("  sync_interval_ms:    {}", config.sync.sync_interval_ms);
            println!(
                "  conflict_resolution: {}",
                config.sync.conflict_resolution
            );
            println!("  probe_interval_ms:   {}", config.sync.probe_interval_ms);
            println!("  request_timeout_ms:  {}", config.sync.request_timeout_ms);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config = load(config_path)?;
    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "remote_url" => {
            config.remote_url = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.to_string())
            };
        }
        "auto_sync" => {
            config.sync.auto_sync = value
                .parse()
                .context("Invalid value for auto_sync. Use 'true' or 'false'.")?;
        }
        "sync_interval_ms" => {
            config.sync.sync_interval_ms = parse_millis(key, value)?;
        }
        "probe_interval_ms" => {
            config.sync.probe_interval_ms = parse_millis(key, value)?;
        }
        "request_timeout_ms" => {
            config.sync.request_timeout_ms = parse_millis(key, value)?;
        }
        "conflict_resolution" => {
            config.sync.conflict_resolution = value.parse::<ConflictResolution>().map_err(|e| {
                anyhow::anyhow!("{}. Use 'latest', 'prefer-local' or 'prefer-remote'.", e)
            })?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, remote_url, auto_sync, sync_interval_ms, \
                 conflict_resolution, probe_interval_ms, request_timeout_ms",
                key
            );
        }
    }
    Ok(())
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    let ms: u64 = value
        .parse()
        .with_context(|| format!("Invalid value for {}. Use milliseconds.", key))?;
    if ms == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "remote_url", "ws://localhost:3030").unwrap();
        apply(&mut config, "auto_sync", "false").unwrap();
        apply(&mut config, "sync_interval_ms", "5000").unwrap();
        apply(&mut config, "conflict_resolution", "prefer-remote").unwrap();

        assert_eq!(config.remote_url.as_deref(), Some("ws://localhost:3030"));
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.sync_interval_ms, 5000);
        assert_eq!(
            config.sync.conflict_resolution,
            ConflictResolution::PreferRemote
        );

        apply(&mut config, "remote_url", "none").unwrap();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "colour", "blue").is_err());
        assert!(apply(&mut config, "auto_sync", "maybe").is_err());
        assert!(apply(&mut config, "sync_interval_ms", "0").is_err());
        assert!(apply(&mut config, "conflict_resolution", "coin-flip").is_err());
    }

    #[test]
    fn test_set_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set(
            "data_dir".to_string(),
            dir.path().join("data").display().to_string(),
            Some(&path),
            &output,
        )
        .unwrap();
        set(
            "remote_url".to_string(),
            "ws://school.example:3030".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("ws://school.example:3030"));
    }
}
