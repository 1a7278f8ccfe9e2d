// Configuration module for biosignal-recorder
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Allow environment variables to override config values. The result is
/// validated again since overrides bypass the YAML checks.
pub fn apply_env_overrides(config: &mut RecorderConfig) -> Result<()> {
    if let Ok(data_dir) = std::env::var("DATA_DIR") {
        config.storage.data_dir = data_dir.into();
    }

    if let Ok(minutes) = std::env::var("BUFFER_SIZE_MINUTES") {
        config.storage.buffer_size_minutes = minutes
            .parse()
            .with_context(|| format!("Invalid BUFFER_SIZE_MINUTES '{}'", minutes))?;
    }

    if let Ok(interval) = std::env::var("AUTO_SAVE_INTERVAL") {
        config.storage.auto_save_interval = interval
            .parse()
            .with_context(|| format!("Invalid AUTO_SAVE_INTERVAL '{}'", interval))?;
    }

    if let Ok(compression) = std::env::var("COMPRESSION") {
        config.storage.compression = compression
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("Invalid COMPRESSION")?;
    }

    if let Ok(level) = std::env::var("COMPRESSION_LEVEL") {
        config.storage.compression_level = level
            .parse()
            .with_context(|| format!("Invalid COMPRESSION_LEVEL '{}'", level))?;
    }

    if let Ok(chunk_size) = std::env::var("CHUNK_SIZE") {
        config.storage.chunk_size = chunk_size
            .parse()
            .with_context(|| format!("Invalid CHUNK_SIZE '{}'", chunk_size))?;
    }

    if let Ok(device_id) = std::env::var("DEVICE_ID") {
        config.device.device_id = device_id;
    }

    if let Ok(level) = std::env::var("LOG_LEVEL") {
        config.logging.level = level;
    }

    ConfigLoader::validate(config)
}
