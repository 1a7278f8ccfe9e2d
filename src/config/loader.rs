// Configuration loader with environment variable substitution

use super::types::*;
use crate::registry::DType;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::parse(&content)
    }

    /// Parse YAML text, substituting environment variables first
    pub fn parse(content: &str) -> Result<RecorderConfig> {
        let content = Self::substitute_env_vars(content);

        let config: RecorderConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${DATA_DIR:-./data} -> ./data (if DATA_DIR not set)
    fn substitute_env_vars(content: &str) -> String {
        let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
            Ok(re) => re,
            Err(_) => return content.to_string(),
        };

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    // Keep original if no default and var not found
                    None => format!("${{{}}}", var_name),
                },
            }
        })
        .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &RecorderConfig) -> Result<()> {
        let storage = &config.storage;

        if storage.buffer_size_minutes.is_nan() || storage.buffer_size_minutes <= 0.0 {
            bail!("storage.buffer_size_minutes must be > 0");
        }

        if storage.auto_save_interval == 0 {
            bail!("storage.auto_save_interval must be > 0");
        }

        if storage.compression_level > 9 {
            bail!("storage.compression_level must be 0-9");
        }

        if storage.chunk_size == 0 {
            bail!("storage.chunk_size must be > 0");
        }

        match storage.backend.as_str() {
            "chunkfile" => {}
            unknown => bail!("Unknown backend: '{}'. Supported: chunkfile", unknown),
        }

        if config.ingestion.poll_interval_ms == 0 {
            bail!("ingestion.poll_interval_ms must be > 0");
        }

        if config.ingestion.auto_save_tick_ms == 0 {
            bail!("ingestion.auto_save_tick_ms must be > 0");
        }

        if config.device.device_id.is_empty() {
            bail!("device.device_id cannot be empty");
        }

        for channel in &config.channels {
            if channel.name.is_empty() {
                bail!("channels: name cannot be empty");
            }
            if channel.dtype.parse::<DType>().is_err() {
                bail!(
                    "channels.{}: unknown dtype '{}'",
                    channel.name,
                    channel.dtype
                );
            }
            if channel.chunk_size == Some(0) {
                bail!("channels.{}: chunk_size must be > 0", channel.name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("BSR_TEST_VAR", "/mnt/sessions");

        let input = "data_dir: ${BSR_TEST_VAR}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "data_dir: /mnt/sessions");

        std::env::remove_var("BSR_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("BSR_TEST_VAR2");

        let input = "device_id: ${BSR_TEST_VAR2:-headband-7}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "device_id: headband-7");
    }

    #[test]
    fn test_missing_var_is_kept() {
        std::env::remove_var("BSR_TEST_VAR3");
        let output = ConfigLoader::substitute_env_vars("x: ${BSR_TEST_VAR3}");
        assert_eq!(output, "x: ${BSR_TEST_VAR3}");
    }

    #[test]
    fn test_validation_invalid_buffer_size() {
        let mut config = RecorderConfig::default();
        config.storage.buffer_size_minutes = 0.0;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("buffer_size_minutes"));
    }

    #[test]
    fn test_validation_invalid_compression_level() {
        let mut config = RecorderConfig::default();
        config.storage.compression_level = 10;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("compression_level"));
    }

    #[test]
    fn test_validation_unknown_backend() {
        let mut config = RecorderConfig::default();
        config.storage.backend = "hdf5".to_string();

        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown backend"));
    }

    #[test]
    fn test_validation_channel_dtype() {
        let mut config = RecorderConfig::default();
        config.channels.push(ChannelConfig {
            name: "scores/stress".to_string(),
            shape: vec![],
            dtype: "complex64".to_string(),
            chunk_size: None,
        });

        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("scores/stress"));
    }

    #[test]
    fn test_parse_partial_document() {
        let config = ConfigLoader::parse("storage:\n  buffer_size_minutes: 0.5\n").unwrap();
        assert_eq!(config.storage.buffer_size_minutes, 0.5);
        assert_eq!(config.storage.auto_save_interval, 300);
        assert_eq!(config.ingestion.poll_interval_ms, 10);
    }
}
