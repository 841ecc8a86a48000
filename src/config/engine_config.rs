use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{
    CONNECT_RETRY_DELAY_MS, DEFAULT_SCAN_TIMEOUT_SECS, MAX_CONNECT_RETRIES,
};
use crate::core::device::{DEFAULT_EVENT_CAPACITY, DeviceOptions};
use crate::core::operation::DEFAULT_RESPONSE_TIMEOUT;
use crate::utils::ensure_directory_exists;

/// Runtime knobs of the engine and the bluetooth backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Response timeout applied to operations started from the CLI.
    pub default_response_timeout_ms: u64,

    /// Capacity of each device's event broadcast channel. Slow subscribers
    /// lose the oldest events once it is full.
    pub event_capacity: usize,

    pub connect_retries: u32,

    pub connect_retry_delay_ms: u64,

    /// How long to scan for the peripheral before giving up.
    pub scan_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.default_response_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            event_capacity: self.event_capacity,
        }
    }

    /// Loads the config from `path`, falling back to the defaults when the
    /// file does not exist.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {:?}", path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {:?}", path))?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config to `path`, creating the parent directory if needed.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize engine config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;
        info!("Engine config saved to {:?}.", path);
        Ok(())
    }
}
