pub mod engine_config;
pub mod profile_config;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::engine_config::EngineConfig;
use crate::config::profile_config::DeviceProfile;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub profile: DeviceProfile,
}

impl AppConfig {
    /// Loads the profile (required) and the engine config (optional, falls
    /// back to defaults).
    pub async fn load(profile: impl AsRef<Path>, engine: Option<&Path>) -> Result<Self> {
        let profile = DeviceProfile::load(profile).await?;
        let engine = match engine {
            Some(path) => EngineConfig::load_config(path).await?,
            None => EngineConfig::default(),
        };
        Ok(AppConfig { engine, profile })
    }
}
