use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::descriptor::{
    CharacteristicDescriptor, EndpointDescriptor, ServiceDescriptor, WriteMode,
};

/// JSON description of a peripheral class.
///
/// ```json
/// {
///   "name_filter": "Thermo",
///   "services": [{
///     "uuid": "0000fff0-0000-1000-8000-00805f9b34fb",
///     "characteristics": [
///       { "uuid": "0000fff1-0000-1000-8000-00805f9b34fb", "write": "with_response" },
///       { "uuid": "0000fff2-0000-1000-8000-00805f9b34fb", "notify": true }
///     ]
///   }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Substring of the advertised name used to find the peripheral.
    #[serde(default)]
    pub name_filter: String,
    pub services: Vec<ServiceProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub uuid: Uuid,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProfile {
    pub uuid: Uuid,
    #[serde(default)]
    pub write: WriteMode,
    #[serde(default)]
    pub notify: bool,
}

impl DeviceProfile {
    /// Builds the descriptor table. Duplicate characteristic addresses are
    /// rejected.
    pub fn to_descriptor(&self) -> Result<EndpointDescriptor> {
        let services = self
            .services
            .iter()
            .map(|s| {
                ServiceDescriptor::new(
                    s.uuid,
                    s.characteristics
                        .iter()
                        .map(|c| CharacteristicDescriptor::new(c.uuid, c.write, c.notify))
                        .collect(),
                )
            })
            .collect();
        Ok(EndpointDescriptor::try_new(services)?)
    }

    /// Loads a profile. Unlike the engine config there is no default.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading profile {:?}", path))?;
        let profile: Self =
            serde_json::from_str(&json).with_context(|| format!("parsing profile {:?}", path))?;
        info!(
            "Profile loaded from {:?} ({} services)",
            path,
            profile.services.len()
        );
        Ok(profile)
    }
}
