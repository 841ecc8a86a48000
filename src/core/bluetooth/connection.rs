//! Bluetooth connection handling
//! Connects to and disconnects from a peripheral and reports the outcome to
//! the device facade through its connection hooks.

use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::Adapter;
use log::{info, warn};

use crate::core::device::Device;
use crate::core::error::TransportError;

/// Connection manager for a peripheral
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
    max_retries: u32,
    retry_delay: u64,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter, max_retries: u32, retry_delay: u64) -> Self {
        Self {
            adapter,
            max_retries,
            retry_delay,
        }
    }

    /// Connects with a retry mechanism, then calls `did_connect` or
    /// `did_fail_to_connect` on `device`.
    pub async fn connect_with_retry(&self, peripheral: &bluest::Device, device: &Device) -> Result<()> {
        let mut retry_count = 0;
        let mut last_error = None;

        while retry_count < self.max_retries {
            match self.try_connect(peripheral).await {
                Ok(()) => {
                    info!("[{}] Successfully connected to {}", device.label(), peripheral.id());
                    device.did_connect()?;
                    return Ok(());
                }
                Err(e) => {
                    warn!("[{}] Connection attempt {} failed: {}", device.label(), retry_count + 1, e);
                    last_error = Some(e);

                    if retry_count + 1 < self.max_retries {
                        info!("Retrying connection in {} ms...", self.retry_delay);
                        tokio::time::sleep(Duration::from_millis(self.retry_delay)).await;
                    }
                }
            }
            retry_count += 1;
        }

        device.did_fail_to_connect(last_error.clone())?;
        Err(last_error
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("Failed to connect after {} attempts", self.max_retries)))
    }

    async fn try_connect(&self, peripheral: &bluest::Device) -> Result<(), TransportError> {
        if !peripheral.is_connected().await {
            info!("Initiating connection to {}...", peripheral.id());
            self.adapter.connect_device(peripheral).await?;
        }
        Ok(())
    }

    /// Disconnects and calls `did_disconnect` on `device`.
    pub async fn disconnect(&self, peripheral: &bluest::Device, device: &Device) -> Result<()> {
        if peripheral.is_connected().await {
            info!("Disconnecting from device {}", peripheral.id());
            self.adapter.disconnect_device(peripheral).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", peripheral.id());
        }
        device.did_disconnect(None)?;
        Ok(())
    }
}
