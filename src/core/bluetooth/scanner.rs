use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::MIN_RSSI_THRESHOLD;
use crate::core::bluetooth::types::PeripheralInfo;

pub struct BluetoothScanner {
    adapter: Adapter,
    cancel_token: CancellationToken,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Finds the first peripheral whose name contains `name_filter`.
    ///
    /// Already connected peripherals are checked before scanning. The scan
    /// gives up after `timeout` or when [`stop_scan`](Self::stop_scan) is
    /// called.
    pub async fn find_by_name(&mut self, name_filter: &str, timeout: Duration) -> Result<Device> {
        info!("Checking for connected devices");
        for device in self.adapter.connected_devices().await? {
            if Self::matches(&device, name_filter) {
                info!("Using connected device {}", Self::describe(&device).await.name);
                return Ok(device);
            }
        }
        info!("No connected device matches {:?}", name_filter);

        self.cancel_token = CancellationToken::new();
        let cancel_token = self.cancel_token.clone();

        info!("Starting bluetooth scan");
        let mut scan_stream = self.adapter.scan(&[]).await?;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(discovered) = result else {
                        return Err(anyhow!("Bluetooth scan stream has ended"));
                    };
                    let device = discovered.device;
                    debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered.rssi);
                    let strong_enough = discovered.rssi.is_none_or(|rssi| rssi >= MIN_RSSI_THRESHOLD);
                    if strong_enough && Self::matches(&device, name_filter) {
                        let info = Self::describe(&device).await;
                        info!("Found device: {:?}", info);
                        return Ok(device);
                    }
                }
                _ = &mut deadline => {
                    return Err(anyhow!("No device matching {:?} within {:?}", name_filter, timeout));
                }
                _ = cancel_token.cancelled() => {
                    return Err(anyhow!("Scan cancelled"));
                }
            }
        }
    }

    pub fn stop_scan(&self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();
    }

    pub async fn describe(device: &Device) -> PeripheralInfo {
        PeripheralInfo {
            id: device.id().to_string(),
            name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
            rssi: device.rssi().await.ok(),
            is_connected: device.is_connected().await,
        }
    }

    fn matches(device: &Device, name_filter: &str) -> bool {
        device
            .name()
            .ok()
            .is_some_and(|name| name.contains(name_filter))
    }
}
