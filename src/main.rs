//! gatt-engine: drive a peripheral described by a JSON profile from the
//! command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use bluest::Adapter;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use gatt_operation_engine::config::AppConfig;
use gatt_operation_engine::core::bluetooth::{BluestTransport, BluetoothScanner, ConnectionManager};
use gatt_operation_engine::core::{
    Device, DeviceEvent, Operation, ReadOperation, RequestOperation, event_channel,
};
use gatt_operation_engine::logging;

#[derive(Parser)]
#[command(name = "gatt-engine", version, about = "Talk to a GATT peripheral through the operation engine")]
struct Cli {
    /// Device profile (services and characteristics) as JSON
    #[arg(short, long)]
    profile: PathBuf,

    /// Engine config as JSON; defaults are used when omitted or missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a characteristic once
    Read { characteristic: Uuid },

    /// Write a hex payload, optionally waiting for a response notification
    Write {
        characteristic: Uuid,
        payload: String,

        /// Characteristic the response is pushed on
        #[arg(short, long)]
        response: Option<Uuid>,
    },

    /// Print every notification until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    };
    logging::init(level, cli.json_logs);

    let config = AppConfig::load(&cli.profile, cli.config.as_deref()).await?;
    let descriptor = Arc::new(config.profile.to_descriptor()?);

    let adapter = Adapter::default()
        .await
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
    adapter.wait_available().await?;
    info!("Bluetooth adapter is available.");

    let mut scanner = BluetoothScanner::new(adapter.clone());
    let peripheral = scanner
        .find_by_name(&config.profile.name_filter, config.engine.scan_timeout())
        .await?;
    let peripheral_info = BluetoothScanner::describe(&peripheral).await;

    let (events_tx, events_rx) = event_channel();
    let transport = BluestTransport::new(peripheral.clone(), events_tx);
    let device = Device::spawn(
        peripheral_info.name,
        descriptor,
        transport,
        events_rx,
        config.engine.device_options(),
    );

    let connection = ConnectionManager::new(
        adapter,
        config.engine.connect_retries,
        config.engine.connect_retry_delay_ms,
    );
    connection.connect_with_retry(&peripheral, &device).await?;

    device.prepare()?;
    device.wait_ready().await.context("preparing the peripheral")?;

    let outcome = run(&cli.command, &device, &config).await;

    connection.disconnect(&peripheral, &device).await?;
    device.shutdown();
    outcome
}

async fn run(command: &Commands, device: &Device, config: &AppConfig) -> Result<()> {
    let timeout = config.engine.response_timeout();
    match command {
        Commands::Read { characteristic } => {
            let op = device
                .execute_operation(ReadOperation::new("read", *characteristic).with_timeout(timeout))
                .await?;
            if let Some(e) = op.error() {
                bail!("read failed: {}", e);
            }
            println!("{}", hex::encode(op.value().unwrap_or_default()));
        }
        Commands::Write {
            characteristic,
            payload,
            response,
        } => {
            let payload = hex::decode(payload).context("payload must be hex")?;
            let request = match response {
                Some(from) => RequestOperation::new("write", *characteristic, payload, *from),
                None => RequestOperation::write_only("write", *characteristic, payload),
            };
            let op = device.execute_operation(request.with_timeout(timeout)).await?;
            if let Some(e) = op.error() {
                bail!("write failed: {}", e);
            }
            for response in op.responses() {
                println!("{}", hex::encode(response));
            }
        }
        Commands::Watch => {
            let mut events = device.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(DeviceEvent::CharacteristicUpdated { characteristic, payload: Some(data), .. }) => {
                            println!("{} {}", characteristic, hex::encode(data));
                        }
                        Ok(DeviceEvent::Disconnected { error }) => {
                            warn!("Peripheral disconnected: {:?}", error);
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}
