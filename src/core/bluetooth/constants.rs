//! Constants used by the bluest backend.

/// Maximum number of connection retries
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// How long a scan looks for a peripheral, in seconds
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/// Advertisements weaker than this are ignored while scanning
pub const MIN_RSSI_THRESHOLD: i16 = -85;
