//! Engine tunables with documented defaults.

use std::time::Duration;

/// Well-known UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5670;
/// Beacon and liveness check interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
/// Silence before a peer is considered evasive.
pub const DEFAULT_EVASIVE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Silence before a peer is considered expired.
pub const DEFAULT_EXPIRED_TIMEOUT: Duration = Duration::from_millis(10000);
/// Per-peer outbound queue depth (messages).
pub const DEFAULT_PEER_HWM: usize = 1000;

/// Settings the engine consults while running. Changed at runtime through
/// the engine's setters; never process-global.
#[derive(Debug, Clone)]
pub struct Config {
    pub evasive_timeout: Duration,
    pub expired_timeout: Duration,
    /// Whether the periodic tick broadcasts a beacon.
    pub beacons_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evasive_timeout: DEFAULT_EVASIVE_TIMEOUT,
            expired_timeout: DEFAULT_EXPIRED_TIMEOUT,
            beacons_enabled: true,
        }
    }
}
