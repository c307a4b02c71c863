use crate::networking::transport::TransportConfig;
use crate::networking::xfer::types::{LENGTH_PREFIX_LEN, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "lludp.toml";

// =============================================================================
// Network Configuration System
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkProfile {
    Lan,      // Low latency, aggressive timers
    Internet, // Default for grid connections
    Lossy,    // Long timers and generous retry budget
    Custom,   // User-defined values
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self::Internet
    }
}

/// Reliability and liveness tuning for one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub retransmit_timeout_ms: u64,
    /// backoff doubles at most this many times
    pub max_backoff_exponent: u32,
    pub max_retries: u32,
    pub failures_before_close: u32,
    pub dedup_window: usize,
    pub ack_flush_interval_ms: u64,
    pub max_acks_per_packet: usize,
    pub sweep_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub missed_pings_suspect: u32,
    pub missed_pings_close: u32,
    pub rtt_weight: f64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: 3000,
            max_backoff_exponent: 6,
            max_retries: 3,
            failures_before_close: 3,
            dedup_window: 256,
            ack_flush_interval_ms: 250,
            max_acks_per_packet: 255,
            sweep_interval_ms: 100,
            ping_interval_ms: 5000,
            ping_timeout_ms: 15000,
            missed_pings_suspect: 1,
            missed_pings_close: 3,
            rtt_weight: 0.125,
        }
    }
}

impl CircuitSettings {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn ack_flush_interval(&self) -> Duration {
        Duration::from_millis(self.ack_flush_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XferSettings {
    /// payload bytes per SendXferPacket
    pub chunk_size: usize,
    /// unconfirmed chunks allowed in flight
    pub window: usize,
    pub idle_timeout_ms: u64,
    pub expire_interval_ms: u64,
    /// how far past the first missing chunk a received index may land
    pub max_pending_chunks: u32,
}

impl Default for XferSettings {
    fn default() -> Self {
        Self { chunk_size: 1000, window: 1, idle_timeout_ms: 60_000, expire_interval_ms: 1000, max_pending_chunks: 1024 }
    }
}

impl XferSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn expire_interval(&self) -> Duration {
        Duration::from_millis(self.expire_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// filter used when RUST_LOG is unset
    pub level: String,
    pub log_file: Option<String>,
    pub with_thread_ids: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), log_file: None, with_thread_ids: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub profile: NetworkProfile,
    pub circuit: CircuitSettings,
    pub xfer: XferSettings,
    pub transport: TransportConfig,
    pub logging: LoggingSettings,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self::for_profile(NetworkProfile::default())
    }
}

impl NetworkSettings {
    pub fn for_profile(profile: NetworkProfile) -> Self {
        let circuit = match profile {
            NetworkProfile::Lan => CircuitSettings {
                retransmit_timeout_ms: 500,
                ack_flush_interval_ms: 50,
                ping_interval_ms: 2000,
                ping_timeout_ms: 6000,
                ..CircuitSettings::default()
            },
            NetworkProfile::Internet | NetworkProfile::Custom => CircuitSettings::default(),
            NetworkProfile::Lossy => CircuitSettings {
                retransmit_timeout_ms: 5000,
                max_retries: 5,
                failures_before_close: 5,
                ping_timeout_ms: 30000,
                missed_pings_suspect: 2,
                missed_pings_close: 5,
                ..CircuitSettings::default()
            },
        };

        Self {
            profile,
            circuit,
            xfer: XferSettings::default(),
            transport: TransportConfig::default(),
            logging: LoggingSettings::default(),
        }
    }

    /// Parse TOML. The file's `profile` picks the preset and every other key
    /// overrides it, so `profile = "Lan"` alone yields the LAN timers.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let overrides: toml::Table = toml::from_str(text)?;
        let profile: NetworkProfile = match overrides.get("profile") {
            Some(value) => value.clone().try_into()?,
            None => NetworkProfile::default(),
        };

        let mut merged: toml::Table = toml::from_str(&toml::to_string(&Self::for_profile(profile))?)?;
        merge_tables(&mut merged, overrides);
        let settings: Self = toml::Value::Table(merged).try_into()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the wire format or the timers cannot honour
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.xfer.chunk_size > LENGTH_PREFIX_LEN && self.xfer.chunk_size <= MAX_CHUNK_SIZE,
            "xfer.chunk_size must be between {} and {}, got {}",
            LENGTH_PREFIX_LEN + 1,
            MAX_CHUNK_SIZE,
            self.xfer.chunk_size
        );
        anyhow::ensure!(self.xfer.window >= 1, "xfer.window must be at least 1");
        anyhow::ensure!(self.xfer.max_pending_chunks >= 1, "xfer.max_pending_chunks must be at least 1");
        anyhow::ensure!(
            (1..=255).contains(&self.circuit.max_acks_per_packet),
            "circuit.max_acks_per_packet must be between 1 and 255, got {}",
            self.circuit.max_acks_per_packet
        );
        anyhow::ensure!(
            self.circuit.max_backoff_exponent < 32,
            "circuit.max_backoff_exponent must be below 32, got {}",
            self.circuit.max_backoff_exponent
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.circuit.rtt_weight),
            "circuit.rtt_weight must be between 0 and 1, got {}",
            self.circuit.rtt_weight
        );
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&data)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        if let toml::Value::Table(nested) = &value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, nested.clone());
                continue;
            }
        }
        base.insert(key, value);
    }
}

/// Load settings from `path`, falling back to defaults when the file is missing or invalid
pub fn load_network_settings(path: impl AsRef<Path>) -> NetworkSettings {
    match NetworkSettings::load(&path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::debug!("Using default network settings ({}): {}", path.as_ref().display(), e);
            NetworkSettings::default()
        }
    }
}
