//! Configuration (`spec.md §6`).
//!
//! Loaded from a TOML file the way `ob-poc`'s test fixtures and `xtask`
//! load TOML, with environment-variable overrides read the way
//! `sem_os_server::main` reads `SEM_OS_DATABASE_URL` et al.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityScale {
    pub size: f64,
    pub dimensions: f64,
    pub specific_board: f64,
}

impl Default for PriorityScale {
    fn default() -> Self {
        Self {
            size: 1.0,
            dimensions: 1.5,
            specific_board: 65.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub period_secs: u64,
    pub importance_span: f64,
    pub priority_scale: PriorityScale,
    pub report_action_threshold: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            period_secs: 5,
            importance_span: 10_000.0,
            priority_scale: PriorityScale::default(),
            report_action_threshold: 3,
        }
    }
}

impl AllocatorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub min_secs: u64,
    pub max_secs: u64,
    pub expiry_period_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            min_secs: 30,
            max_secs: 600,
            expiry_period_secs: 30,
        }
    }
}

impl KeepaliveConfig {
    pub fn expiry_period(&self) -> Duration {
        Duration::from_secs(self.expiry_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransceiverConfig {
    pub period_secs: u64,
    pub probe_interval_secs: u64,
    pub power_attempts: u32,
    pub fpga_attempts: u32,
    pub build_attempts: u32,
    pub off_wait_secs: u64,
    pub dummy: bool,
    pub fpga_reload: bool,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            period_secs: 10,
            probe_interval_secs: 1,
            power_attempts: 2,
            fpga_attempts: 3,
            build_attempts: 5,
            off_wait_secs: 30,
            dummy: false,
            fpga_reload: true,
        }
    }
}

impl TransceiverConfig {
    pub fn off_wait(&self) -> Duration {
        Duration::from_secs(self.off_wait_secs)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub default_quota_secs: i64,
    pub default_org_quota_secs: i64,
    pub default_collab_quota_secs: i64,
    /// Cron-like expression for `consolidate()`; see `triad-alloc::scheduler`.
    pub consolidation_schedule: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_secs: 100_000,
            default_org_quota_secs: 1_000_000,
            default_collab_quota_secs: 1_000_000,
            consolidation_schedule: "0 */15 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalDataConfig {
    pub grace_period_secs: u64,
    pub schedule: String,
}

impl Default for HistoricalDataConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 24 * 3600,
            schedule: "0 0 3 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub timeout_secs: u64,
    pub lock_tries: u32,
    pub lock_failed_delay_millis: u64,
    pub lock_note_threshold: u32,
    pub lock_warn_threshold: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            lock_tries: 5,
            lock_failed_delay_millis: 100,
            lock_note_threshold: 2,
            lock_warn_threshold: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub allocator: AllocatorConfig,
    pub keepalive: KeepaliveConfig,
    pub transceiver: TransceiverConfig,
    pub quota: QuotaConfig,
    pub historical_data: HistoricalDataConfig,
    pub sqlite: SqliteConfig,
    pub database_url: String,
}

impl Config {
    /// Parse from a TOML string, as `ob-poc`'s test fixtures do.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from `TRIAD_CONFIG_PATH` if set, else fall back to defaults —
    /// mirrors `sem_os_server::main`'s env-var-with-default pattern.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("TRIAD_CONFIG_PATH") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)?;
                Self::from_toml(&text)?
            }
            Err(_) => Self::default(),
        };
        if let Ok(url) = std::env::var("TRIAD_DATABASE_URL") {
            cfg.database_url = url;
        }
        if cfg.database_url.is_empty() {
            cfg.database_url = "sqlite::memory:".to_string();
        }
        Ok(cfg)
    }
}
