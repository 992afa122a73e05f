//! Configuration types and loading.
//!
//! Configuration is a closed record: every key is an enumerated field with
//! an explicit default, and unknown keys are rejected by the loader rather
//! than passed through to the core.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::GRID_MS;
use crate::domain::DriveSpec;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Per-install stable identifier; seeds all deterministic planning.
    #[serde(rename = "install-id")]
    pub install_id: Uuid,

    /// Cadence, jitter, and HDD guard settings.
    pub scheduling: SchedulingConfig,

    /// Probe I/O settings.
    pub io: IoConfig,

    /// Policy precedence and quarantine settings.
    pub policy: PolicyConfig,

    /// Managed drives keyed by letter.
    pub drives: BTreeMap<String, DriveSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_id: Uuid::new_v4(),
            scheduling: SchedulingConfig::default(),
            io: IoConfig::default(),
            policy: PolicyConfig::default(),
            drives: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// `./drive-revenant.yml`, then the user config directory, then
    /// defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("drive-revenant.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("drive-revenant").join("config.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config from {}: {}",
                            user_config.display(),
                            e
                        );
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Cadence, jitter, and HDD guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulingConfig {
    /// Cadence assigned to newly discovered drives.
    #[serde(rename = "default-interval-sec")]
    pub default_interval_sec: u32,

    /// Floor for any configured cadence.
    #[serde(rename = "interval-min-sec")]
    pub interval_min_sec: u32,

    /// Half-width of the deterministic jitter window.
    #[serde(rename = "jitter-sec")]
    pub jitter_sec: u32,

    /// Hard ceiling on the gap between consecutive HDD probes.
    #[serde(rename = "hdd-max-gap-sec")]
    pub hdd_max_gap_sec: f64,

    /// Late slack allowed for HDD firings.
    #[serde(rename = "deadline-margin-sec")]
    pub deadline_margin_sec: f64,

    /// Treat drives of unknown type as SSDs for op selection.
    #[serde(rename = "treat-unknown-as-ssd")]
    pub treat_unknown_as_ssd: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_interval_sec: 20,
            interval_min_sec: 3,
            jitter_sec: 2,
            hdd_max_gap_sec: 45.0,
            deadline_margin_sec: 0.3,
            treat_unknown_as_ssd: true,
        }
    }
}

impl SchedulingConfig {
    pub fn interval_min_ms(&self) -> u64 {
        u64::from(self.interval_min_sec) * 1000
    }

    /// Jitter window in ms, snapped down to whole grid cells.
    pub fn jitter_ms(&self) -> u64 {
        let ms = u64::from(self.jitter_sec) * 1000;
        ms - ms % GRID_MS
    }

    pub fn hdd_max_gap_ms(&self) -> u64 {
        (self.hdd_max_gap_sec * 1000.0) as u64
    }

    pub fn deadline_margin_ms(&self) -> u64 {
        (self.deadline_margin_sec * 1000.0) as u64
    }
}

/// Probe I/O settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    /// Attempt a durability flush on write probes.
    pub fsync: bool,

    /// Deadline for the durability flush before the probe is marked
    /// PARTIAL_FLUSH and proceeds.
    #[serde(rename = "max-flush-ms")]
    pub max_flush_ms: u64,

    /// Delay before the single retry after a sharing-violation error.
    #[serde(rename = "lock-retry-ms")]
    pub lock_retry_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            fsync: true,
            max_flush_ms: 150,
            lock_retry_ms: 750,
        }
    }
}

/// One rule in the policy precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyRule {
    GlobalPause,
    Battery,
    Idle,
    PerDriveDisable,
}

/// Policy precedence and quarantine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Evaluation order for pause rules. User pause always wins and is not
    /// part of this list.
    pub precedence: Vec<PolicyRule>,

    #[serde(rename = "pause-on-battery")]
    pub pause_on_battery: bool,

    /// Idle minutes before probing pauses; 0 disables the rule.
    #[serde(rename = "idle-pause-min")]
    pub idle_pause_min: u32,

    /// Consecutive failures before a drive is quarantined.
    #[serde(rename = "error-quarantine-after")]
    pub error_quarantine_after: u32,

    /// Quarantine blackout duration.
    #[serde(rename = "error-quarantine-sec")]
    pub error_quarantine_sec: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            precedence: vec![
                PolicyRule::GlobalPause,
                PolicyRule::Battery,
                PolicyRule::Idle,
                PolicyRule::PerDriveDisable,
            ],
            pause_on_battery: false,
            idle_pause_min: 0,
            error_quarantine_after: 5,
            error_quarantine_sec: 60,
        }
    }
}

impl PolicyConfig {
    pub fn quarantine_ms(&self) -> u64 {
        u64::from(self.error_quarantine_sec) * 1000
    }
}
