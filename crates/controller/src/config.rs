//! TOML configuration for the controller: storage roots, history capacities,
//! transfer and streaming limits, aggregation cadence and the diagnostics
//! server. Every field has a default, so an empty file is a valid config.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pack::record::PLANT_RECORD_SIZE;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub history: HistoryConfig,
    pub transfer: TransferConfig,
    pub stream: StreamConfig,
    pub aggregation: AggregationConfig,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Report this partition size instead of probing the mounted disk.
    pub partition_bytes: Option<u64>,
    pub provision_on_boot: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/lfs"),
            partition_bytes: None,
            provision_on_boot: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackend {
    /// Rings in RAM, snapshotted into the small key-value store.
    Kv,
    /// One preallocated log file per granularity.
    FlashLog,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub backend: HistoryBackend,
    pub dir: PathBuf,
    pub hourly_capacity: u32,
    pub daily_capacity: u32,
    pub monthly_capacity: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Kv,
            dir: PathBuf::from("data/history"),
            hourly_capacity: 168,
            daily_capacity: 90,
            monthly_capacity: 36,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub staging_capacity: usize,
    pub timeout_secs: u64,
    pub max_plants_per_pack: u16,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 64 * PLANT_RECORD_SIZE,
            timeout_secs: 120,
            max_plants_per_pack: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub batch_size: u8,
    pub frame_gap_ms: u64,
    pub backoff_ms: Vec<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            frame_gap_ms: 2,
            backoff_ms: vec![10, 20, 40, 80, 160, 320],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub tick_secs: u64,
    /// Persist the history every this many ticks.
    pub save_every_ticks: u32,
    pub channels: u8,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            save_every_ticks: 10,
            channels: 8,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Largest staging buffer the transfer receiver will allocate.
pub const MAX_STAGING_BYTES: usize = 32 * 1024;

/// Plants per list frame that still fit a 244-byte notification.
pub const MAX_STREAM_BATCH: u8 = 10;

pub const MAX_CHANNELS: u8 = 16;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_storage(&mut errors);
        self.validate_history(&mut errors);
        self.validate_transfer(&mut errors);
        self.validate_stream(&mut errors);
        self.validate_aggregation(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_storage(&self, errors: &mut Vec<String>) {
        let s = &self.storage;
        if s.root.as_os_str().is_empty() {
            errors.push("storage.root is empty".into());
        }
        if s.partition_bytes == Some(0) {
            errors.push("storage.partition_bytes must be positive".into());
        }
    }

    fn validate_history(&self, errors: &mut Vec<String>) {
        let h = &self.history;
        if h.dir.as_os_str().is_empty() {
            errors.push("history.dir is empty".into());
        }
        for (name, cap) in [
            ("hourly_capacity", h.hourly_capacity),
            ("daily_capacity", h.daily_capacity),
            ("monthly_capacity", h.monthly_capacity),
        ] {
            if cap == 0 || cap > u32::from(u16::MAX) {
                errors.push(format!(
                    "history.{name} {cap} out of range [1, {}]",
                    u16::MAX
                ));
            }
        }
        if !self.storage.root.as_os_str().is_empty() && h.dir == self.storage.root {
            errors.push("history.dir must not be the pack storage root".into());
        }
    }

    fn validate_transfer(&self, errors: &mut Vec<String>) {
        let t = &self.transfer;
        if t.staging_capacity < PLANT_RECORD_SIZE {
            errors.push(format!(
                "transfer.staging_capacity {} is smaller than one plant record ({PLANT_RECORD_SIZE})",
                t.staging_capacity
            ));
        }
        if t.staging_capacity > MAX_STAGING_BYTES {
            errors.push(format!(
                "transfer.staging_capacity {} exceeds {MAX_STAGING_BYTES}",
                t.staging_capacity
            ));
        }
        if t.timeout_secs == 0 {
            errors.push("transfer.timeout_secs must be positive".into());
        }
        if t.max_plants_per_pack == 0 {
            errors.push("transfer.max_plants_per_pack must be positive".into());
        }
    }

    fn validate_stream(&self, errors: &mut Vec<String>) {
        let s = &self.stream;
        if s.batch_size == 0 || s.batch_size > MAX_STREAM_BATCH {
            errors.push(format!(
                "stream.batch_size {} out of range [1, {MAX_STREAM_BATCH}]",
                s.batch_size
            ));
        }
        if s.backoff_ms.is_empty() {
            errors.push("stream.backoff_ms is empty".into());
        }
        if s.backoff_ms.iter().any(|&ms| ms == 0) {
            errors.push("stream.backoff_ms entries must be positive".into());
        }
    }

    fn validate_aggregation(&self, errors: &mut Vec<String>) {
        let a = &self.aggregation;
        if !(1..=60).contains(&a.tick_secs) {
            errors.push(format!(
                "aggregation.tick_secs {} out of range [1, 60]",
                a.tick_secs
            ));
        }
        if a.save_every_ticks == 0 {
            errors.push("aggregation.save_every_ticks must be positive".into());
        }
        if a.channels == 0 || a.channels > MAX_CHANNELS {
            errors.push(format!(
                "aggregation.channels {} out of range [1, {MAX_CHANNELS}]",
                a.channels
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if path.exists() {
        return load(path);
    }
    tracing::info!(path = %path.display(), "config file not found, using defaults");
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
