//! Collaborators the aggregator samples: wall clock, environmental sensor,
//! rain gauge and per-channel watering history.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;

use super::entry::EnvSample;
use crate::error::SourceError;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    /// UTC epoch seconds; 0 while the clock has not been set.
    fn now_epoch_utc(&self) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_utc(&self) -> u32 {
        let secs = OffsetDateTime::now_utc().unix_timestamp();
        u32::try_from(secs).unwrap_or(0)
    }
}

/// Settable clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(now: u32) -> Self {
        Self {
            now: AtomicU32::new(now),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_epoch_utc(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Environmental sensor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EnvReading {
    pub sample: EnvSample,
    pub valid: bool,
}

impl EnvReading {
    pub fn from_sample(sample: EnvSample) -> Self {
        Self {
            sample,
            valid: true,
        }
    }

    pub fn into_sample(self) -> Option<EnvSample> {
        self.valid.then_some(self.sample)
    }
}

pub trait EnvSensor: Send + Sync {
    fn current(&self) -> Result<EnvReading, SourceError>;
}

/// Sensor returning whatever reading was last stored.
#[derive(Debug, Default)]
pub struct StaticEnv {
    reading: Mutex<Option<EnvReading>>,
}

impl StaticEnv {
    pub fn new(reading: Option<EnvReading>) -> Self {
        Self {
            reading: Mutex::new(reading),
        }
    }

    pub fn set(&self, reading: Option<EnvReading>) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = reading;
    }
}

impl EnvSensor for StaticEnv {
    fn current(&self) -> Result<EnvReading, SourceError> {
        let reading = *self.reading.lock().unwrap_or_else(PoisonError::into_inner);
        reading.ok_or_else(|| SourceError::Unavailable("no sensor reading".into()))
    }
}

// ---------------------------------------------------------------------------
// Rain
// ---------------------------------------------------------------------------

pub trait RainSource: Send + Sync {
    /// Millimetres of rain in `[start, end)`.
    fn rainfall_for_window(&self, start: u32, end: u32) -> Result<f32, SourceError>;
}

/// Rain gauge backed by a list of `(timestamp, mm)` tips.
#[derive(Debug, Default)]
pub struct RainLog {
    tips: Mutex<Vec<(u32, f32)>>,
}

impl RainLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, timestamp: u32, mm: f32) {
        self.tips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((timestamp, mm));
    }
}

impl RainSource for RainLog {
    fn rainfall_for_window(&self, start: u32, end: u32) -> Result<f32, SourceError> {
        if start >= end {
            return Err(SourceError::OutOfRange(format!("{start}..{end}")));
        }
        Ok(self
            .tips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| (start..end).contains(t))
            .map(|(_, mm)| mm)
            .sum())
    }
}

// ---------------------------------------------------------------------------
// Watering history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WateringMode {
    ByDuration,
    ByVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WateringEvent {
    pub timestamp: u32,
    /// Millilitres for `ByVolume`, seconds for `ByDuration`.
    pub actual_value: u32,
    pub mode: WateringMode,
}

pub trait WateringHistory: Send + Sync {
    fn events_in_range(
        &self,
        channel: u8,
        start: u32,
        end: u32,
    ) -> Result<Vec<WateringEvent>, SourceError>;
}

#[derive(Debug, Default)]
pub struct WateringLog {
    events: Mutex<Vec<(u8, WateringEvent)>>,
}

impl WateringLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, channel: u8, event: WateringEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel, event));
    }

    pub fn record_volume(&self, channel: u8, timestamp: u32, ml: u32) {
        self.record(
            channel,
            WateringEvent {
                timestamp,
                actual_value: ml,
                mode: WateringMode::ByVolume,
            },
        );
    }
}

impl WateringHistory for WateringLog {
    fn events_in_range(
        &self,
        channel: u8,
        start: u32,
        end: u32,
    ) -> Result<Vec<WateringEvent>, SourceError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(ch, e)| *ch == channel && (start..end).contains(&e.timestamp))
            .map(|(_, e)| *e)
            .collect())
    }
}
