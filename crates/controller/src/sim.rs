//! Simulated environment for running the controller without hardware.
//!
//! - Air sensor: random walk around a diurnal curve, with occasional
//!   dropouts in the flaky scenario
//! - Rain gauge: showers drawn per hour, seeded by the hour so repeated
//!   queries over the same window agree
//! - Watering history: per-channel cycles, also seeded by hour and channel

use std::f64::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SourceError;
use crate::history::bucket::{hour_bucket, HOUR_SECS};
use crate::history::entry::EnvSample;
use crate::history::sources::{
    Clock, EnvReading, EnvSensor, RainSource, WateringEvent, WateringHistory, WateringMode,
};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild days, rare showers, one cycle per channel most mornings.
    Temperate,
    /// Hot and dry. Frequent long watering.
    Heatwave,
    /// Cool, showers most hours, little watering.
    Rainy,
    /// Temperate weather but the air sensor drops out ~20% of reads.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" | "hot" => Self::Heatwave,
            "rainy" | "wet" => Self::Rainy,
            "flaky" => Self::Flaky,
            _ => Self::Temperate,
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Temperate | Self::Flaky => Profile {
                mean_temp_c: 18.0,
                diurnal_temp_c: 6.0,
                mean_humidity: 65.0,
                rain_prob: 0.05,
                rain_mm: 1.5,
                water_prob: 0.10,
                volume_ml: 2_000.0,
                dropout: if self == Self::Flaky { 0.2 } else { 0.0 },
            },
            Self::Heatwave => Profile {
                mean_temp_c: 31.0,
                diurnal_temp_c: 8.0,
                mean_humidity: 30.0,
                rain_prob: 0.0,
                rain_mm: 0.0,
                water_prob: 0.25,
                volume_ml: 4_000.0,
                dropout: 0.0,
            },
            Self::Rainy => Profile {
                mean_temp_c: 12.0,
                diurnal_temp_c: 3.0,
                mean_humidity: 88.0,
                rain_prob: 0.6,
                rain_mm: 2.5,
                water_prob: 0.02,
                volume_ml: 1_000.0,
                dropout: 0.0,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperate => write!(f, "temperate"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Rainy => write!(f, "rainy"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Profile {
    mean_temp_c: f64,
    diurnal_temp_c: f64,
    mean_humidity: f64,
    rain_prob: f64,
    rain_mm: f64,
    water_prob: f64,
    volume_ml: f64,
    dropout: f64,
}

/// Seed for one hour of one stream, so the same window always yields the
/// same simulated history.
fn hour_seed(stream: u64, hour: u32) -> u64 {
    (stream << 40) ^ u64::from(hour).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ---------------------------------------------------------------------------
// Air sensor
// ---------------------------------------------------------------------------

struct Walk {
    rng: fastrand::Rng,
    temp_offset: f64,
    humidity_offset: f64,
    pressure_hpa: f64,
}

pub struct EnvSim {
    profile: Profile,
    clock: Arc<dyn Clock>,
    walk: Mutex<Walk>,
}

impl EnvSim {
    pub fn new(scenario: Scenario, clock: Arc<dyn Clock>) -> Self {
        Self::with_seed(scenario, clock, fastrand::u64(..))
    }

    pub fn with_seed(scenario: Scenario, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self {
            profile: scenario.profile(),
            clock,
            walk: Mutex::new(Walk {
                rng: fastrand::Rng::with_seed(seed),
                temp_offset: 0.0,
                humidity_offset: 0.0,
                pressure_hpa: 1013.0,
            }),
        }
    }
}

impl EnvSensor for EnvSim {
    fn current(&self) -> Result<EnvReading, SourceError> {
        let p = self.profile;
        let mut w = self.walk.lock().unwrap_or_else(PoisonError::into_inner);
        if w.rng.f64() < p.dropout {
            return Err(SourceError::Unavailable("simulated sensor dropout".into()));
        }

        // Mean-reverting walks.
        let step = gaussian(&mut w.rng, 0.0, 0.3);
        w.temp_offset += step - 0.1 * w.temp_offset;
        let step = gaussian(&mut w.rng, 0.0, 1.0);
        w.humidity_offset += step - 0.1 * w.humidity_offset;
        let step = gaussian(&mut w.rng, 0.0, 0.4);
        w.pressure_hpa = (w.pressure_hpa + step - 0.05 * (w.pressure_hpa - 1013.0))
            .clamp(950.0, 1060.0);

        // Peak around 15:00 UTC.
        let secs_of_day = f64::from(self.clock.now_epoch_utc() % 86_400);
        let phase = 2.0 * PI * (secs_of_day - 9.0 * 3_600.0) / 86_400.0;
        let diurnal = phase.sin();

        let temperature = p.mean_temp_c + p.diurnal_temp_c * diurnal + w.temp_offset;
        let humidity =
            (p.mean_humidity - 10.0 * diurnal + w.humidity_offset).clamp(5.0, 100.0);
        Ok(EnvReading::from_sample(EnvSample {
            temperature_c: temperature as f32,
            humidity_pct: humidity as f32,
            pressure_hpa: w.pressure_hpa as f32,
        }))
    }
}

// ---------------------------------------------------------------------------
// Rain gauge
// ---------------------------------------------------------------------------

pub struct RainSim {
    profile: Profile,
}

impl RainSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            profile: scenario.profile(),
        }
    }

    fn hour_mm(&self, hour: u32) -> f64 {
        let mut rng = fastrand::Rng::with_seed(hour_seed(0, hour));
        if rng.f64() < self.profile.rain_prob {
            gaussian(&mut rng, self.profile.rain_mm, self.profile.rain_mm / 2.0).max(0.0)
        } else {
            0.0
        }
    }
}

impl RainSource for RainSim {
    fn rainfall_for_window(&self, start: u32, end: u32) -> Result<f32, SourceError> {
        if start >= end {
            return Err(SourceError::OutOfRange(format!("{start}..{end}")));
        }
        // Partial hours are prorated.
        let mut total = 0.0;
        let mut t = start;
        while t < end {
            let hour = hour_bucket(t);
            let hour_end = hour.saturating_add(1).saturating_mul(HOUR_SECS).min(end);
            let frac = f64::from(hour_end - t) / f64::from(HOUR_SECS);
            total += self.hour_mm(hour) * frac;
            if hour_end <= t {
                break;
            }
            t = hour_end;
        }
        Ok(total as f32)
    }
}

// ---------------------------------------------------------------------------
// Watering history
// ---------------------------------------------------------------------------

pub struct WateringSim {
    profile: Profile,
    channels: u8,
}

impl WateringSim {
    pub fn new(scenario: Scenario, channels: u8) -> Self {
        Self {
            profile: scenario.profile(),
            channels,
        }
    }

    /// At most one cycle per channel per hour, at a seeded minute.
    fn event_in_hour(&self, channel: u8, hour: u32) -> Option<WateringEvent> {
        let mut rng = fastrand::Rng::with_seed(hour_seed(u64::from(channel) + 1, hour));
        if rng.f64() >= self.profile.water_prob {
            return None;
        }
        let start = hour.checked_mul(HOUR_SECS)?;
        let timestamp = start.checked_add(rng.u32(0..HOUR_SECS))?;
        // Even channels meter volume, odd ones run on a timer.
        let (mode, actual_value) = if channel % 2 == 0 {
            let ml = gaussian(&mut rng, self.profile.volume_ml, self.profile.volume_ml / 5.0);
            (WateringMode::ByVolume, ml.max(0.0) as u32)
        } else {
            (WateringMode::ByDuration, rng.u32(60..900))
        };
        Some(WateringEvent {
            timestamp,
            actual_value,
            mode,
        })
    }
}

impl WateringHistory for WateringSim {
    fn events_in_range(
        &self,
        channel: u8,
        start: u32,
        end: u32,
    ) -> Result<Vec<WateringEvent>, SourceError> {
        if channel >= self.channels {
            return Err(SourceError::OutOfRange(format!("channel {channel}")));
        }
        if start > end {
            return Err(SourceError::OutOfRange(format!("{start}..{end}")));
        }
        Ok((hour_bucket(start)..=hour_bucket(end))
            .filter_map(|h| self.event_in_hour(channel, h))
            .filter(|e| (start..end).contains(&e.timestamp))
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::bucket::DAY_SECS;
    use crate::history::sources::ManualClock;

    const T0: u32 = 1_700_000_000 - 1_700_000_000 % DAY_SECS;

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("HEATWAVE"), Scenario::Heatwave);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Rainy);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Temperate);
        assert_eq!(Scenario::Rainy.to_string(), "rainy");
    }

    #[test]
    fn afternoon_is_warmer_than_night() {
        let clock = Arc::new(ManualClock::new(T0 + 3 * HOUR_SECS));
        let sim = EnvSim::with_seed(Scenario::Temperate, clock.clone(), 7);
        let night: f32 = (0..20).map(|_| sim.current().unwrap().sample.temperature_c).sum();
        clock.set(T0 + 15 * HOUR_SECS);
        let afternoon: f32 = (0..20).map(|_| sim.current().unwrap().sample.temperature_c).sum();
        assert!(
            afternoon > night,
            "afternoon {afternoon:.1} should exceed night {night:.1}"
        );
    }

    #[test]
    fn flaky_sensor_drops_out() {
        let sim = EnvSim::with_seed(Scenario::Flaky, Arc::new(ManualClock::new(T0)), 3);
        let failures = (0..500).filter(|_| sim.current().is_err()).count();
        assert!((30..200).contains(&failures), "failures: {failures}");
    }

    #[test]
    fn rain_is_repeatable_and_additive() {
        let rain = RainSim::new(Scenario::Rainy);
        let day = rain.rainfall_for_window(T0, T0 + DAY_SECS).unwrap();
        assert_eq!(day, rain.rainfall_for_window(T0, T0 + DAY_SECS).unwrap());
        assert!(day > 0.0);

        let halves = rain.rainfall_for_window(T0, T0 + DAY_SECS / 2).unwrap()
            + rain
                .rainfall_for_window(T0 + DAY_SECS / 2, T0 + DAY_SECS)
                .unwrap();
        assert!((day - halves).abs() < 0.01);
        assert!(rain.rainfall_for_window(T0, T0).is_err());
        assert_eq!(
            RainSim::new(Scenario::Heatwave)
                .rainfall_for_window(T0, T0 + DAY_SECS)
                .unwrap(),
            0.0
        );
    }

    #[test]
    fn watering_events_stay_in_window() {
        let sim = WateringSim::new(Scenario::Heatwave, 4);
        let week = sim.events_in_range(0, T0, T0 + 7 * DAY_SECS).unwrap();
        assert!(!week.is_empty());
        assert!(week
            .iter()
            .all(|e| e.mode == WateringMode::ByVolume && (T0..T0 + 7 * DAY_SECS).contains(&e.timestamp)));

        let hour = sim.events_in_range(1, T0, T0 + 7 * DAY_SECS).unwrap();
        assert!(hour.iter().all(|e| e.mode == WateringMode::ByDuration));
        assert!(sim.events_in_range(4, T0, T0 + 1).is_err());
    }
}
