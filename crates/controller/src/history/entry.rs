//! History records and their packed fixed-point layouts.
//!
//! In memory, environmental values are `f32` and an absent statistic is
//! `None`. On disk and on the wire each value is scaled ×100 and a flag bit
//! marks validity; absent values are written as zero.

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use super::bucket::Granularity;

/// Fixed-size packed record stored in a history log.
pub trait HistoryRecord: Clone + Default + Send + Sync + 'static {
    const SIZE: usize;
    const GRANULARITY: Granularity;

    /// Start of the bucket this record describes.
    fn timestamp(&self) -> u32;

    /// Write exactly `SIZE` bytes into `out`.
    fn encode(&self, out: &mut [u8]);

    /// Read from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        self.encode(&mut buf);
        buf
    }
}

// ---------------------------------------------------------------------------
// Fixed-point helpers
// ---------------------------------------------------------------------------

fn to_i16_x100(v: f32) -> i16 {
    (v * 100.0).round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

fn to_u16_x100(v: f32) -> u16 {
    (v * 100.0).round().clamp(0.0, f32::from(u16::MAX)) as u16
}

fn to_u32_x100(v: f32) -> u32 {
    (f64::from(v) * 100.0).round().clamp(0.0, f64::from(u32::MAX)) as u32
}

fn from_x100(v: f32) -> f32 {
    v / 100.0
}

const FLAG_TEMPERATURE: u8 = 1 << 0;
const FLAG_HUMIDITY: u8 = 1 << 1;
const FLAG_PRESSURE: u8 = 1 << 2;

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// One environmental reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EnvSample {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
}

/// `(min, max, avg)` of one dimension over a window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Stat {
    pub min: f32,
    pub max: f32,
    pub avg: f32,
}

/// Temperature, humidity and pressure statistics: 24 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EnvStats {
    pub temperature: Option<Stat>,
    pub humidity: Option<Stat>,
    pub pressure: Option<Stat>,
}

impl EnvStats {
    const SIZE: usize = 24;

    fn flags(&self) -> u8 {
        let mut f = 0;
        if self.temperature.is_some() {
            f |= FLAG_TEMPERATURE;
        }
        if self.humidity.is_some() {
            f |= FLAG_HUMIDITY;
        }
        if self.pressure.is_some() {
            f |= FLAG_PRESSURE;
        }
        f
    }

    fn encode(&self, out: &mut [u8]) {
        let t = self.temperature.unwrap_or_default();
        LittleEndian::write_i16(&mut out[0..2], to_i16_x100(t.min));
        LittleEndian::write_i16(&mut out[2..4], to_i16_x100(t.max));
        LittleEndian::write_i16(&mut out[4..6], to_i16_x100(t.avg));
        let h = self.humidity.unwrap_or_default();
        LittleEndian::write_u16(&mut out[6..8], to_u16_x100(h.min));
        LittleEndian::write_u16(&mut out[8..10], to_u16_x100(h.max));
        LittleEndian::write_u16(&mut out[10..12], to_u16_x100(h.avg));
        let p = self.pressure.unwrap_or_default();
        LittleEndian::write_u32(&mut out[12..16], to_u32_x100(p.min));
        LittleEndian::write_u32(&mut out[16..20], to_u32_x100(p.max));
        LittleEndian::write_u32(&mut out[20..24], to_u32_x100(p.avg));
    }

    fn decode(bytes: &[u8], flags: u8) -> Self {
        let i16_at = |o: usize| from_x100(f32::from(LittleEndian::read_i16(&bytes[o..o + 2])));
        let u16_at = |o: usize| from_x100(f32::from(LittleEndian::read_u16(&bytes[o..o + 2])));
        let u32_at = |o: usize| (f64::from(LittleEndian::read_u32(&bytes[o..o + 4])) / 100.0) as f32;
        Self {
            temperature: (flags & FLAG_TEMPERATURE != 0).then(|| Stat {
                min: i16_at(0),
                max: i16_at(2),
                avg: i16_at(4),
            }),
            humidity: (flags & FLAG_HUMIDITY != 0).then(|| Stat {
                min: u16_at(6),
                max: u16_at(8),
                avg: u16_at(10),
            }),
            pressure: (flags & FLAG_PRESSURE != 0).then(|| Stat {
                min: u32_at(12),
                max: u32_at(16),
                avg: u32_at(20),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags() == 0
    }
}

// ---------------------------------------------------------------------------
// Hourly
// ---------------------------------------------------------------------------

/// One hour of conditions and watering activity.
///
/// ```text
/// 0  timestamp:u32   4 temp_x100:i16   6 hum_x100:u16   8 press_x100:u32
/// 12 rain_x100:u16  14 events:u8      15 flags:u8     16 volume_ml:u32
/// 20 channels:u16   22 reserved[10]
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HourlyEntry {
    pub timestamp: u32,
    pub env: Option<EnvSample>,
    /// Hundredths of a millimetre.
    pub rainfall_mm_x100: u16,
    pub watering_events: u8,
    pub total_volume_ml: u32,
    pub active_channels: u16,
}

impl HistoryRecord for HourlyEntry {
    const SIZE: usize = 32;
    const GRANULARITY: Granularity = Granularity::Hourly;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode(&self, out: &mut [u8]) {
        out[..Self::SIZE].fill(0);
        LittleEndian::write_u32(&mut out[0..4], self.timestamp);
        let env = self.env.unwrap_or_default();
        LittleEndian::write_i16(&mut out[4..6], to_i16_x100(env.temperature_c));
        LittleEndian::write_u16(&mut out[6..8], to_u16_x100(env.humidity_pct));
        LittleEndian::write_u32(&mut out[8..12], to_u32_x100(env.pressure_hpa));
        LittleEndian::write_u16(&mut out[12..14], self.rainfall_mm_x100);
        out[14] = self.watering_events;
        out[15] = if self.env.is_some() {
            FLAG_TEMPERATURE | FLAG_HUMIDITY | FLAG_PRESSURE
        } else {
            0
        };
        LittleEndian::write_u32(&mut out[16..20], self.total_volume_ml);
        LittleEndian::write_u16(&mut out[20..22], self.active_channels);
    }

    fn decode(b: &[u8]) -> Self {
        let env = (b[15] & FLAG_TEMPERATURE != 0).then(|| EnvSample {
            temperature_c: from_x100(f32::from(LittleEndian::read_i16(&b[4..6]))),
            humidity_pct: from_x100(f32::from(LittleEndian::read_u16(&b[6..8]))),
            pressure_hpa: (f64::from(LittleEndian::read_u32(&b[8..12])) / 100.0) as f32,
        });
        Self {
            timestamp: LittleEndian::read_u32(&b[0..4]),
            env,
            rainfall_mm_x100: LittleEndian::read_u16(&b[12..14]),
            watering_events: b[14],
            total_volume_ml: LittleEndian::read_u32(&b[16..20]),
            active_channels: LittleEndian::read_u16(&b[20..22]),
        }
    }
}

// ---------------------------------------------------------------------------
// Daily
// ---------------------------------------------------------------------------

/// Roll-up of one day of hourly entries.
///
/// ```text
/// 0  timestamp:u32   4 stats[24]   28 rain_x100:u32   32 events:u16
/// 34 volume_ml:u32  38 samples:u16 40 channels:u16    42 flags:u8
/// 43 reserved[5]
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DailyEntry {
    pub timestamp: u32,
    pub stats: EnvStats,
    pub rainfall_mm_x100: u32,
    pub watering_events: u16,
    pub total_volume_ml: u32,
    /// Hourly entries with a valid environmental reading.
    pub sample_count: u16,
    pub active_channels: u16,
}

impl HistoryRecord for DailyEntry {
    const SIZE: usize = 48;
    const GRANULARITY: Granularity = Granularity::Daily;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode(&self, out: &mut [u8]) {
        out[..Self::SIZE].fill(0);
        LittleEndian::write_u32(&mut out[0..4], self.timestamp);
        self.stats.encode(&mut out[4..4 + EnvStats::SIZE]);
        LittleEndian::write_u32(&mut out[28..32], self.rainfall_mm_x100);
        LittleEndian::write_u16(&mut out[32..34], self.watering_events);
        LittleEndian::write_u32(&mut out[34..38], self.total_volume_ml);
        LittleEndian::write_u16(&mut out[38..40], self.sample_count);
        LittleEndian::write_u16(&mut out[40..42], self.active_channels);
        out[42] = self.stats.flags();
    }

    fn decode(b: &[u8]) -> Self {
        Self {
            timestamp: LittleEndian::read_u32(&b[0..4]),
            stats: EnvStats::decode(&b[4..28], b[42]),
            rainfall_mm_x100: LittleEndian::read_u32(&b[28..32]),
            watering_events: LittleEndian::read_u16(&b[32..34]),
            total_volume_ml: LittleEndian::read_u32(&b[34..38]),
            sample_count: LittleEndian::read_u16(&b[38..40]),
            active_channels: LittleEndian::read_u16(&b[40..42]),
        }
    }
}

// ---------------------------------------------------------------------------
// Monthly
// ---------------------------------------------------------------------------

/// Roll-up of one 30-day bucket of daily entries.
///
/// ```text
/// 0  timestamp:u32   4 stats[24]   28 rain_x100:u32   32 events:u32
/// 36 volume_ml:u64  44 days_active:u8  45 flags:u8    46 channels:u16
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MonthlyEntry {
    pub timestamp: u32,
    pub stats: EnvStats,
    pub rainfall_mm_x100: u32,
    pub watering_events: u32,
    pub total_volume_ml: u64,
    pub days_active: u8,
    pub active_channels: u16,
}

impl HistoryRecord for MonthlyEntry {
    const SIZE: usize = 48;
    const GRANULARITY: Granularity = Granularity::Monthly;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode(&self, out: &mut [u8]) {
        out[..Self::SIZE].fill(0);
        LittleEndian::write_u32(&mut out[0..4], self.timestamp);
        self.stats.encode(&mut out[4..4 + EnvStats::SIZE]);
        LittleEndian::write_u32(&mut out[28..32], self.rainfall_mm_x100);
        LittleEndian::write_u32(&mut out[32..36], self.watering_events);
        LittleEndian::write_u64(&mut out[36..44], self.total_volume_ml);
        out[44] = self.days_active;
        out[45] = self.stats.flags();
        LittleEndian::write_u16(&mut out[46..48], self.active_channels);
    }

    fn decode(b: &[u8]) -> Self {
        Self {
            timestamp: LittleEndian::read_u32(&b[0..4]),
            stats: EnvStats::decode(&b[4..28], b[45]),
            rainfall_mm_x100: LittleEndian::read_u32(&b[28..32]),
            watering_events: LittleEndian::read_u32(&b[32..36]),
            total_volume_ml: LittleEndian::read_u64(&b[36..44]),
            days_active: b[44],
            active_channels: LittleEndian::read_u16(&b[46..48]),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
