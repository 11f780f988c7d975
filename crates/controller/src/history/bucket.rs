//! Epoch-second bucketing. A month is a fixed 30-day interval, so month
//! boundaries drift against the calendar.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub const HOUR_SECS: u32 = 3_600;
pub const DAY_SECS: u32 = 86_400;
pub const MONTH_SECS: u32 = 30 * DAY_SECS;

pub fn hour_bucket(t: u32) -> u32 {
    t / HOUR_SECS
}

pub fn day_bucket(t: u32) -> u32 {
    t / DAY_SECS
}

pub fn month_bucket(t: u32) -> u32 {
    t / MONTH_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Granularity {
    Hourly = 0,
    Daily = 1,
    Monthly = 2,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Self::Hourly, Self::Daily, Self::Monthly];

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Hourly),
            1 => Some(Self::Daily),
            2 => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn interval_secs(self) -> u32 {
        match self {
            Self::Hourly => HOUR_SECS,
            Self::Daily => DAY_SECS,
            Self::Monthly => MONTH_SECS,
        }
    }

    pub fn bucket(self, t: u32) -> u32 {
        t / self.interval_secs()
    }

    /// First second of bucket `k`, saturating at `u32::MAX`.
    pub fn bucket_start(self, k: u32) -> u32 {
        k.saturating_mul(self.interval_secs())
    }

    pub fn is_aligned(self, t: u32) -> bool {
        t % self.interval_secs() == 0
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" | "hour" => Ok(Self::Hourly),
            "daily" | "day" => Ok(Self::Daily),
            "monthly" | "month" => Ok(Self::Monthly),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}
