//! Error and result-code types shared across the pack store, the transfer
//! receiver and the history engine.

use std::io;

use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Wire result codes
// ---------------------------------------------------------------------------

/// Result code carried in operation-result and transfer-status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PackResult {
    Success = 0,
    Updated = 1,
    AlreadyCurrent = 2,
    InvalidData = 3,
    InvalidVersion = 4,
    StorageFull = 5,
    IoError = 6,
    NotFound = 7,
    CrcMismatch = 8,
}

impl PackResult {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::Updated,
            2 => Self::AlreadyCurrent,
            3 => Self::InvalidData,
            4 => Self::InvalidVersion,
            5 => Self::StorageFull,
            6 => Self::IoError,
            7 => Self::NotFound,
            8 => Self::CrcMismatch,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Pack store errors
// ---------------------------------------------------------------------------

/// Errors raised by the blob codec, the atomic writer and the pack store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("record not found")]
    NotFound,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u8),

    #[error("payload size mismatch: declared {declared}, expected {expected}")]
    SizeMismatch { declared: u32, expected: u32 },

    #[error("crc mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("truncated blob ({0} bytes)")]
    Truncated(usize),

    #[error("record violates invariant: {0}")]
    EncodeInvariant(String),

    #[error("readback of {0} does not match the written record")]
    VerifyMismatch(String),
}

/// `ENOSPC` on every platform the controller targets.
const ENOSPC: i32 = 28;

impl StoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Map to the code reported to clients.
    pub fn result_code(&self) -> PackResult {
        match self {
            Self::Io(e) if e.raw_os_error() == Some(ENOSPC) => PackResult::StorageFull,
            Self::Io(_) | Self::VerifyMismatch(_) => PackResult::IoError,
            Self::NotFound => PackResult::NotFound,
            Self::UnsupportedSchema(_) => PackResult::InvalidVersion,
            Self::CrcMismatch { .. } => PackResult::CrcMismatch,
            Self::InvalidData(_)
            | Self::BadMagic(_)
            | Self::SizeMismatch { .. }
            | Self::Truncated(_)
            | Self::EncodeInvariant(_) => PackResult::InvalidData,
        }
    }

    /// True for failures of the filesystem itself, as opposed to the content.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

// ---------------------------------------------------------------------------
// History errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history ring is empty")]
    Empty,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("corrupt history data: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("wall clock is not set")]
    ClockUnset,
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Failure reported by an external data source (sensor, rain gauge, watering log).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("reading out of range: {0}")]
    OutOfRange(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_round_trip() {
        for code in 0..=8u8 {
            let r = PackResult::from_code(code).unwrap();
            assert_eq!(r.code(), code);
        }
        assert!(PackResult::from_code(9).is_none());
    }

    #[test]
    fn store_error_maps_to_wire_codes() {
        assert_eq!(StoreError::NotFound.result_code(), PackResult::NotFound);
        assert_eq!(
            StoreError::CrcMismatch { stored: 1, computed: 2 }.result_code(),
            PackResult::CrcMismatch
        );
        assert_eq!(
            StoreError::UnsupportedSchema(2).result_code(),
            PackResult::InvalidVersion
        );
        assert_eq!(
            StoreError::invalid("bad").result_code(),
            PackResult::InvalidData
        );
        let full = io::Error::from_raw_os_error(ENOSPC);
        assert_eq!(StoreError::Io(full).result_code(), PackResult::StorageFull);
        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(StoreError::Io(other).result_code(), PackResult::IoError);
    }
}
