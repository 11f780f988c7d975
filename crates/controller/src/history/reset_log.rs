//! Per-channel log of the last 16 configuration resets, one small-KV key
//! per channel.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::{info, warn};

use super::kv::{KvStore, KEY_RESET_LOG_BASE};
use super::ring::Ring;
use crate::error::HistoryError;
use crate::pack::FixedStr;

pub const RESET_LOG_CAPACITY: u8 = 16;
pub const RESET_ENTRY_LEN: usize = 38;
pub const RESET_LOG_BLOB_LEN: usize = RESET_ENTRY_LEN * RESET_LOG_CAPACITY as usize + 2;

const DEFAULT_REASON: &str = "User request";

/// Which part of a channel's configuration was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetGroup {
    Basic,
    GrowingEnv,
    Compensation,
    CustomSoil,
    Interval,
    #[default]
    All,
}

impl ResetGroup {
    pub fn code(self) -> u8 {
        match self {
            Self::Basic => 0,
            Self::GrowingEnv => 1,
            Self::Compensation => 2,
            Self::CustomSoil => 3,
            Self::Interval => 4,
            Self::All => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Basic,
            1 => Self::GrowingEnv,
            2 => Self::Compensation,
            3 => Self::CustomSoil,
            4 => Self::Interval,
            0xFF => Self::All,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResetEntry {
    pub group: ResetGroup,
    pub timestamp: u32,
    pub channel: u8,
    pub reason: FixedStr<32>,
}

impl ResetEntry {
    fn encode(&self, out: &mut [u8]) {
        out[0] = self.group.code();
        LittleEndian::write_u32(&mut out[1..5], self.timestamp);
        out[5] = self.channel;
        out[6..38].copy_from_slice(self.reason.as_bytes());
    }

    fn decode(b: &[u8]) -> Self {
        let mut reason = [0u8; 32];
        reason.copy_from_slice(&b[6..38]);
        Self {
            group: ResetGroup::from_code(b[0]).unwrap_or_default(),
            timestamp: LittleEndian::read_u32(&b[1..5]),
            channel: b[5],
            reason: FixedStr::from_raw(reason),
        }
    }
}

pub struct ResetLog {
    kv: Arc<dyn KvStore>,
    channels: u8,
    loaded: HashMap<u8, Ring<ResetEntry>>,
}

impl ResetLog {
    pub fn new(kv: Arc<dyn KvStore>, channels: u8) -> Self {
        Self {
            kv,
            channels,
            loaded: HashMap::new(),
        }
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    fn key(channel: u8) -> u16 {
        KEY_RESET_LOG_BASE + u16::from(channel)
    }

    fn check_channel(&self, channel: u8) -> Result<(), HistoryError> {
        if channel >= self.channels {
            return Err(HistoryError::InvalidParam(format!(
                "channel {channel} out of range (0..{})",
                self.channels
            )));
        }
        Ok(())
    }

    fn load(&mut self, channel: u8) -> Result<&mut Ring<ResetEntry>, HistoryError> {
        if !self.loaded.contains_key(&channel) {
            let ring = match self.kv.read(Self::key(channel))? {
                None => Ring::new(u16::from(RESET_LOG_CAPACITY)),
                Some(blob) => Self::decode_blob(channel, &blob),
            };
            self.loaded.insert(channel, ring);
        }
        Ok(self
            .loaded
            .entry(channel)
            .or_insert_with(|| Ring::new(u16::from(RESET_LOG_CAPACITY))))
    }

    /// Out-of-range head and count are wrapped and clamped, not discarded.
    fn decode_blob(channel: u8, blob: &[u8]) -> Ring<ResetEntry> {
        let cap = u16::from(RESET_LOG_CAPACITY);
        if blob.len() != RESET_LOG_BLOB_LEN {
            warn!(channel, len = blob.len(), "reset log: blob size mismatch, starting empty");
            return Ring::new(cap);
        }
        let (slots, tail) = blob.split_at(RESET_ENTRY_LEN * usize::from(RESET_LOG_CAPACITY));
        let head = u16::from(tail[0]);
        let count = u16::from(tail[1]);
        if head >= cap || count > cap {
            warn!(channel, head, count, "reset log: repairing ring position");
        }
        let slots = slots
            .chunks_exact(RESET_ENTRY_LEN)
            .map(ResetEntry::decode)
            .collect();
        Ring::from_slots(slots, head % cap, count.min(cap), cap)
    }

    fn encode_blob(ring: &Ring<ResetEntry>) -> Vec<u8> {
        let mut out = vec![0u8; RESET_LOG_BLOB_LEN];
        for (chunk, slot) in out.chunks_exact_mut(RESET_ENTRY_LEN).zip(ring.slots()) {
            slot.encode(chunk);
        }
        out[RESET_LOG_BLOB_LEN - 2] = ring.head() as u8;
        out[RESET_LOG_BLOB_LEN - 1] = ring.len() as u8;
        out
    }

    /// Append an entry and persist the channel's log. An empty reason is
    /// stored as "User request".
    pub fn record(
        &mut self,
        channel: u8,
        group: ResetGroup,
        reason: &str,
        timestamp: u32,
    ) -> Result<(), HistoryError> {
        self.check_channel(channel)?;
        let reason = if reason.is_empty() { DEFAULT_REASON } else { reason };
        let entry = ResetEntry {
            group,
            timestamp,
            channel,
            reason: FixedStr::new(reason),
        };
        let ring = self.load(channel)?;
        ring.push(entry);
        let blob = Self::encode_blob(ring);
        self.kv.write(Self::key(channel), &blob)?;
        info!(channel, group = ?group, reason, "reset log: entry recorded");
        Ok(())
    }

    /// Entries for `channel`, oldest first.
    pub fn entries(&mut self, channel: u8) -> Result<Vec<ResetEntry>, HistoryError> {
        self.check_channel(channel)?;
        Ok(self.load(channel)?.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::kv::MemKv;

    #[test]
    fn records_persist_across_instances() {
        let kv = Arc::new(MemKv::new());
        {
            let mut log = ResetLog::new(kv.clone(), 8);
            log.record(2, ResetGroup::Compensation, "rain sensor swapped", 1000)
                .unwrap();
            log.record(2, ResetGroup::All, "", 2000).unwrap();
        }
        assert_eq!(
            kv.read(0x6202).unwrap().unwrap().len(),
            RESET_LOG_BLOB_LEN
        );

        let mut log = ResetLog::new(kv, 8);
        let entries = log.entries(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].group, ResetGroup::Compensation);
        assert_eq!(entries[0].reason.as_str(), "rain sensor swapped");
        assert_eq!(entries[1].reason.as_str(), "User request");
        assert_eq!(entries[1].channel, 2);
        assert!(log.entries(3).unwrap().is_empty());
    }

    #[test]
    fn keeps_last_sixteen() {
        let mut log = ResetLog::new(Arc::new(MemKv::new()), 1);
        for t in 0..20 {
            log.record(0, ResetGroup::Interval, "x", t).unwrap();
        }
        let entries = log.entries(0).unwrap();
        assert_eq!(entries.len(), 16);
        assert_eq!(entries[0].timestamp, 4);
        assert_eq!(entries[15].timestamp, 19);
    }

    #[test]
    fn out_of_range_position_is_repaired() {
        let kv = Arc::new(MemKv::new());
        let mut log = ResetLog::new(kv.clone(), 1);
        log.record(0, ResetGroup::Basic, "a", 10).unwrap();
        let mut blob = kv.read(KEY_RESET_LOG_BASE).unwrap().unwrap();
        // head 17 wraps to 1; count 40 clamps to 16
        blob[RESET_LOG_BLOB_LEN - 2] = 17;
        blob[RESET_LOG_BLOB_LEN - 1] = 40;
        kv.write(KEY_RESET_LOG_BASE, &blob).unwrap();

        let mut log = ResetLog::new(kv, 1);
        let entries = log.entries(0).unwrap();
        assert_eq!(entries.len(), 16);
        assert_eq!(entries.last().unwrap().timestamp, 10);
    }

    #[test]
    fn rejects_unknown_channel() {
        let mut log = ResetLog::new(Arc::new(MemKv::new()), 4);
        assert!(matches!(
            log.record(4, ResetGroup::All, "", 0),
            Err(HistoryError::InvalidParam(_))
        ));
        assert!(log.entries(9).is_err());
    }
}
