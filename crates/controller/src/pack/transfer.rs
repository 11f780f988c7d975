//! Multi-chunk pack upload: START, in-order DATA chunks into a staging
//! buffer, then COMMIT installs every plant and the pack index.
//!
//! The receiver is a plain state machine. Callers pass the current instant
//! in, decide when to notify, and own whatever lock guards it. COMMIT is
//! split so that lock is free while the store writes run: `take_commit`
//! verifies and hands out the staged bytes, `StagedCommit::install` writes
//! them, `finish_commit` settles the session.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::codec::crc32;
use super::record::{FixedStr, PackRecord, PlantRecords, BUILTIN_PACK_ID, INVALID_ID, PLANT_RECORD_SIZE};
use super::store::{InstallOutcome, PackStore};
use crate::config::TransferConfig;
use crate::error::PackResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TransferState {
    Idle = 0,
    Receiving = 1,
    Complete = 2,
    Error = 3,
}

impl TransferState {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Idle,
            1 => Self::Receiving,
            2 => Self::Complete,
            3 => Self::Error,
            _ => return None,
        })
    }
}

/// Parameters announced by START.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartRequest {
    pub pack_id: u16,
    pub version: u16,
    pub plant_count: u16,
    pub total_size: u32,
    pub crc32: u32,
    pub name: FixedStr<32>,
}

impl StartRequest {
    /// Describe an upload of `payload` (back-to-back plant records).
    pub fn for_payload(pack_id: u16, version: u16, name: &str, payload: &[u8]) -> Self {
        Self {
            pack_id,
            version,
            plant_count: (payload.len() / PLANT_RECORD_SIZE).min(usize::from(u16::MAX)) as u16,
            total_size: payload.len().min(u32::MAX as usize) as u32,
            crc32: crc32(payload),
            name: FixedStr::new(name),
        }
    }
}

/// Snapshot served on reads and sent in notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub state: TransferState,
    pub progress_pct: u8,
    pub pack_id: u16,
    pub bytes_received: u32,
    pub bytes_expected: u32,
    pub last_error: PackResult,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no transfer in progress (state {0:?})")]
    InvalidState(TransferState),

    #[error("start rejected: {0}")]
    Rejected(String),

    #[error("out-of-order chunk: offset {got}, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("invalid chunk: {0}")]
    InvalidData(String),

    #[error("transfer idle for {0:?}")]
    Timeout(Duration),

    #[error("crc mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("commit already in progress")]
    Busy,
}

impl TransferError {
    pub fn result_code(&self) -> PackResult {
        match self {
            Self::Timeout(_) => PackResult::IoError,
            Self::CrcMismatch { .. } => PackResult::CrcMismatch,
            Self::InvalidState(_)
            | Self::Rejected(_)
            | Self::OutOfOrder { .. }
            | Self::InvalidData(_)
            | Self::Busy => PackResult::InvalidData,
        }
    }

    /// The error moved the session into `ERROR`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidData(_) | Self::Timeout(_) | Self::CrcMismatch { .. }
        )
    }
}

/// What COMMIT did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub pack_id: u16,
    pub updated: usize,
    pub already_current: usize,
    pub errors: usize,
    pub pack_written: bool,
}

/// Verified upload handed out by `take_commit`. The payload is zeroed when
/// this is dropped.
pub struct StagedCommit {
    session: StartRequest,
    payload: Vec<u8>,
    generation: u64,
}

impl StagedCommit {
    pub fn pack_id(&self) -> u16 {
        self.session.pack_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Install every plant, then the pack index if all plants went in.
    /// Per-plant failures are counted, not returned.
    pub fn install(&self, store: &PackStore) -> CommitSummary {
        let session = &self.session;
        let mut summary = CommitSummary {
            pack_id: session.pack_id,
            ..CommitSummary::default()
        };
        let mut plant_ids = Vec::with_capacity(usize::from(session.plant_count));
        for record in PlantRecords::new(&self.payload) {
            let plant = match record {
                Ok(p) => p,
                Err(e) => {
                    warn!(pack_id = session.pack_id, "transfer: undecodable plant: {e}");
                    summary.errors += 1;
                    continue;
                }
            };
            if plant.pack_id != session.pack_id {
                warn!(
                    plant_id = plant.plant_id,
                    plant_pack = plant.pack_id,
                    pack_id = session.pack_id,
                    "transfer: plant belongs to another pack"
                );
                summary.errors += 1;
                continue;
            }
            match store.install_plant(&plant) {
                Ok(InstallOutcome::Updated) => summary.updated += 1,
                Ok(InstallOutcome::AlreadyCurrent) => summary.already_current += 1,
                Err(e) => {
                    warn!(plant_id = plant.plant_id, "transfer: install failed: {e}");
                    summary.errors += 1;
                    continue;
                }
            }
            plant_ids.push(plant.plant_id);
        }

        if summary.errors == 0 {
            let pack = PackRecord {
                pack_id: session.pack_id,
                version: session.version,
                name: session.name,
                plant_ids,
            };
            match store.install_pack(&pack, &[]) {
                Ok(_) => summary.pack_written = true,
                Err(e) => {
                    warn!(pack_id = pack.pack_id, "transfer: pack index write failed: {e}");
                    summary.errors += 1;
                }
            }
        }
        summary
    }
}

impl Drop for StagedCommit {
    fn drop(&mut self) {
        self.payload.fill(0);
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

pub struct TransferReceiver {
    staging: Vec<u8>,
    capacity: usize,
    max_plants: u16,
    timeout: Duration,
    state: TransferState,
    session: Option<StartRequest>,
    bytes_received: u32,
    last_activity: Option<Instant>,
    last_error: PackResult,
    /// Bumped whenever a session begins or is dropped.
    generation: u64,
    committing: bool,
}

impl TransferReceiver {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            staging: Vec::with_capacity(config.staging_capacity),
            capacity: config.staging_capacity,
            max_plants: config.max_plants_per_pack,
            timeout: Duration::from_secs(config.timeout_secs),
            state: TransferState::Idle,
            session: None,
            bytes_received: 0,
            last_activity: None,
            last_error: PackResult::Success,
            generation: 0,
            committing: false,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    /// Staged bytes are out being installed.
    pub fn is_committing(&self) -> bool {
        self.committing
    }

    pub fn status(&self) -> TransferStatus {
        let expected = self.session.as_ref().map_or(0, |s| s.total_size);
        let progress_pct = match self.state {
            TransferState::Complete => 100,
            _ if expected == 0 => 0,
            _ => (u64::from(self.bytes_received) * 100 / u64::from(expected)) as u8,
        };
        TransferStatus {
            state: self.state,
            progress_pct,
            pack_id: self.session.as_ref().map_or(0, |s| s.pack_id),
            bytes_received: self.bytes_received,
            bytes_expected: expected,
            last_error: self.last_error,
        }
    }

    pub fn start(&mut self, req: StartRequest, now: Instant) -> Result<(), TransferError> {
        if self.committing {
            return Err(TransferError::Busy);
        }
        if self.state == TransferState::Receiving {
            warn!(
                pack_id = self.session.as_ref().map_or(0, |s| s.pack_id),
                "transfer: new START aborts the running session"
            );
            self.reset();
        }
        if let Err(reason) = self.check_start(&req) {
            warn!(pack_id = req.pack_id, "transfer: START rejected: {reason}");
            self.last_error = PackResult::InvalidData;
            return Err(TransferError::Rejected(reason));
        }

        self.clear_staging();
        self.staging.reserve(req.total_size as usize);
        self.generation = self.generation.wrapping_add(1);
        info!(
            pack_id = req.pack_id,
            version = req.version,
            plants = req.plant_count,
            size = req.total_size,
            name = %req.name,
            "transfer: started"
        );
        self.session = Some(req);
        self.bytes_received = 0;
        self.last_activity = Some(now);
        self.last_error = PackResult::Success;
        self.state = TransferState::Receiving;
        Ok(())
    }

    fn check_start(&self, req: &StartRequest) -> Result<(), String> {
        if req.pack_id == BUILTIN_PACK_ID || req.pack_id == INVALID_ID {
            return Err(format!("pack_id {} is reserved", req.pack_id));
        }
        if req.plant_count == 0 || req.plant_count > self.max_plants {
            return Err(format!(
                "plant_count {} out of range [1, {}]",
                req.plant_count, self.max_plants
            ));
        }
        let expected = u64::from(req.plant_count) * PLANT_RECORD_SIZE as u64;
        if u64::from(req.total_size) != expected {
            return Err(format!(
                "total_size {} does not match {} plants ({expected})",
                req.total_size, req.plant_count
            ));
        }
        if req.total_size as usize > self.capacity {
            return Err(format!(
                "total_size {} exceeds staging capacity {}",
                req.total_size, self.capacity
            ));
        }
        Ok(())
    }

    pub fn data(
        &mut self,
        offset: u32,
        length: u16,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), TransferError> {
        if self.state != TransferState::Receiving {
            return Err(TransferError::InvalidState(self.state));
        }
        if self.committing {
            return Err(TransferError::Busy);
        }
        if let Some(idle) = self.idle_past_timeout(now) {
            self.fail(PackResult::IoError);
            warn!(idle_ms = idle.as_millis() as u64, "transfer: timed out");
            return Err(TransferError::Timeout(idle));
        }
        if offset != self.bytes_received {
            debug!(offset, expected = self.bytes_received, "transfer: out-of-order chunk");
            return Err(TransferError::OutOfOrder {
                expected: self.bytes_received,
                got: offset,
            });
        }
        if usize::from(length) != payload.len() {
            self.fail(PackResult::InvalidData);
            return Err(TransferError::InvalidData(format!(
                "header length {length} but {} payload bytes",
                payload.len()
            )));
        }
        let total = self.session.as_ref().map_or(0, |s| s.total_size);
        let end = u64::from(self.bytes_received) + u64::from(length);
        if end > u64::from(total) {
            self.fail(PackResult::InvalidData);
            return Err(TransferError::InvalidData(format!(
                "chunk ends at {end}, past total_size {total}"
            )));
        }

        self.staging.extend_from_slice(payload);
        self.bytes_received = end as u32;
        self.last_activity = Some(now);
        debug!(offset, len = length, received = self.bytes_received, total, "transfer: chunk");
        Ok(())
    }

    /// Check length and CRC, then hand the staged bytes out for installing.
    /// The session stays `RECEIVING` until `finish_commit`.
    pub fn take_commit(&mut self) -> Result<StagedCommit, TransferError> {
        if self.state != TransferState::Receiving {
            return Err(TransferError::InvalidState(self.state));
        }
        if self.committing {
            return Err(TransferError::Busy);
        }
        let Some(session) = self.session.clone() else {
            return Err(TransferError::InvalidState(self.state));
        };
        if self.bytes_received != session.total_size {
            self.fail(PackResult::InvalidData);
            return Err(TransferError::InvalidData(format!(
                "commit after {} of {} bytes",
                self.bytes_received, session.total_size
            )));
        }
        let computed = crc32(&self.staging);
        if computed != session.crc32 {
            self.fail(PackResult::CrcMismatch);
            warn!(
                pack_id = session.pack_id,
                expected = session.crc32,
                computed,
                "transfer: crc mismatch"
            );
            return Err(TransferError::CrcMismatch {
                expected: session.crc32,
                computed,
            });
        }

        self.committing = true;
        Ok(StagedCommit {
            session,
            payload: std::mem::take(&mut self.staging),
            generation: self.generation,
        })
    }

    /// Settle the commit handed out under `generation`. `None` means the
    /// install never finished. Returns `false` if the session was aborted
    /// or replaced in the meantime.
    pub fn finish_commit(&mut self, generation: u64, summary: Option<&CommitSummary>) -> bool {
        if !self.committing || generation != self.generation {
            debug!(generation, "transfer: result for a dropped session ignored");
            return false;
        }
        self.committing = false;
        match summary {
            Some(s) if s.errors == 0 => {
                self.state = TransferState::Complete;
                self.last_error = PackResult::Success;
            }
            _ => self.fail(PackResult::IoError),
        }
        if let Some(s) = summary {
            info!(
                pack_id = s.pack_id,
                updated = s.updated,
                already_current = s.already_current,
                errors = s.errors,
                "transfer: committed"
            );
        }
        true
    }

    /// All three commit phases in one call, for a receiver with a single
    /// owner.
    pub fn commit(&mut self, store: &PackStore) -> Result<CommitSummary, TransferError> {
        let staged = self.take_commit()?;
        let summary = staged.install(store);
        self.finish_commit(staged.generation(), Some(&summary));
        Ok(summary)
    }

    pub fn abort(&mut self) {
        info!(state = ?self.state, "transfer: aborted by client");
        self.reset();
    }

    /// Move a stalled session to `ERROR`. Returns `true` if it did.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.state != TransferState::Receiving {
            return false;
        }
        if self.committing {
            return false;
        }
        match self.idle_past_timeout(now) {
            Some(idle) => {
                warn!(idle_ms = idle.as_millis() as u64, "transfer: session expired");
                self.fail(PackResult::IoError);
                true
            }
            None => false,
        }
    }

    fn idle_past_timeout(&self, now: Instant) -> Option<Duration> {
        let idle = now.saturating_duration_since(self.last_activity?);
        (idle > self.timeout).then_some(idle)
    }

    fn fail(&mut self, code: PackResult) {
        self.state = TransferState::Error;
        self.last_error = code;
    }

    fn clear_staging(&mut self) {
        self.staging.fill(0);
        self.staging.clear();
    }

    fn reset(&mut self) {
        self.clear_staging();
        self.generation = self.generation.wrapping_add(1);
        self.committing = false;
        self.state = TransferState::Idle;
        self.session = None;
        self.bytes_received = 0;
        self.last_activity = None;
        self.last_error = PackResult::Success;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
