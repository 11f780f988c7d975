//! Attribute endpoints: each client write is parsed from its wire frame,
//! dispatched to the pack store, streamer, transfer receiver or history
//! store, and answered through a readable value and/or a notification.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{StreamConfig, TransferConfig, MAX_STREAM_BATCH};
use crate::error::{HistoryError, PackResult, StoreError};
use crate::history::bucket::Granularity;
use crate::history::reset_log::{ResetGroup, ResetLog};
use crate::history::sources::Clock;
use crate::history::store::{record_size, HistoryStore};
use crate::pack::store::PackStore;
use crate::pack::streamer::{list_page, PlantStreamer, StreamReport};
use crate::pack::transfer::{TransferError, TransferReceiver, TransferState};
use crate::state::SharedState;
use crate::transport::{Endpoint, Notifier};
use crate::wire::{
    self, HistoryCommand, HistoryRequest, HistoryResponse, HistoryStatus, OpResult, PackRequest,
    PlantOp, PlantRequest, TransferCommand, WireError, HISTORY_MAX_DATA, MAX_PACK_LIST_ENTRIES,
    STREAM_COMPLETE, STREAM_NORMAL,
};

/// Largest `max_records` a history query may ask for; 0 also means this.
pub const HISTORY_MAX_RECORDS: usize = 100;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("malformed write: {0}")]
    Malformed(#[from] WireError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),

    #[error("history: {0}")]
    History(#[from] HistoryError),

    #[error("store task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EndpointError {
    pub fn result_code(&self) -> PackResult {
        match self {
            Self::Malformed(e) => e.result_code(),
            Self::Store(e) => e.result_code(),
            Self::Transfer(e) => e.result_code(),
            Self::History(_) | Self::Task(_) => PackResult::IoError,
        }
    }
}

/// What a plant-endpoint write started.
#[derive(Debug)]
pub enum PlantAck {
    /// Answered synchronously; read the endpoint for the reply.
    Done,
    /// A pushed stream is running; resolves once it ends.
    Streaming(JoinHandle<Option<StreamReport>>),
}

pub struct AttributeServer {
    store: Arc<PackStore>,
    notifier: Arc<dyn Notifier>,
    streamer: PlantStreamer,
    transfer: Mutex<TransferReceiver>,
    history: Arc<AsyncMutex<HistoryStore>>,
    reset_log: Arc<AsyncMutex<ResetLog>>,
    clock: Arc<dyn Clock>,
    state: SharedState,
    plant_value: Mutex<Vec<u8>>,
    pack_value: Mutex<Vec<u8>>,
    history_value: Mutex<Vec<u8>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result, whether to notify, and the event to record.
type TransferStep = (Result<(), EndpointError>, bool, Option<String>);

/// DATA and COMMIT notify on success and on errors that ended the session.
fn settle(result: Result<(), TransferError>, detail: Option<String>) -> TransferStep {
    match result {
        Ok(()) => (Ok(()), true, detail),
        Err(e) if e.is_terminal() => {
            let detail = format!("failed: {e}");
            (Err(e.into()), true, Some(detail))
        }
        Err(e) => (Err(e.into()), false, None),
    }
}

fn pack_list_frame(store: &PackStore, offset: u16) -> Result<Vec<u8>, StoreError> {
    let packs = store.list_packs(usize::from(offset), MAX_PACK_LIST_ENTRIES)?;
    let total = store.get_pack_count().saturating_add(1);
    Ok(wire::encode_pack_list(total, &packs))
}

impl AttributeServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PackStore>,
        notifier: Arc<dyn Notifier>,
        history: Arc<AsyncMutex<HistoryStore>>,
        reset_log: Arc<AsyncMutex<ResetLog>>,
        clock: Arc<dyn Clock>,
        state: SharedState,
        stream: StreamConfig,
        transfer: &TransferConfig,
    ) -> Self {
        Self {
            streamer: PlantStreamer::new(Arc::clone(&store), Arc::clone(&notifier), stream),
            store,
            notifier,
            transfer: Mutex::new(TransferReceiver::new(transfer)),
            history,
            reset_log,
            clock,
            state,
            plant_value: Mutex::new(Vec::new()),
            pack_value: Mutex::new(Vec::new()),
            history_value: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<PackStore> {
        &self.store
    }

    pub fn describe(&self) {
        info!(
            plants = self.store.get_plant_count(),
            packs = self.store.get_pack_count(),
            "endpoint: attribute server ready"
        );
    }

    /// Run a pack-store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, EndpointError>
    where
        F: FnOnce(&PackStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    fn notify(&self, endpoint: Endpoint, payload: &[u8]) {
        if let Err(e) = self.notifier.notify(endpoint, payload) {
            debug!(%endpoint, "endpoint: notification dropped: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Plant endpoint
    // -----------------------------------------------------------------------

    pub async fn write_plant(&self, bytes: &[u8]) -> Result<PlantAck, EndpointError> {
        match PlantRequest::parse(bytes)? {
            PlantRequest::List {
                offset,
                max_count: 0,
                filter,
            } => {
                if offset != 0 {
                    debug!(offset, "endpoint: stream ignores the list offset");
                }
                let handle = self.streamer.start(filter);
                let state = Arc::clone(&self.state);
                let watcher = tokio::spawn(async move {
                    let report = handle.await.ok()?;
                    state.write().await.record_stream(report.clone());
                    Some(report)
                });
                Ok(PlantAck::Streaming(watcher))
            }
            PlantRequest::List {
                offset,
                max_count,
                filter,
            } => {
                let max = usize::from(max_count.min(MAX_STREAM_BATCH));
                let page = self
                    .blocking(move |store| list_page(store, filter, usize::from(offset), max))
                    .await?;
                let end = usize::from(offset) + page.entries.len();
                let flags = if end >= usize::from(page.total) {
                    STREAM_COMPLETE
                } else {
                    STREAM_NORMAL
                };
                *lock(&self.plant_value) = wire::encode_list_frame(page.total, flags, &page.entries);
                Ok(PlantAck::Done)
            }
            PlantRequest::Delete { plant_id } => {
                let result = match self.blocking(move |store| store.delete_plant(plant_id)).await {
                    Ok(()) => PackResult::Success,
                    Err(e) => {
                        warn!(plant_id, "endpoint: delete failed: {e}");
                        e.result_code()
                    }
                };
                self.finish_plant_op(OpResult {
                    op: PlantOp::Delete,
                    result,
                    plant_id,
                    version: 0,
                })
                .await;
                Ok(PlantAck::Done)
            }
            PlantRequest::Install(record) => {
                let (plant_id, version) = (record.plant_id, record.version);
                let result = match self.blocking(move |store| store.install_plant(&record)).await {
                    Ok(outcome) => outcome.result_code(),
                    Err(e) => {
                        warn!(plant_id, "endpoint: install failed: {e}");
                        e.result_code()
                    }
                };
                self.finish_plant_op(OpResult {
                    op: PlantOp::Install,
                    result,
                    plant_id,
                    version,
                })
                .await;
                Ok(PlantAck::Done)
            }
        }
    }

    async fn finish_plant_op(&self, op: OpResult) {
        let frame = op.encode();
        *lock(&self.plant_value) = frame.to_vec();
        self.notify(Endpoint::Plant, &frame);
        if matches!(op.result, PackResult::Success | PackResult::Updated) {
            self.state
                .write()
                .await
                .record_store(format!("{:?} plant {} ({:?})", op.op, op.plant_id, op.result));
        }
    }

    pub fn read_plant(&self) -> Vec<u8> {
        lock(&self.plant_value).clone()
    }

    pub fn cancel_stream(&self) {
        self.streamer.cancel();
    }

    // -----------------------------------------------------------------------
    // Stats endpoint
    // -----------------------------------------------------------------------

    pub async fn read_stats(&self) -> Result<Vec<u8>, EndpointError> {
        let stats = self.blocking(|store| store.get_stats()).await?;
        let frame = wire::encode_stats(&stats);
        self.state.write().await.store = Some(stats);
        Ok(frame.to_vec())
    }

    // -----------------------------------------------------------------------
    // Pack endpoint
    // -----------------------------------------------------------------------

    pub async fn write_pack(&self, bytes: &[u8]) -> Result<(), EndpointError> {
        let frame = match PackRequest::parse(bytes)? {
            PackRequest::List { offset } => {
                self.blocking(move |store| pack_list_frame(store, offset)).await?
            }
            PackRequest::Content { pack_id, offset } => {
                let pack = self.blocking(move |store| store.get_pack(pack_id)).await?;
                wire::encode_pack_content(&pack, offset)
            }
        };
        *lock(&self.pack_value) = frame;
        Ok(())
    }

    /// Last prepared reply, or the first list page if nothing was asked yet.
    pub async fn read_pack(&self) -> Result<Vec<u8>, EndpointError> {
        let value = lock(&self.pack_value).clone();
        if value.is_empty() {
            return self.blocking(|store| pack_list_frame(store, 0)).await;
        }
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Transfer endpoint
    // -----------------------------------------------------------------------

    /// The receiver lock is only taken for state changes; COMMIT installs
    /// the staged plants without it.
    pub async fn write_transfer(&self, bytes: &[u8]) -> Result<(), EndpointError> {
        let command = TransferCommand::parse(bytes)?;
        let now = Instant::now();
        let (outcome, notify, detail) = match command {
            TransferCommand::Start(req) => {
                let pack_id = req.pack_id;
                let r = lock(&self.transfer).start(req, now);
                let detail = r.is_ok().then(|| format!("pack {pack_id}: receiving"));
                (r.map_err(EndpointError::from), false, detail)
            }
            TransferCommand::Data {
                offset,
                length,
                payload,
            } => {
                let r = lock(&self.transfer).data(offset, length, payload, now);
                settle(r, None)
            }
            TransferCommand::Commit => self.commit_transfer().await,
            TransferCommand::Abort => {
                lock(&self.transfer).abort();
                (Ok(()), true, Some("aborted".to_string()))
            }
            TransferCommand::Status => (Ok(()), false, None),
        };
        self.after_transfer(notify, detail).await;
        outcome
    }

    async fn commit_transfer(&self) -> TransferStep {
        let taken = lock(&self.transfer).take_commit();
        let staged = match taken {
            Ok(staged) => staged,
            Err(e) => return settle(Err(e), None),
        };
        let generation = staged.generation();
        let store = Arc::clone(&self.store);
        let installed = tokio::task::spawn_blocking(move || staged.install(&store)).await;

        let current = lock(&self.transfer).finish_commit(generation, installed.as_ref().ok());
        if !current {
            return (Ok(()), false, None);
        }
        match installed {
            Ok(summary) => {
                let detail = format!(
                    "pack {}: committed ({} updated, {} current)",
                    summary.pack_id, summary.updated, summary.already_current
                );
                (Ok(()), true, Some(detail))
            }
            Err(e) => {
                warn!("endpoint: commit install did not finish: {e}");
                let detail = format!("failed: {e}");
                (Err(e.into()), true, Some(detail))
            }
        }
    }

    async fn after_transfer(&self, notify: bool, detail: Option<String>) {
        let status = lock(&self.transfer).status();
        if notify {
            self.notify(Endpoint::Transfer, &wire::encode_transfer_status(&status));
        }
        if let Some(detail) = detail {
            self.state.write().await.record_transfer(status, detail);
        }
    }

    pub fn read_transfer(&self) -> Vec<u8> {
        wire::encode_transfer_status(&lock(&self.transfer).status()).to_vec()
    }

    pub fn transfer_state(&self) -> TransferState {
        lock(&self.transfer).state()
    }

    /// Expire a stalled upload. Returns `true` when the session moved to
    /// `ERROR`.
    pub async fn poll_transfer_timeout(&self, now: Instant) -> bool {
        let expired = lock(&self.transfer).poll_timeout(now);
        if expired {
            self.after_transfer(true, Some("timed out".to_string()))
                .await;
        }
        expired
    }

    // -----------------------------------------------------------------------
    // History endpoint
    // -----------------------------------------------------------------------

    pub async fn write_history(&self, bytes: &[u8]) -> Result<(), EndpointError> {
        let req = HistoryRequest::parse(bytes)?;
        let response = match req.command {
            HistoryCommand::Clear => self.clear_history(req.granularity).await,
            HistoryCommand::Query => self.query_history(&req).await,
        };
        let frame = response.encode();
        *lock(&self.history_value) = frame.clone();
        self.notify(Endpoint::History, &frame);
        Ok(())
    }

    async fn clear_history(&self, granularity: u8) -> HistoryResponse {
        let result = self.history.lock().await.reset_all();
        if let Err(e) = result {
            warn!("endpoint: history clear failed: {e}");
            return HistoryResponse::status_only(HistoryStatus::Storage, granularity);
        }

        let now = self.clock.now_epoch_utc();
        let mut log = self.reset_log.lock().await;
        for channel in 0..log.channels() {
            if let Err(e) = log.record(channel, ResetGroup::All, "History cleared", now) {
                warn!(channel, "endpoint: reset log not updated: {e}");
            }
        }
        drop(log);
        self.state
            .write()
            .await
            .record_history("history cleared".to_string());
        HistoryResponse::status_only(HistoryStatus::Ok, granularity)
    }

    async fn query_history(&self, req: &HistoryRequest) -> HistoryResponse {
        let Some(g) = Granularity::from_code(req.granularity) else {
            return HistoryResponse::status_only(HistoryStatus::BadType, req.granularity);
        };
        if req.start > req.end {
            return HistoryResponse::status_only(HistoryStatus::BadRange, req.granularity);
        }
        let max = match usize::from(req.max_records) {
            0 => HISTORY_MAX_RECORDS,
            n => n.min(HISTORY_MAX_RECORDS),
        };

        let records = match self.history.lock().await.get_range(g, req.start, req.end, max) {
            Ok(records) => records,
            Err(e) => {
                warn!(granularity = %g, "endpoint: history query failed: {e}");
                return HistoryResponse::status_only(HistoryStatus::Storage, req.granularity);
            }
        };
        if records.is_empty() {
            return HistoryResponse::status_only(HistoryStatus::NoData, req.granularity);
        }
        fragment(&records.encode(), record_size(g), req)
    }

    pub fn read_history(&self) -> Vec<u8> {
        lock(&self.history_value).clone()
    }
}

/// Slice packed records into whole-record fragments and answer the one the
/// client asked for.
fn fragment(data: &[u8], size: usize, req: &HistoryRequest) -> HistoryResponse {
    let per_fragment = (HISTORY_MAX_DATA / size).max(1);
    let records = data.len() / size;
    let total = records.div_ceil(per_fragment);
    let frag = usize::from(req.fragment_id);
    if frag >= total || total > usize::from(u8::MAX) {
        let mut resp = HistoryResponse::status_only(HistoryStatus::BadRange, req.granularity);
        resp.fragment_id = req.fragment_id;
        resp.total_fragments = total.min(usize::from(u8::MAX)) as u8;
        return resp;
    }
    let first = frag * per_fragment;
    let count = per_fragment.min(records - first);
    HistoryResponse {
        status: HistoryStatus::Ok,
        granularity: req.granularity,
        record_count: count as u8,
        fragment_id: req.fragment_id,
        total_fragments: total as u8,
        data: data[first * size..(first + count) * size].to_vec(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
