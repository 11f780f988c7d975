//! Flow-controlled plant-list streaming.
//!
//! A [`StreamSession`] is the pure cursor state: it assembles the next batch
//! and can be rewound to resend it. [`PlantStreamer`] drives a session on a
//! tokio task, pacing frames and backing off when the notification buffer
//! is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::record::{PlantListEntry, PlantSource};
use super::store::PackStore;
use crate::config::StreamConfig;
use crate::error::StoreError;
use crate::transport::{Endpoint, Notifier, NotifyError};
use crate::wire::{self, STREAM_COMPLETE, STREAM_ERROR, STREAM_STARTING};

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Which plants a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFilter {
    /// Flash plants that are not mirrors of the ROM catalog.
    CustomOnly,
    /// ROM catalog first, then [`CustomOnly`](Self::CustomOnly).
    All,
    BuiltinOnly,
    /// Flash plants installed by one pack.
    Pack(u16),
}

impl ListFilter {
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0xFF => Self::CustomOnly,
            0xFE => Self::All,
            0x00 => Self::BuiltinOnly,
            id => Self::Pack(u16::from(id)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::CustomOnly => 0xFF,
            Self::All => 0xFE,
            Self::BuiltinOnly => 0x00,
            Self::Pack(id) => u8::try_from(id).unwrap_or(0xFD),
        }
    }

    fn includes_builtin(self) -> bool {
        matches!(self, Self::All | Self::BuiltinOnly)
    }

    fn includes_flash(self) -> bool {
        !matches!(self, Self::BuiltinOnly)
    }

    /// Whether a flash entry belongs to this filter.
    fn keeps(self, entry: &PlantListEntry) -> bool {
        match self {
            Self::CustomOnly | Self::All => entry.source != PlantSource::Builtin,
            Self::Pack(id) => entry.pack_id == id,
            Self::BuiltinOnly => false,
        }
    }
}

fn clamp_u16(n: usize) -> u16 {
    n.min(usize::from(u16::MAX)) as u16
}

fn counts(store: &PackStore, filter: ListFilter) -> Result<(u16, usize), StoreError> {
    let builtin = if filter.includes_builtin() {
        store.catalog().len()
    } else {
        0
    };
    let flash = if filter.includes_flash() {
        store.count_plants_where(|e| filter.keeps(e))?
    } else {
        0
    };
    Ok((builtin, flash))
}

/// One page of a listing, built-ins first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    pub total: u16,
    pub entries: Vec<PlantListEntry>,
}

/// Read-snapshot listing used by the paginated request mode.
pub fn list_page(
    store: &PackStore,
    filter: ListFilter,
    offset: usize,
    max: usize,
) -> Result<ListPage, StoreError> {
    if max == 0 {
        return Err(StoreError::invalid("page size must be at least 1"));
    }
    let (builtin_total, flash_total) = counts(store, filter)?;
    let builtin_total = usize::from(builtin_total);

    let mut entries: Vec<PlantListEntry> = (offset..builtin_total)
        .take(max)
        .filter_map(|i| store.catalog().list_entry(i as u16 + 1))
        .collect();
    if entries.len() < max && filter.includes_flash() {
        let flash_offset = offset.saturating_sub(builtin_total);
        entries.extend(store.list_plants_where(flash_offset, max - entries.len(), |e| {
            filter.keeps(e)
        })?);
    }
    Ok(ListPage {
        total: clamp_u16(builtin_total + flash_total),
        entries,
    })
}

// ---------------------------------------------------------------------------
// Back-off
// ---------------------------------------------------------------------------

/// Finite back-off schedule; `None` once the retry budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    steps: Arc<[u64]>,
    next: usize,
}

impl Backoff {
    pub fn new(steps_ms: &[u64]) -> Self {
        Self {
            steps: steps_ms.into(),
            next: 0,
        }
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn retries_used(&self) -> usize {
        self.next
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let ms = *self.steps.get(self.next)?;
        self.next += 1;
        Some(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Active,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    builtin_sent: u16,
    custom_sent: usize,
    flash_exhausted: bool,
}

/// A frame ready to send, plus the cursor position it was drawn from.
#[derive(Debug, Clone)]
pub struct Batch {
    pub entries: Vec<PlantListEntry>,
    pub flags: u8,
    pub frame: Vec<u8>,
    before: Cursor,
    last: bool,
}

impl Batch {
    pub fn is_last(&self) -> bool {
        self.last
    }
}

pub struct StreamSession {
    filter: ListFilter,
    batch_size: usize,
    builtin_total: u16,
    flash_total: usize,
    cursor: Cursor,
    /// A frame has been delivered; clears `STARTING`.
    started: bool,
    state: StreamState,
}

impl StreamSession {
    pub fn new(store: &PackStore, filter: ListFilter, batch_size: u8) -> Result<Self, StoreError> {
        let (builtin_total, flash_total) = counts(store, filter)?;
        Ok(Self {
            filter,
            batch_size: usize::from(batch_size.max(1)),
            builtin_total,
            flash_total,
            cursor: Cursor {
                builtin_sent: 0,
                custom_sent: 0,
                flash_exhausted: !filter.includes_flash() || flash_total == 0,
            },
            started: false,
            state: StreamState::Idle,
        })
    }

    pub fn total(&self) -> u16 {
        clamp_u16(usize::from(self.builtin_total) + self.flash_total)
    }

    pub fn builtin_sent(&self) -> u16 {
        self.cursor.builtin_sent
    }

    pub fn custom_sent(&self) -> usize {
        self.cursor.custom_sent
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Assemble the next frame and advance both cursors past it.
    pub fn next_batch(&mut self, store: &PackStore) -> Result<Batch, StoreError> {
        self.state = StreamState::Active;
        let before = self.cursor;
        let mut entries = Vec::with_capacity(self.batch_size);

        while entries.len() < self.batch_size && self.cursor.builtin_sent < self.builtin_total {
            self.cursor.builtin_sent += 1;
            if let Some(e) = store.catalog().list_entry(self.cursor.builtin_sent) {
                entries.push(e);
            }
        }

        let room = self.batch_size - entries.len();
        if room > 0 && !self.cursor.flash_exhausted {
            let filter = self.filter;
            let got = store.list_plants_where(self.cursor.custom_sent, room, |e| filter.keeps(e))?;
            self.cursor.custom_sent += got.len();
            if got.len() < room || self.cursor.custom_sent >= self.flash_total {
                self.cursor.flash_exhausted = true;
            }
            entries.extend(got);
        }

        let last =
            self.cursor.builtin_sent >= self.builtin_total && self.cursor.flash_exhausted;
        let mut flags = 0;
        if !self.started {
            flags |= STREAM_STARTING;
        }
        if last {
            flags |= STREAM_COMPLETE;
        }
        let frame = wire::encode_list_frame(self.total(), flags, &entries);
        Ok(Batch {
            entries,
            flags,
            frame,
            before,
            last,
        })
    }

    /// Put the cursors back where they were before `batch` was drawn.
    pub fn rewind(&mut self, batch: &Batch) {
        self.cursor = batch.before;
    }

    pub fn delivered(&mut self, batch: &Batch) {
        self.started = true;
        if batch.last {
            self.state = StreamState::Done;
        }
    }

    /// The single terminal frame sent when the session gives up.
    pub fn error_frame(&mut self) -> Vec<u8> {
        self.state = StreamState::Done;
        wire::encode_list_frame(self.total(), STREAM_ERROR, &[])
    }

    pub fn abort(&mut self) {
        self.state = StreamState::Aborted;
    }
}

// ---------------------------------------------------------------------------
// Async driver
// ---------------------------------------------------------------------------

/// Summary of a finished streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    pub filter: ListFilter,
    pub state: StreamState,
    pub total: u16,
    pub frames_sent: usize,
    pub retries: usize,
    pub builtin_sent: u16,
    pub custom_sent: usize,
    /// The session ended with an `ERROR` frame.
    pub errored: bool,
}

pub struct PlantStreamer {
    store: Arc<PackStore>,
    notifier: Arc<dyn Notifier>,
    config: StreamConfig,
    active: Mutex<Option<Arc<AtomicBool>>>,
}

impl PlantStreamer {
    pub fn new(store: Arc<PackStore>, notifier: Arc<dyn Notifier>, config: StreamConfig) -> Self {
        Self {
            store,
            notifier,
            config,
            active: Mutex::new(None),
        }
    }

    /// Start a session, cancelling any session still running.
    pub fn start(&self, filter: ListFilter) -> JoinHandle<StreamReport> {
        let token = Arc::new(AtomicBool::new(true));
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&token));
        if let Some(prev) = previous {
            if prev.swap(false, Ordering::SeqCst) {
                debug!("stream: cancelling previous session");
            }
        }

        let run = StreamRun {
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            config: self.config.clone(),
            token,
        };
        tokio::spawn(run.run(filter))
    }

    /// Stop the running session, if any, before its next frame.
    pub fn cancel(&self) {
        if let Some(token) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.store(false, Ordering::SeqCst);
        }
    }
}

struct StreamRun {
    store: Arc<PackStore>,
    notifier: Arc<dyn Notifier>,
    config: StreamConfig,
    token: Arc<AtomicBool>,
}

impl StreamRun {
    fn still_wanted(&self) -> bool {
        self.token.load(Ordering::SeqCst) && self.notifier.is_subscribed(Endpoint::Plant)
    }

    async fn run(self, filter: ListFilter) -> StreamReport {
        let mut report = StreamReport {
            filter,
            state: StreamState::Idle,
            total: 0,
            frames_sent: 0,
            retries: 0,
            builtin_sent: 0,
            custom_sent: 0,
            errored: false,
        };

        let mut session = match StreamSession::new(&self.store, filter, self.config.batch_size) {
            Ok(s) => s,
            Err(e) => {
                warn!(?filter, "stream: cannot size listing: {e}");
                let frame = wire::encode_list_frame(0, STREAM_ERROR, &[]);
                let _ = self.notifier.notify(Endpoint::Plant, &frame);
                report.state = StreamState::Done;
                report.errored = true;
                return report;
            }
        };
        report.total = session.total();
        info!(?filter, total = session.total(), "stream: session started");

        let gap = Duration::from_millis(self.config.frame_gap_ms);
        let mut backoff = Backoff::new(&self.config.backoff_ms);

        'frames: loop {
            if !self.still_wanted() {
                session.abort();
                break;
            }
            let mut batch = match session.next_batch(&self.store) {
                Ok(b) => b,
                Err(e) => {
                    warn!("stream: listing failed: {e}");
                    self.send_error(&mut session, &mut report);
                    break;
                }
            };

            loop {
                match self.notifier.notify(Endpoint::Plant, &batch.frame) {
                    Ok(()) => {
                        session.delivered(&batch);
                        backoff.reset();
                        report.frames_sent += 1;
                        debug!(
                            entries = batch.entries.len(),
                            flags = batch.flags,
                            "stream: frame sent"
                        );
                        break;
                    }
                    Err(NotifyError::NotConnected) => {
                        debug!("stream: peer gone");
                        session.abort();
                        break 'frames;
                    }
                    Err(e) => {
                        session.rewind(&batch);
                        let Some(delay) = backoff.next() else {
                            warn!(retries = backoff.retries_used(), "stream: retry budget spent: {e}");
                            self.send_error(&mut session, &mut report);
                            break 'frames;
                        };
                        report.retries += 1;
                        debug!(delay_ms = delay.as_millis() as u64, "stream: {e}, backing off");
                        tokio::time::sleep(delay).await;
                        if !self.still_wanted() {
                            session.abort();
                            break 'frames;
                        }
                        batch = match session.next_batch(&self.store) {
                            Ok(b) => b,
                            Err(e) => {
                                warn!("stream: listing failed: {e}");
                                self.send_error(&mut session, &mut report);
                                break 'frames;
                            }
                        };
                    }
                }
            }

            if session.state() == StreamState::Done {
                break;
            }
            tokio::time::sleep(gap).await;
        }

        report.state = session.state();
        report.builtin_sent = session.builtin_sent();
        report.custom_sent = session.custom_sent();
        info!(
            state = ?report.state,
            frames = report.frames_sent,
            retries = report.retries,
            "stream: session finished"
        );
        report
    }

    fn send_error(&self, session: &mut StreamSession, report: &mut StreamReport) {
        let frame = session.error_frame();
        if let Err(e) = self.notifier.notify(Endpoint::Plant, &frame) {
            debug!("stream: error frame dropped: {e}");
        }
        report.errored = true;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::catalog::Catalog;
    use crate::pack::record::tests::tomato;
    use crate::transport::LoopbackNotifier;
    use crate::wire::decode_list_frame;
    use tempfile::TempDir;

    fn store_with(builtin: usize) -> (TempDir, Arc<PackStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PackStore::open(dir.path().join("lfs"), Catalog::take(builtin))
            .unwrap()
            .with_partition_bytes(Some(1 << 20));
        (dir, Arc::new(store))
    }

    fn streamer(store: &Arc<PackStore>, notifier: &Arc<LoopbackNotifier>) -> PlantStreamer {
        let n: Arc<dyn Notifier> = notifier.clone();
        PlantStreamer::new(Arc::clone(store), n, StreamConfig::default())
    }

    // -- Filter -------------------------------------------------------------

    #[test]
    fn filter_wire_bytes() {
        assert_eq!(ListFilter::from_wire(0xFF), ListFilter::CustomOnly);
        assert_eq!(ListFilter::from_wire(0xFE), ListFilter::All);
        assert_eq!(ListFilter::from_wire(0x00), ListFilter::BuiltinOnly);
        assert_eq!(ListFilter::from_wire(7), ListFilter::Pack(7));
        assert_eq!(ListFilter::Pack(7).to_wire(), 7);
        assert_eq!(ListFilter::All.to_wire(), 0xFE);
    }

    #[test]
    fn backoff_schedule_is_finite() {
        let mut b = Backoff::new(&StreamConfig::default().backoff_ms);
        let ms: Vec<u128> = b.by_ref().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![10, 20, 40, 80, 160, 320]);
        assert_eq!(b.retries_used(), 6);
        b.reset();
        assert_eq!(b.next(), Some(Duration::from_millis(10)));
    }

    // -- Paginated listing ----------------------------------------------------

    #[tokio::test]
    async fn page_spans_builtin_and_flash() {
        let (_dir, store) = store_with(3);
        store.provision_defaults().await.unwrap();
        store.install_plant(&tomato(100, 0, 1)).unwrap();
        store.install_plant(&tomato(101, 9, 1)).unwrap();

        let page = list_page(&store, ListFilter::All, 0, 10).unwrap();
        assert_eq!(page.total, 5);
        let ids: Vec<u16> = page.entries.iter().map(|e| e.plant_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 100, 101]);

        let page = list_page(&store, ListFilter::All, 2, 2).unwrap();
        let ids: Vec<u16> = page.entries.iter().map(|e| e.plant_id).collect();
        assert_eq!(ids, vec![3, 100]);

        let page = list_page(&store, ListFilter::CustomOnly, 0, 10).unwrap();
        assert_eq!(page.total, 2);

        let page = list_page(&store, ListFilter::Pack(9), 0, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].plant_id, 101);

        let page = list_page(&store, ListFilter::BuiltinOnly, 0, 10).unwrap();
        assert_eq!(page.total, 3);
        assert!(page.entries.iter().all(|e| e.source == PlantSource::Builtin));
    }

    // -- Session --------------------------------------------------------------

    #[tokio::test]
    async fn session_flags_and_cursors() {
        let (_dir, store) = store_with(15);
        let mut s = StreamSession::new(&store, ListFilter::All, 10).unwrap();
        assert_eq!(s.total(), 15);

        let b1 = s.next_batch(&store).unwrap();
        assert_eq!(b1.entries.len(), 10);
        assert_eq!(b1.flags, STREAM_STARTING);
        assert_eq!(b1.frame.len(), 4 + 22 * 10);
        s.delivered(&b1);

        let b2 = s.next_batch(&store).unwrap();
        assert_eq!(b2.entries.len(), 5);
        assert_eq!(b2.flags, STREAM_COMPLETE);
        assert!(b2.is_last());
        s.delivered(&b2);
        assert_eq!(s.state(), StreamState::Done);
        assert_eq!((s.builtin_sent(), s.custom_sent()), (15, 0));
    }

    #[tokio::test]
    async fn rewind_reproduces_identical_frame() {
        let (_dir, store) = store_with(4);
        for id in 200..210 {
            store.install_plant(&tomato(id, 0, 1)).unwrap();
        }
        let mut s = StreamSession::new(&store, ListFilter::All, 10).unwrap();
        let first = s.next_batch(&store).unwrap();
        s.delivered(&first);

        let b = s.next_batch(&store).unwrap();
        let (bs, cs) = (s.builtin_sent(), s.custom_sent());
        s.rewind(&b);
        assert_eq!((s.builtin_sent(), s.custom_sent()), (4, 6));
        let again = s.next_batch(&store).unwrap();
        assert_eq!(again.frame, b.frame);
        assert_eq!((s.builtin_sent(), s.custom_sent()), (bs, cs));
    }

    #[tokio::test]
    async fn empty_listing_is_single_terminal_frame() {
        let (_dir, store) = store_with(0);
        let mut s = StreamSession::new(&store, ListFilter::CustomOnly, 10).unwrap();
        let b = s.next_batch(&store).unwrap();
        assert_eq!(b.flags, STREAM_STARTING | STREAM_COMPLETE);
        assert_eq!(b.frame, vec![0, 0, 0, STREAM_STARTING | STREAM_COMPLETE]);
    }

    // -- Driver ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn retry_resends_same_batch_after_backoff() {
        let (_dir, store) = store_with(15);
        let notifier = Arc::new(LoopbackNotifier::new());
        notifier.fail_attempt(Endpoint::Plant, 2, NotifyError::BufferBusy);

        let report = streamer(&store, &notifier).start(ListFilter::All).await.unwrap();
        assert_eq!(report.state, StreamState::Done);
        assert_eq!(report.frames_sent, 2);
        assert_eq!(report.retries, 1);
        assert_eq!((report.builtin_sent, report.custom_sent), (15, 0));

        let attempts = notifier.attempts(Endpoint::Plant);
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1].payload, attempts[2].payload);
        let waited = attempts[2].at - attempts[1].at;
        assert!(waited >= Duration::from_millis(10), "waited {waited:?}");
        assert!(waited < Duration::from_millis(20), "waited {waited:?}");

        let frames: Vec<_> = notifier
            .delivered(Endpoint::Plant)
            .iter()
            .map(|f| decode_list_frame(f).unwrap())
            .collect();
        assert_eq!(frames[0].flags, STREAM_STARTING);
        assert_eq!(frames[0].entries.len(), 10);
        assert_eq!(frames[1].flags, STREAM_COMPLETE);
        assert_eq!(frames[1].entries.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_flag_survives_failed_first_send() {
        let (_dir, store) = store_with(3);
        let notifier = Arc::new(LoopbackNotifier::new());
        notifier.fail_attempt(Endpoint::Plant, 1, NotifyError::OutOfMemory);

        let report = streamer(&store, &notifier).start(ListFilter::BuiltinOnly).await.unwrap();
        assert_eq!(report.frames_sent, 1);
        let delivered = notifier.delivered(Endpoint::Plant);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][3], STREAM_STARTING | STREAM_COMPLETE);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_emits_one_error_frame() {
        let (_dir, store) = store_with(15);
        let notifier = Arc::new(LoopbackNotifier::new());
        for n in 2..=8 {
            notifier.fail_attempt(Endpoint::Plant, n, NotifyError::BufferBusy);
        }

        let report = streamer(&store, &notifier).start(ListFilter::All).await.unwrap();
        assert!(report.errored);
        assert_eq!(report.retries, 6);
        assert_eq!(report.state, StreamState::Done);

        // 1 good frame, 7 failed attempts, then the error frame.
        let attempts = notifier.attempts(Endpoint::Plant);
        assert_eq!(attempts.len(), 9);
        let last = attempts.last().unwrap();
        assert!(last.result.is_ok());
        assert_eq!(last.payload, vec![15, 0, 0, STREAM_ERROR]);

        let total_wait = attempts[7].at - attempts[1].at;
        assert!(total_wait >= Duration::from_millis(630));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_aborts_without_sending() {
        let (_dir, store) = store_with(15);
        let notifier = Arc::new(LoopbackNotifier::new());
        notifier.set_subscribed(Endpoint::Plant, false);

        let report = streamer(&store, &notifier).start(ListFilter::All).await.unwrap();
        assert_eq!(report.state, StreamState::Aborted);
        assert!(notifier.attempts(Endpoint::Plant).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_aborts() {
        let (_dir, store) = store_with(15);
        let notifier = Arc::new(LoopbackNotifier::new());
        notifier.fail_attempt(Endpoint::Plant, 2, NotifyError::NotConnected);

        let report = streamer(&store, &notifier).start(ListFilter::All).await.unwrap();
        assert_eq!(report.state, StreamState::Aborted);
        assert_eq!(notifier.attempts(Endpoint::Plant).len(), 2);
        assert!(!report.errored);
    }

    #[tokio::test(start_paused = true)]
    async fn new_request_cancels_running_session() {
        let (_dir, store) = store_with(30);
        let notifier = Arc::new(LoopbackNotifier::new());
        let s = streamer(&store, &notifier);

        let first = s.start(ListFilter::All);
        tokio::task::yield_now().await;
        let second = s.start(ListFilter::BuiltinOnly);

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first.state, StreamState::Aborted);
        assert!(first.frames_sent < 3);
        assert_eq!(second.state, StreamState::Done);
        assert_eq!(second.frames_sent, 3);
    }
}
