use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::history::aggregator::{AggregationStatus, TickReport};
use crate::history::store::HistoryStats;
use crate::pack::store::StoreStats;
use crate::pack::streamer::StreamReport;
use crate::pack::transfer::TransferStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub store: Option<StoreStats>,
    pub history: Option<HistoryStats>,
    pub aggregation: Option<AggregationStatus>,
    pub transfer: Option<TransferStatus>,
    pub last_stream: Option<StreamReport>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Store,
    Transfer,
    Stream,
    History,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub store: Option<StoreStats>,
    pub history: Option<HistoryStats>,
    pub aggregation: Option<AggregationStatus>,
    pub transfer: Option<TransferStatus>,
    pub last_stream: Option<StreamReport>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            store: None,
            history: None,
            aggregation: None,
            transfer: None,
            last_stream: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a plant or pack mutation.
    pub fn record_store(&mut self, detail: String) {
        self.push_event(EventKind::Store, detail);
    }

    pub fn record_transfer(&mut self, status: TransferStatus, detail: String) {
        self.transfer = Some(status);
        self.push_event(EventKind::Transfer, detail);
    }

    pub fn record_stream(&mut self, report: StreamReport) {
        let detail = format!(
            "stream {:?} {:?}: {} frame(s), {} retr{}",
            report.filter,
            report.state,
            report.frames_sent,
            report.retries,
            if report.retries == 1 { "y" } else { "ies" }
        );
        self.last_stream = Some(report);
        self.push_event(EventKind::Stream, detail);
    }

    /// Record an aggregation tick; ticks that added nothing only refresh
    /// the snapshot.
    pub fn record_tick(&mut self, report: &TickReport, stats: HistoryStats, status: AggregationStatus) {
        self.history = Some(stats);
        self.aggregation = Some(status);
        if report.added_any() {
            self.push_event(
                EventKind::History,
                format!(
                    "tick {}: +{} hourly, daily {}, monthly {}",
                    report.now, report.hourly_added, report.daily_added, report.monthly_added
                ),
            );
        }
    }

    pub fn record_history(&mut self, detail: String) {
        self.push_event(EventKind::History, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            store: self.store.clone(),
            history: self.history,
            aggregation: self.aggregation,
            transfer: self.transfer.clone(),
            last_stream: self.last_stream.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ring_is_bounded_and_newest_first() {
        let mut state = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            state.record_system(format!("e{i}"));
        }
        assert_eq!(state.events.len(), MAX_EVENTS);
        let status = state.to_status();
        assert_eq!(status.events[0].detail, format!("e{}", MAX_EVENTS + 4));
        assert_eq!(status.events.last().unwrap().detail, "e5");
    }

    #[test]
    fn quiet_tick_adds_no_event() {
        let mut state = SystemState::new();
        let status = AggregationStatus {
            stamps: Default::default(),
            pending: Default::default(),
            error_count: 0,
        };
        state.record_tick(&TickReport::default(), HistoryStats::default(), status);
        assert!(state.events.is_empty());
        assert!(state.history.is_some());

        let busy = TickReport {
            now: 7200,
            hourly_added: 1,
            ..Default::default()
        };
        state.record_tick(&busy, HistoryStats::default(), status);
        assert_eq!(state.events.len(), 1);
        assert_eq!(state.events[0].kind, EventKind::History);
    }
}
