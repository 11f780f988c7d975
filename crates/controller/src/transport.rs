//! Notification sink for the attribute endpoints.
//!
//! The radio stack is outside this crate; it is represented by [`Notifier`],
//! which either accepts a frame or reports why it could not.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Plant,
    Stats,
    Pack,
    Transfer,
    History,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plant => write!(f, "plant"),
            Self::Stats => write!(f, "stats"),
            Self::Pack => write!(f, "pack"),
            Self::Transfer => write!(f, "transfer"),
            Self::History => write!(f, "history"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification buffer busy")]
    BufferBusy,
    #[error("out of notification memory")]
    OutOfMemory,
    #[error("peer not connected")]
    NotConnected,
}

impl NotifyError {
    /// Worth retrying after a back-off.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::BufferBusy | Self::OutOfMemory)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, endpoint: Endpoint, payload: &[u8]) -> Result<(), NotifyError>;

    /// Whether the peer currently wants notifications from `endpoint`.
    fn is_subscribed(&self, endpoint: Endpoint) -> bool;
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Accepts every frame and logs it. Used when no radio is attached.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, endpoint: Endpoint, payload: &[u8]) -> Result<(), NotifyError> {
        debug!(%endpoint, len = payload.len(), "notify");
        Ok(())
    }

    fn is_subscribed(&self, _endpoint: Endpoint) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Loopback sink
// ---------------------------------------------------------------------------

/// One call to [`Notifier::notify`] as seen by [`LoopbackNotifier`].
#[derive(Debug, Clone)]
pub struct Attempt {
    pub endpoint: Endpoint,
    pub payload: Vec<u8>,
    pub at: Instant,
    pub result: Result<(), NotifyError>,
}

#[derive(Default)]
struct LoopbackState {
    attempts: Vec<Attempt>,
    per_endpoint: HashMap<Endpoint, usize>,
    scripted: HashMap<(Endpoint, usize), NotifyError>,
    always: HashMap<Endpoint, NotifyError>,
    unsubscribed: HashSet<Endpoint>,
}

/// In-process sink that records every attempt and can inject failures.
#[derive(Default)]
pub struct LoopbackNotifier {
    state: Mutex<LoopbackState>,
}

impl LoopbackNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the `n`th (1-based) attempt on `endpoint` with `err`.
    pub fn fail_attempt(&self, endpoint: Endpoint, n: usize, err: NotifyError) {
        self.lock().scripted.insert((endpoint, n), err);
    }

    /// Fail every attempt on `endpoint` until cleared.
    pub fn fail_always(&self, endpoint: Endpoint, err: Option<NotifyError>) {
        let mut st = self.lock();
        match err {
            Some(e) => st.always.insert(endpoint, e),
            None => st.always.remove(&endpoint),
        };
    }

    pub fn set_subscribed(&self, endpoint: Endpoint, subscribed: bool) {
        let mut st = self.lock();
        if subscribed {
            st.unsubscribed.remove(&endpoint);
        } else {
            st.unsubscribed.insert(endpoint);
        }
    }

    pub fn attempts(&self, endpoint: Endpoint) -> Vec<Attempt> {
        self.lock()
            .attempts
            .iter()
            .filter(|a| a.endpoint == endpoint)
            .cloned()
            .collect()
    }

    /// Payloads that were accepted on `endpoint`, in order.
    pub fn delivered(&self, endpoint: Endpoint) -> Vec<Vec<u8>> {
        self.lock()
            .attempts
            .iter()
            .filter(|a| a.endpoint == endpoint && a.result.is_ok())
            .map(|a| a.payload.clone())
            .collect()
    }
}

impl Notifier for LoopbackNotifier {
    fn notify(&self, endpoint: Endpoint, payload: &[u8]) -> Result<(), NotifyError> {
        let mut st = self.lock();
        let n = {
            let count = st.per_endpoint.entry(endpoint).or_insert(0);
            *count += 1;
            *count
        };
        let result = match st.always.get(&endpoint) {
            Some(e) => Err(*e),
            None => st.scripted.remove(&(endpoint, n)).map_or(Ok(()), Err),
        };
        st.attempts.push(Attempt {
            endpoint,
            payload: payload.to_vec(),
            at: Instant::now(),
            result,
        });
        result
    }

    fn is_subscribed(&self, endpoint: Endpoint) -> bool {
        !self.lock().unsubscribed.contains(&endpoint)
    }
}
