//! Observability collaborator for store operations.
//!
//! Every `read_state`/`write_state` call produces exactly one
//! [`StoreEvent`] and hands it to the [`StoreObserver`] the store was built
//! with. Stores never log their outcome through a global; the observer is
//! an explicit constructor argument so tests can substitute a
//! [`CapturingObserver`].

use core::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sous_types::State;

use crate::error::{StoreError, StoreResult};

/// Shared handle to an observer.
pub type SharedObserver = Arc<dyn StoreObserver>;

/// Which half of the store contract an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A `read_state` call.
    Read,
    /// A `write_state` call.
    Write,
}

impl Direction {
    /// Lowercase name used in log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Name of the store that handled the call.
    pub store: &'static str,
    /// Read or write.
    pub direction: Direction,
    /// Wall-clock start of the call.
    pub started_at: DateTime<Utc>,
    /// How long the call took.
    pub elapsed: Duration,
    /// Deployments in the State read or written. Zero when the call failed
    /// before a State existed.
    pub deployments: usize,
    /// Rendered error, if the call failed.
    pub error: Option<String>,
}

impl StoreEvent {
    /// A successful event that took no time. Used by stores that do no I/O.
    pub fn instant(store: &'static str, direction: Direction, deployments: usize) -> Self {
        Self {
            store,
            direction,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            deployments,
            error: None,
        }
    }

    /// Whether the call succeeded.
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Measures one store call and turns its outcome into a [`StoreEvent`].
#[derive(Debug)]
pub struct Stopwatch {
    store: &'static str,
    direction: Direction,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl Stopwatch {
    /// Start timing a call.
    pub fn start(store: &'static str, direction: Direction) -> Self {
        Self {
            store,
            direction,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    /// Stop timing and build the event.
    pub fn finish(self, deployments: usize, error: Option<&StoreError>) -> StoreEvent {
        StoreEvent {
            store: self.store,
            direction: self.direction,
            started_at: self.started_at,
            elapsed: self.start.elapsed(),
            deployments,
            error: error.map(ToString::to_string),
        }
    }

    /// Stop timing a read and report its outcome.
    pub fn report_read(self, observer: &dyn StoreObserver, result: &StoreResult<State>) {
        let event = match result {
            Ok(state) => self.finish(state.deployment_count(), None),
            Err(error) => self.finish(0, Some(error)),
        };
        observer.report(&event);
    }

    /// Stop timing a write of `state` and report its outcome.
    pub fn report_write(
        self,
        observer: &dyn StoreObserver,
        state: &State,
        result: &StoreResult<()>,
    ) {
        let event = self.finish(state.deployment_count(), result.as_ref().err());
        observer.report(&event);
    }
}

/// Receives one event per store call.
pub trait StoreObserver: Send + Sync {
    /// Record an event. Must not block for long; it runs on the caller's task.
    fn report(&self, event: &StoreEvent);
}

// ---------------------------------------------------------------------------
// Tracing observer
// ---------------------------------------------------------------------------

/// Emits every event as a `tracing` event: debug on success, warn on failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TracingObserver {
    /// Shared handle to a tracing observer.
    pub fn shared() -> SharedObserver {
        Arc::new(Self)
    }
}

impl StoreObserver for TracingObserver {
    fn report(&self, event: &StoreEvent) {
        let elapsed_ms = u64::try_from(event.elapsed.as_millis()).unwrap_or(u64::MAX);
        match &event.error {
            None => tracing::debug!(
                store = event.store,
                direction = event.direction.as_str(),
                elapsed_ms,
                deployments = event.deployments,
                "State store call succeeded"
            ),
            Some(error) => tracing::warn!(
                store = event.store,
                direction = event.direction.as_str(),
                elapsed_ms,
                deployments = event.deployments,
                error = %error,
                "State store call failed"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Capturing observer
// ---------------------------------------------------------------------------

/// Keeps every event in memory, for assertions in tests and tooling.
#[derive(Debug, Default)]
pub struct CapturingObserver {
    events: Mutex<Vec<StoreEvent>>,
}

impl CapturingObserver {
    /// An observer with no recorded events.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded events that carry an error.
    pub fn failures(&self) -> Vec<StoreEvent> {
        self.events()
            .into_iter()
            .filter(|e| !e.is_success())
            .collect()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl StoreObserver for CapturingObserver {
    fn report(&self, event: &StoreEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
