//! Load-state tracking and single-flight coordination for one cache.
//!
//! Every cache instance owns a [`CacheCoordinator`]. Bulk loads go through
//! [`CacheCoordinator::begin_load`]: the first caller becomes the leader and
//! receives a [`LoadTicket`]; callers arriving while the load is in flight
//! wait for it and share its outcome instead of issuing the same query.
//! Point lookups and other partial loads take [`CacheCoordinator::lock`],
//! which serializes them with bulk loads.
//!
//! A ticket that is dropped without being completed (the loading future was
//! cancelled, or the load panicked) reverts the state, so no half-loaded
//! cache is ever reported as `Full`.
//!
//! Clearing or editing a cache while a bulk load runs supersedes that load:
//! every such change advances a generation counter, and a ticket taken under
//! an older generation neither publishes its rows nor changes the state.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Load state of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    /// Never queried (or cleared)
    Empty,
    /// A bulk load is in flight
    Loading,
    /// Every object of the owner is cached
    Full,
    /// Only objects resolved by point lookups are cached
    Partial,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Empty => "empty",
            Self::Loading => "loading",
            Self::Full => "full",
            Self::Partial => "partial",
        };
        f.write_str(label)
    }
}

/// Counters describing the work a cache has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Queries executed against the session
    pub queries_issued: u64,
    /// Rows or members skipped because they could not be resolved
    pub rows_skipped: u64,
    /// Bulk loads that completed
    pub loads_completed: u64,
    /// Bulk loads that failed with a query error
    pub loads_failed: u64,
    /// Bulk loads cancelled, dropped or superseded before completion
    pub loads_aborted: u64,
}

#[derive(Debug, Clone)]
enum FlightOutcome {
    Pending,
    Loaded,
    Failed(CacheError),
    Aborted,
}

enum Step {
    Wait(watch::Receiver<FlightOutcome>),
    Lead(watch::Sender<FlightOutcome>),
}

#[derive(Debug)]
struct Inner {
    /// State outside of bulk loads; restored when a load does not complete
    resting: LoadState,
    flight: Option<watch::Receiver<FlightOutcome>>,
    /// Advanced by every change made outside of a bulk load
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queries_issued: AtomicU64,
    rows_skipped: AtomicU64,
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    loads_aborted: AtomicU64,
}

/// Result of [`CacheCoordinator::begin_load`].
#[derive(Debug)]
pub enum LoadEntry<'a> {
    /// The cache is `Full`; serve from memory.
    Ready,
    /// The caller must run the load and finish the ticket.
    Leader(LoadTicket<'a>),
}

/// Per-cache load coordinator.
#[derive(Debug)]
pub struct CacheCoordinator {
    label: String,
    inner: Mutex<Inner>,
    full: AtomicBool,
    guard: tokio::sync::Mutex<()>,
    counters: Counters,
}

impl CacheCoordinator {
    /// Creates a coordinator in the `Empty` state. The label only appears
    /// in log output.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(Inner {
                resting: LoadState::Empty,
                flight: None,
                generation: 0,
            }),
            full: AtomicBool::new(false),
            guard: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Label used in log output.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current load state.
    pub fn state(&self) -> LoadState {
        let inner = self.lock_inner();
        if inner.flight.is_some() {
            LoadState::Loading
        } else {
            inner.resting
        }
    }

    /// Whether the cache is `Full`. Never blocks.
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Enters a bulk load.
    ///
    /// Returns [`LoadEntry::Ready`] when the cache is already `Full`
    /// (possibly after waiting for another caller's load), or a ticket when
    /// this caller has to run the load.
    ///
    /// # Errors
    /// Returns the error of an in-flight load this caller waited on.
    pub async fn begin_load(&self) -> Result<LoadEntry<'_>> {
        loop {
            if self.is_full() {
                return Ok(LoadEntry::Ready);
            }

            let step = {
                let mut inner = self.lock_inner();
                if inner.resting == LoadState::Full {
                    return Ok(LoadEntry::Ready);
                }
                match inner.flight.clone() {
                    Some(rx) => Step::Wait(rx),
                    None => {
                        let (tx, rx) = watch::channel(FlightOutcome::Pending);
                        inner.flight = Some(rx);
                        Step::Lead(tx)
                    }
                }
            };

            match step {
                Step::Lead(tx) => {
                    // Registered before awaiting the guard so that a dropped
                    // caller still releases waiters
                    let mut flight = Flight {
                        coordinator: self,
                        tx: Some(tx),
                        generation: 0,
                    };
                    tracing::debug!("Starting bulk load for {}", self.label);
                    let lock = self.guard.lock().await;
                    // Point lookups finished before this; later changes supersede the load
                    flight.generation = self.lock_inner().generation;
                    return Ok(LoadEntry::Leader(LoadTicket {
                        flight,
                        _lock: lock,
                    }));
                }
                Step::Wait(rx) => {
                    tracing::trace!("Waiting for in-flight load of {}", self.label);
                    if let FlightOutcome::Failed(error) = wait_for_flight(rx).await {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Takes the exclusive guard for a point lookup or partial load, after
    /// any in-flight bulk load has finished.
    pub async fn lock(&self) -> LookupGuard<'_> {
        loop {
            let waiting = self.lock_inner().flight.clone();
            match waiting {
                Some(rx) => {
                    wait_for_flight(rx).await;
                }
                None => {
                    let lock = self.guard.lock().await;
                    return LookupGuard {
                        coordinator: self,
                        _lock: lock,
                    };
                }
            }
        }
    }

    /// Forces the resting state, e.g. after objects were installed by hand.
    ///
    /// A bulk load in flight is superseded: it finishes without publishing,
    /// and the cache keeps `state` once the load is over.
    pub fn set_state(&self, state: LoadState) {
        let state = if state == LoadState::Loading {
            LoadState::Empty
        } else {
            state
        };
        let mut inner = self.lock_inner();
        inner.generation = inner.generation.wrapping_add(1);
        inner.resting = state;
        self.full
            .store(inner.flight.is_none() && state == LoadState::Full, Ordering::Release);
    }

    /// Resets to `Empty`, superseding any bulk load in flight.
    pub fn invalidate(&self) {
        self.set_state(LoadState::Empty);
    }

    /// Supersedes any bulk load in flight without changing the state. Call
    /// it after editing entries outside of a load.
    pub fn supersede(&self) {
        let mut inner = self.lock_inner();
        inner.generation = inner.generation.wrapping_add(1);
    }

    /// Records one executed query.
    pub fn record_query(&self) {
        self.counters.queries_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one skipped row or member.
    pub fn record_skipped(&self) {
        self.counters.rows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            queries_issued: self.counters.queries_issued.load(Ordering::Relaxed),
            rows_skipped: self.counters.rows_skipped.load(Ordering::Relaxed),
            loads_completed: self.counters.loads_completed.load(Ordering::Relaxed),
            loads_failed: self.counters.loads_failed.load(Ordering::Relaxed),
            loads_aborted: self.counters.loads_aborted.load(Ordering::Relaxed),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn wait_for_flight(mut rx: watch::Receiver<FlightOutcome>) -> FlightOutcome {
    match rx
        .wait_for(|outcome| !matches!(outcome, FlightOutcome::Pending))
        .await
    {
        Ok(outcome) => outcome.clone(),
        Err(_) => FlightOutcome::Aborted,
    }
}

#[derive(Debug)]
struct Flight<'a> {
    coordinator: &'a CacheCoordinator,
    tx: Option<watch::Sender<FlightOutcome>>,
    generation: u64,
}

impl Flight<'_> {
    fn is_current(&self) -> bool {
        self.coordinator.lock_inner().generation == self.generation
    }

    /// Ends the flight. A superseded load leaves the state alone and tells
    /// waiters to retry. Returns whether the load was still current.
    fn finish(&mut self, resting: Option<LoadState>, outcome: FlightOutcome) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        let current = {
            let mut inner = self.coordinator.lock_inner();
            let current = inner.generation == self.generation;
            if current && let Some(state) = resting {
                inner.resting = state;
            }
            inner.flight = None;
            self.coordinator
                .full
                .store(inner.resting == LoadState::Full, Ordering::Release);
            current
        };
        tx.send_replace(if current {
            outcome
        } else {
            FlightOutcome::Aborted
        });
        current
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(
                "Load of {} dropped before completion",
                self.coordinator.label
            );
            self.coordinator
                .counters
                .loads_aborted
                .fetch_add(1, Ordering::Relaxed);
            let _ = self.finish(None, FlightOutcome::Aborted);
        }
    }
}

/// Exclusive right to run a bulk load. Finish it with
/// [`complete`](Self::complete) or [`fail`](Self::fail); dropping it
/// reverts the state and lets waiters retry.
#[derive(Debug)]
pub struct LoadTicket<'a> {
    flight: Flight<'a>,
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl LoadTicket<'_> {
    /// The coordinator this ticket belongs to.
    pub fn coordinator(&self) -> &CacheCoordinator {
        self.flight.coordinator
    }

    /// Whether no clear or manual edit happened since the load started.
    /// Publish rows only while this holds, under the same lock the edits
    /// take.
    pub fn is_current(&self) -> bool {
        self.flight.is_current()
    }

    /// Marks the load successful and releases waiters. A superseded load
    /// leaves the state as the clear or edit set it and returns `false`.
    pub fn complete(mut self, state: LoadState) -> bool {
        let coordinator = self.flight.coordinator;
        if self.flight.finish(Some(state), FlightOutcome::Loaded) {
            coordinator
                .counters
                .loads_completed
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Load of {} completed ({})", coordinator.label, state);
            true
        } else {
            coordinator
                .counters
                .loads_aborted
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Load of {} superseded by a clear or edit, results discarded",
                coordinator.label
            );
            false
        }
    }

    /// Marks the load failed, reverts the state and hands `error` to every
    /// waiter. Cancellation is not shared: waiters retry instead.
    pub fn fail(mut self, error: CacheError) -> CacheError {
        let coordinator = self.flight.coordinator;
        let outcome = if error.is_cancelled() {
            coordinator
                .counters
                .loads_aborted
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Load of {} cancelled", coordinator.label);
            FlightOutcome::Aborted
        } else {
            coordinator
                .counters
                .loads_failed
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Load of {} failed: {}", coordinator.label, error);
            FlightOutcome::Failed(error.clone())
        };
        let _ = self.flight.finish(None, outcome);
        error
    }
}

/// Exclusive guard for point lookups and partial loads.
#[derive(Debug)]
pub struct LookupGuard<'a> {
    coordinator: &'a CacheCoordinator,
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl LookupGuard<'_> {
    /// The coordinator this guard belongs to.
    pub fn coordinator(&self) -> &CacheCoordinator {
        self.coordinator
    }

    /// Records that entries were resolved individually: an `Empty` cache
    /// becomes `Partial`. A `Full` cache stays `Full`.
    pub fn mark_partial(&self) {
        let mut inner = self.coordinator.lock_inner();
        if inner.resting == LoadState::Empty {
            inner.resting = LoadState::Partial;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn leader(entry: LoadEntry<'_>) -> LoadTicket<'_> {
        match entry {
            LoadEntry::Leader(ticket) => ticket,
            LoadEntry::Ready => panic!("expected to lead the load"),
        }
    }

    #[tokio::test]
    async fn test_load_lifecycle() {
        let coordinator = CacheCoordinator::new("tables");
        assert_eq!(coordinator.state(), LoadState::Empty);

        let ticket = leader(coordinator.begin_load().await.unwrap());
        assert_eq!(coordinator.state(), LoadState::Loading);
        assert!(!coordinator.is_full());

        ticket.complete(LoadState::Full);
        assert_eq!(coordinator.state(), LoadState::Full);
        assert!(coordinator.is_full());
        assert!(matches!(
            coordinator.begin_load().await.unwrap(),
            LoadEntry::Ready
        ));
        assert_eq!(coordinator.stats().loads_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_load_reverts_state() {
        let coordinator = CacheCoordinator::new("tables");
        let ticket = leader(coordinator.begin_load().await.unwrap());
        let error = ticket.fail(CacheError::query_failed(
            "select tables",
            std::io::Error::other("connection reset"),
        ));

        assert!(error.is_fatal());
        assert_eq!(coordinator.state(), LoadState::Empty);
        assert_eq!(coordinator.stats().loads_failed, 1);

        // The next caller retries
        let ticket = leader(coordinator.begin_load().await.unwrap());
        ticket.complete(LoadState::Full);
        assert!(coordinator.is_full());
    }

    #[tokio::test]
    async fn test_dropped_ticket_reverts_to_partial() {
        let coordinator = CacheCoordinator::new("tables");
        coordinator.lock().await.mark_partial();
        assert_eq!(coordinator.state(), LoadState::Partial);

        let ticket = leader(coordinator.begin_load().await.unwrap());
        drop(ticket);

        assert_eq!(coordinator.state(), LoadState::Partial);
        assert_eq!(coordinator.stats().loads_aborted, 1);
    }

    #[tokio::test]
    async fn test_waiters_share_success() {
        let coordinator = Arc::new(CacheCoordinator::new("tables"));
        let ticket = leader(coordinator.begin_load().await.unwrap());

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                matches!(coordinator.begin_load().await, Ok(LoadEntry::Ready))
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ticket.complete(LoadState::Full);

        assert!(waiter.await.unwrap());
        assert_eq!(coordinator.stats().loads_completed, 1);
    }

    #[tokio::test]
    async fn test_waiters_share_failure() {
        let coordinator = Arc::new(CacheCoordinator::new("tables"));
        let ticket = leader(coordinator.begin_load().await.unwrap());

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.begin_load().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = ticket.fail(CacheError::query_failed(
            "select tables",
            std::io::Error::other("permission denied"),
        ));

        let shared = waiter.await.unwrap().unwrap_err();
        assert!(shared.to_string().contains("select tables"));
        assert_eq!(coordinator.stats().loads_failed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_load_lets_waiter_lead() {
        let coordinator = Arc::new(CacheCoordinator::new("tables"));
        let ticket = leader(coordinator.begin_load().await.unwrap());

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                match coordinator.begin_load().await {
                    Ok(LoadEntry::Leader(ticket)) => {
                        ticket.complete(LoadState::Full);
                        true
                    }
                    _ => false,
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let error = ticket.fail(CacheError::Cancelled);
        assert!(error.is_cancelled());

        assert!(waiter.await.unwrap());
        assert!(coordinator.is_full());
        assert_eq!(coordinator.stats().loads_aborted, 1);
    }

    #[tokio::test]
    async fn test_lock_waits_for_bulk_load() {
        let coordinator = Arc::new(CacheCoordinator::new("tables"));
        let ticket = leader(coordinator.begin_load().await.unwrap());

        let lookup = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let guard = coordinator.lock().await;
                guard.coordinator().state()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lookup.is_finished());
        ticket.complete(LoadState::Full);

        assert_eq!(lookup.await.unwrap(), LoadState::Full);
    }

    #[tokio::test]
    async fn test_invalidate_supersedes_running_load() {
        let coordinator = CacheCoordinator::new("tables");
        let ticket = leader(coordinator.begin_load().await.unwrap());
        assert!(ticket.is_current());

        coordinator.invalidate();
        assert!(!ticket.is_current());
        assert_eq!(coordinator.state(), LoadState::Loading);

        assert!(!ticket.complete(LoadState::Full));
        assert_eq!(coordinator.state(), LoadState::Empty);
        assert!(!coordinator.is_full());
        assert_eq!(coordinator.stats().loads_completed, 0);
        assert_eq!(coordinator.stats().loads_aborted, 1);

        // The next caller reloads
        let ticket = leader(coordinator.begin_load().await.unwrap());
        assert!(ticket.complete(LoadState::Full));
        assert!(coordinator.is_full());
    }

    #[tokio::test]
    async fn test_set_state_during_load_is_kept() {
        let coordinator = CacheCoordinator::new("tables");
        let ticket = leader(coordinator.begin_load().await.unwrap());

        coordinator.set_state(LoadState::Full);
        assert!(!coordinator.is_full());
        assert!(!ticket.complete(LoadState::Full));
        assert_eq!(coordinator.state(), LoadState::Full);
        assert!(coordinator.is_full());
    }

    #[tokio::test]
    async fn test_supersede_keeps_state() {
        let coordinator = CacheCoordinator::new("tables");
        coordinator.lock().await.mark_partial();
        let ticket = leader(coordinator.begin_load().await.unwrap());

        coordinator.supersede();
        assert!(!ticket.complete(LoadState::Full));
        assert_eq!(coordinator.state(), LoadState::Partial);
    }

    #[tokio::test]
    async fn test_lookups_before_load_do_not_supersede_it() {
        let coordinator = Arc::new(CacheCoordinator::new("tables"));
        let guard = coordinator.lock().await;

        let load = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let ticket = leader(coordinator.begin_load().await.unwrap());
                ticket.complete(LoadState::Full)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // An edit made while holding the lookup guard precedes the load
        coordinator.supersede();
        drop(guard);

        assert!(load.await.unwrap());
        assert!(coordinator.is_full());
    }

    #[tokio::test]
    async fn test_mark_partial_never_downgrades_full() {
        let coordinator = CacheCoordinator::new("tables");
        coordinator.set_state(LoadState::Full);
        coordinator.lock().await.mark_partial();
        assert_eq!(coordinator.state(), LoadState::Full);

        coordinator.invalidate();
        assert_eq!(coordinator.state(), LoadState::Empty);
        assert!(!coordinator.is_full());
    }
}
