//! Lane scheduler
//!
//! Envelopes are keyed by session; each session gets a lane with FIFO order
//! and at most one run in flight. Distinct lanes run in parallel under a
//! global cap. Lanes are picked for dispatch in arrival order of their
//! oldest queued envelope; a per-channel debounce window coalesces bursts
//! before they enter the queue.

pub mod lane;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::agent::RunOutcome;
use crate::cancel::CancelToken;
use crate::config::ConfigHandle;
use crate::routing::Envelope;
use crate::session::SessionKey;
use crate::{Error, Result};

pub use lane::{Lane, LaneState};

/// Executes one run for a dequeued envelope
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Run to completion, honoring `cancel`. Must not panic on cancellation.
    async fn execute(
        &self,
        session_key: SessionKey,
        envelope: Envelope,
        run_id: Uuid,
        cancel: CancelToken,
    ) -> RunOutcome;
}

struct SchedulerInner {
    executor: Arc<dyn RunExecutor>,
    config: ConfigHandle,
    lanes: Mutex<HashMap<String, Lane>>,
    /// Session key per active run id, for abort-by-run-id
    active_runs: Mutex<HashMap<Uuid, String>>,
    wake: Notify,
    permits: Arc<Semaphore>,
    shutdown: CancelToken,
}

/// Per-session FIFO scheduler with a global run pool
#[derive(Clone)]
pub struct LaneScheduler {
    inner: Arc<SchedulerInner>,
}

impl LaneScheduler {
    /// Build a scheduler over `executor`, sized from the config snapshot.
    #[must_use]
    pub fn new(executor: Arc<dyn RunExecutor>, config: ConfigHandle) -> Self {
        let max_in_flight = config.snapshot().limits.max_in_flight_runs.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                config,
                lanes: Mutex::new(HashMap::new()),
                active_runs: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                permits: Arc::new(Semaphore::new(max_in_flight)),
                shutdown: CancelToken::new(),
            }),
        }
    }

    /// Start the dispatch and eviction loops
    pub fn start(&self) {
        let dispatch = self.clone();
        tokio::spawn(async move { dispatch.dispatch_loop().await });

        let evict = self.clone();
        tokio::spawn(async move { evict.eviction_loop().await });
    }

    /// Stop dispatching and cancel all active runs
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Ok(lanes) = self.inner.lanes.lock() {
            for lane in lanes.values() {
                if let Some(active) = &lane.active {
                    active.cancel.cancel();
                }
            }
        }
        self.inner.wake.notify_waiters();
    }

    /// Accept an envelope into its lane, applying the channel's debounce
    /// window.
    ///
    /// # Errors
    ///
    /// Returns an error when internal locks are poisoned.
    pub fn enqueue(&self, session_key: &SessionKey, envelope: Envelope) -> Result<()> {
        let debounce_ms = self
            .inner
            .config
            .snapshot()
            .channel(&envelope.channel)
            .debounce_ms;

        if debounce_ms == 0 {
            self.enqueue_now(session_key, envelope)?;
            return Ok(());
        }

        let key = session_key.to_string();
        let mut lanes = self.lock_lanes()?;
        let lane = lanes.entry(key.clone()).or_default();

        match &mut lane.debouncing {
            Some(buffer) => {
                lane::merge_envelopes(buffer, envelope);
                tracing::trace!(session = %key, "envelope coalesced into debounce buffer");
            }
            None => {
                lane.debouncing = Some(envelope);
                drop(lanes);
                let scheduler = self.clone();
                let session_key = session_key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
                    scheduler.flush_debounce(&session_key);
                });
            }
        }
        Ok(())
    }

    /// Move a closed debounce buffer into the queue
    fn flush_debounce(&self, session_key: &SessionKey) {
        let Ok(mut lanes) = self.lock_lanes() else {
            return;
        };
        if let Some(lane) = lanes.get_mut(&session_key.to_string()) {
            if let Some(envelope) = lane.debouncing.take() {
                lane.enqueue(envelope);
            }
        }
        drop(lanes);
        self.inner.wake.notify_waiters();
    }

    fn enqueue_now(&self, session_key: &SessionKey, envelope: Envelope) -> Result<()> {
        let mut lanes = self.lock_lanes()?;
        lanes
            .entry(session_key.to_string())
            .or_default()
            .enqueue(envelope);
        drop(lanes);
        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Abort the active run of a session. Returns false when nothing was
    /// running. With `drop_pending`, queued envelopes are discarded and the
    /// call awaits the drain.
    pub async fn abort(&self, session_key: &SessionKey, drop_pending: bool) -> bool {
        let done_rx = {
            let Ok(mut lanes) = self.lock_lanes() else {
                return false;
            };
            let Some(lane) = lanes.get_mut(&session_key.to_string()) else {
                return false;
            };
            lane.abort(drop_pending)
        };

        match done_rx {
            Some(mut rx) => {
                if drop_pending {
                    // Await drain before reporting completion
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Abort by run id, resolving the owning session first
    pub async fn abort_run(&self, run_id: Uuid, drop_pending: bool) -> Result<()> {
        let key = {
            let runs = self
                .inner
                .active_runs
                .lock()
                .map_err(|_| Error::Internal("scheduler lock poisoned".to_string()))?;
            runs.get(&run_id).cloned()
        };
        let Some(key) = key else {
            return Err(Error::NotFound(format!("run {run_id}")));
        };
        let session_key = SessionKey::parse(&key)?;
        self.abort(&session_key, drop_pending).await;
        Ok(())
    }

    /// Lane states for diagnostics: session key → (state, queue depth)
    #[must_use]
    pub fn lane_status(&self) -> HashMap<String, (String, usize)> {
        self.lock_lanes()
            .map(|lanes| {
                lanes
                    .iter()
                    .map(|(key, lane)| {
                        let state = match lane.state {
                            LaneState::Idle => "idle",
                            LaneState::Queued => "queued",
                            LaneState::Running => "running",
                            LaneState::Aborting => "aborting",
                        };
                        (key.clone(), (state.to_string(), lane.queue.len()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run ids currently executing
    #[must_use]
    pub fn active_run_ids(&self) -> Vec<Uuid> {
        self.inner
            .active_runs
            .lock()
            .map(|runs| runs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Dispatch loop: picks the fairest dispatchable lane whenever a permit
    /// is free.
    async fn dispatch_loop(&self) {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return;
            }

            let Ok(permit) = Arc::clone(&self.inner.permits).acquire_owned().await else {
                return;
            };

            // Wait until some lane is dispatchable. The notified future is
            // registered before the re-check so a wakeup between the check
            // and the await cannot be lost.
            let dispatched = loop {
                if self.inner.shutdown.is_cancelled() {
                    return;
                }
                let notified = self.inner.wake.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(work) = self.try_dispatch() {
                    break work;
                }
                tokio::select! {
                    () = notified => {}
                    () = self.inner.shutdown.cancelled() => return,
                }
            };

            let (key, envelope, run_id, cancel) = dispatched;
            let scheduler = self.clone();
            tokio::spawn(async move {
                let session_key = match SessionKey::parse(&key) {
                    Ok(k) => k,
                    Err(e) => {
                        tracing::error!(error = %e, "bad lane key");
                        scheduler.finish_run(&key, run_id);
                        drop(permit);
                        return;
                    }
                };
                let outcome = scheduler
                    .inner
                    .executor
                    .execute(session_key, envelope, run_id, cancel)
                    .await;
                tracing::debug!(run = %run_id, status = ?outcome.status, "run finished");
                scheduler.finish_run(&key, run_id);
                drop(permit);
            });
        }
    }

    /// Pick the dispatchable lane whose oldest envelope arrived first
    fn try_dispatch(&self) -> Option<(String, Envelope, Uuid, CancelToken)> {
        let mut lanes = self.lock_lanes().ok()?;
        let key = lanes
            .iter()
            .filter(|(_, lane)| lane.is_dispatchable())
            .min_by_key(|(_, lane)| lane.oldest_waiting())
            .map(|(key, _)| key.clone())?;

        let lane = lanes.get_mut(&key)?;
        let run_id = Uuid::new_v4();
        let (envelope, cancel) = lane.begin_run(run_id)?;
        drop(lanes);

        if let Ok(mut runs) = self.inner.active_runs.lock() {
            runs.insert(run_id, key.clone());
        }
        Some((key, envelope, run_id, cancel))
    }

    fn finish_run(&self, key: &str, run_id: Uuid) {
        if let Ok(mut runs) = self.inner.active_runs.lock() {
            runs.remove(&run_id);
        }
        if let Ok(mut lanes) = self.lock_lanes() {
            if let Some(lane) = lanes.get_mut(key) {
                lane.complete_run();
            }
        }
        self.inner.wake.notify_waiters();
    }

    /// Periodically drop lane records idle past the eviction window
    async fn eviction_loop(&self) {
        let idle_window = Duration::from_secs(
            self.inner
                .config
                .snapshot()
                .limits
                .lane_idle_eviction_secs
                .max(1),
        );
        let sweep_every = idle_window.min(Duration::from_secs(60));
        loop {
            tokio::select! {
                () = tokio::time::sleep(sweep_every) => {}
                () = self.inner.shutdown.cancelled() => return,
            }
            if let Ok(mut lanes) = self.lock_lanes() {
                let before = lanes.len();
                lanes.retain(|_, lane| !lane.is_evictable(idle_window));
                let evicted = before - lanes.len();
                if evicted > 0 {
                    tracing::debug!(evicted, "idle lanes evicted");
                }
            }
        }
    }

    fn lock_lanes(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lane>>> {
        self.inner
            .lanes
            .lock()
            .map_err(|_| Error::Internal("scheduler lock poisoned".to_string()))
    }
}
