//! Timer coordinator.
//!
//! The countdown of the active section is never stored as a decrementing
//! counter. It is re-derived on every read from the backend's section-start
//! anchor and the section limit, so a reload reconstructs the same remaining
//! time and local state cannot extend it.
//!
//! While running, two tokio tasks are owned by the coordinator: a 1 Hz tick
//! that publishes [`TimerSnapshot`]s and detects expiry, and a 15 s sync that
//! pushes elapsed time to the backend. Both are aborted on re-initialization,
//! on [`TimerCoordinator::stop`], and on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::error::BackendError;
use crate::model::{Credentials, SectionKind, SessionId};
use crate::sync::lock;
use crate::traits::{AssessmentBackend, Delivery, SyncTimerRequest};

/// Intervals and thresholds of the timer.
#[derive(Debug, Clone)]
pub struct TimerSettings {
    /// Display refresh and expiry check period.
    pub tick_interval: Duration,
    /// Period of the background sync with the backend.
    pub sync_interval: Duration,
    /// Syncs are skipped when less than this many seconds elapsed since the
    /// last successful push.
    pub min_sync_delta_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(15),
            min_sync_delta_secs: 5,
        }
    }
}

/// Lifecycle phase of the section timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Waiting for the backend's timer state.
    Loading,
    /// Counting down.
    Running,
    /// The limit has passed; the expiry handler has fired.
    Expired,
    /// The backend is in another section; no countdown is running.
    Stale,
    /// Torn down.
    Stopped,
}

/// A countdown anchored to an authoritative start instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    anchor: DateTime<Utc>,
    limit_secs: u64,
}

impl Countdown {
    pub fn new(anchor: DateTime<Utc>, limit_secs: u64) -> Self {
        Self { anchor, limit_secs }
    }

    /// Whole seconds since the anchor. An anchor in the future counts as zero.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        let ms = (now - self.anchor).num_milliseconds();
        if ms <= 0 {
            0
        } else {
            (ms / 1000) as u64
        }
    }

    /// `max(0, limit - floor((now - anchor) / 1000ms))`
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u64 {
        self.limit_secs.saturating_sub(self.elapsed_at(now))
    }
}

/// What the display layer sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub section: Option<SectionKind>,
    pub phase: TimerPhase,
    pub remaining_secs: u64,
    pub elapsed_secs: u64,
    /// The countdown runs on a local anchor because the backend was unreachable.
    pub degraded: bool,
}

impl TimerSnapshot {
    fn idle(phase: TimerPhase, section: Option<SectionKind>) -> Self {
        Self {
            section,
            phase,
            remaining_secs: 0,
            elapsed_secs: 0,
            degraded: false,
        }
    }
}

/// Outcome of [`TimerCoordinator::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerInit {
    Running(TimerSnapshot),
    /// Already expired at initialization; the expiry handler has been invoked.
    Expired(TimerSnapshot),
    /// The backend reports another section. Nothing was started.
    SectionMismatch {
        expected: SectionKind,
        actual: SectionKind,
    },
}

/// Called once per section when its countdown reaches zero.
pub type ExpiryHandler = Arc<dyn Fn(SectionKind) + Send + Sync>;

/// Owns the countdown of the active section and its background tasks.
pub struct TimerCoordinator {
    backend: Arc<dyn AssessmentBackend>,
    credentials: Credentials,
    clock: Clock,
    settings: TimerSettings,
    on_expire: Option<ExpiryHandler>,
    snapshot_tx: watch::Sender<TimerSnapshot>,
    active: Mutex<Option<Arc<ActiveTimer>>>,
}

impl TimerCoordinator {
    pub fn new(
        backend: Arc<dyn AssessmentBackend>,
        credentials: Credentials,
        clock: Clock,
        settings: TimerSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(TimerSnapshot::idle(TimerPhase::Loading, None));
        Self {
            backend,
            credentials,
            clock,
            settings,
            on_expire: None,
            snapshot_tx,
            active: Mutex::new(None),
        }
    }

    pub fn with_expiry_handler(mut self, handler: ExpiryHandler) -> Self {
        self.on_expire = Some(handler);
        self
    }

    /// Subscribe to display updates.
    pub fn subscribe(&self) -> watch::Receiver<TimerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Start the countdown of `section` from the backend's authoritative state.
    ///
    /// Any previous countdown is stopped first. If the backend cannot be
    /// reached, a full-length countdown anchored to now is started and marked
    /// degraded so the exam is never blocked. A refused credential or request
    /// is returned to the caller instead.
    pub async fn initialize(
        &self,
        session_id: SessionId,
        section: SectionKind,
        limit_minutes: u32,
    ) -> Result<TimerInit, BackendError> {
        self.stop();
        self.publish(TimerSnapshot::idle(TimerPhase::Loading, Some(section)));

        let limit_secs = u64::from(limit_minutes) * 60;
        let state = self.backend.timer_state(&self.credentials, session_id).await;
        let now = self.clock.now();

        let (countdown, degraded, expired) = match state {
            Ok(state) => {
                if state.current_section != section {
                    tracing::warn!(
                        expected = %section,
                        actual = %state.current_section,
                        "backend timer belongs to another section"
                    );
                    self.publish(TimerSnapshot::idle(TimerPhase::Stale, Some(section)));
                    return Ok(TimerInit::SectionMismatch {
                        expected: section,
                        actual: state.current_section,
                    });
                }
                let anchor = state
                    .section_started_at
                    .unwrap_or_else(|| now - TimeDelta::seconds(state.elapsed_time as i64));
                let countdown = Countdown::new(anchor, limit_secs);
                let expired =
                    state.is_expired || state.time_remaining <= 0 || countdown.remaining_at(now) == 0;
                (countdown, false, expired)
            }
            Err(
                e @ (BackendError::Network(_) | BackendError::Timeout(_) | BackendError::Server { .. }),
            ) => {
                tracing::error!(
                    session_id,
                    %section,
                    "timer state unavailable, running a local full-length countdown: {e}"
                );
                (Countdown::new(now, limit_secs), true, false)
            }
            Err(e) => {
                tracing::warn!(session_id, %section, "timer state refused: {e}");
                self.publish(TimerSnapshot::idle(TimerPhase::Stopped, Some(section)));
                return Err(e);
            }
        };

        let last_synced = (!degraded).then(|| countdown.elapsed_at(now).min(limit_secs));
        let timer = Arc::new(ActiveTimer {
            backend: Arc::clone(&self.backend),
            credentials: self.credentials.clone(),
            session_id,
            section,
            countdown,
            degraded,
            on_expire: self.on_expire.clone(),
            phase: Mutex::new(TimerPhase::Running),
            expired_fired: AtomicBool::new(false),
            last_synced: Mutex::new(last_synced),
            tasks: Mutex::new(Vec::new()),
        });
        *lock(&self.active) = Some(Arc::clone(&timer));

        if expired {
            tracing::info!(session_id, %section, "section already expired");
            timer.expire(&self.snapshot_tx, now);
            return Ok(TimerInit::Expired(timer.snapshot(now)));
        }

        let snapshot = timer.snapshot(now);
        self.publish(snapshot.clone());
        self.spawn_tasks(&timer);
        tracing::debug!(
            session_id,
            %section,
            remaining = snapshot.remaining_secs,
            degraded,
            "section timer running"
        );
        Ok(TimerInit::Running(snapshot))
    }

    fn spawn_tasks(&self, timer: &Arc<ActiveTimer>) {
        let tick = {
            let timer = Arc::clone(timer);
            let tx = self.snapshot_tx.clone();
            let clock = self.clock;
            let period = self.settings.tick_interval;
            tokio::spawn(async move {
                let mut ticks = interval(period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    if timer.phase() != TimerPhase::Running {
                        break;
                    }
                    let now = clock.now();
                    let snapshot = timer.snapshot(now);
                    let remaining = snapshot.remaining_secs;
                    let _ = tx.send(snapshot);
                    if remaining == 0 {
                        timer.expire(&tx, now);
                        break;
                    }
                }
            })
        };

        let sync = {
            let timer = Arc::clone(timer);
            let clock = self.clock;
            let period = self.settings.sync_interval;
            let min_delta = self.settings.min_sync_delta_secs;
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    if timer.phase() != TimerPhase::Running {
                        break;
                    }
                    if let Err(e) = timer.push(clock.now(), Delivery::BestEffort, min_delta).await {
                        tracing::warn!(session_id = timer.session_id, "timer sync failed, retrying next interval: {e}");
                    }
                }
            })
        };

        lock(&timer.tasks).extend([tick, sync]);
    }

    /// Current state, derived from the anchor at the moment of the call.
    pub fn snapshot(&self) -> TimerSnapshot {
        match lock(&self.active).as_ref() {
            Some(timer) => timer.snapshot(self.clock.now()),
            None => self.snapshot_tx.borrow().clone(),
        }
    }

    /// Seconds spent in the active section, capped at its limit.
    pub fn elapsed_secs(&self) -> u64 {
        lock(&self.active)
            .as_ref()
            .map(|t| t.countdown.elapsed_at(self.clock.now()).min(t.countdown.limit_secs))
            .unwrap_or(0)
    }

    pub fn phase(&self) -> TimerPhase {
        self.snapshot_tx.borrow().phase
    }

    pub fn is_expired(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|t| t.phase() == TimerPhase::Expired)
    }

    /// Push elapsed time now, as the periodic sync would.
    ///
    /// Returns `Ok(false)` when the push was skipped.
    pub async fn sync_now(&self) -> Result<bool, BackendError> {
        let Some(timer) = self.active_timer() else {
            return Ok(false);
        };
        timer
            .push(self.clock.now(), Delivery::BestEffort, self.settings.min_sync_delta_secs)
            .await
    }

    /// Flush elapsed time with guaranteed delivery (page hide / unload).
    ///
    /// Only skipped when no time passed since the last push.
    pub async fn flush(&self) -> Result<bool, BackendError> {
        let Some(timer) = self.active_timer() else {
            return Ok(false);
        };
        timer.push(self.clock.now(), Delivery::Guaranteed, 1).await
    }

    /// Stop the countdown and abort its tasks.
    pub fn stop(&self) {
        let previous = lock(&self.active).take();
        if let Some(timer) = previous {
            timer.shutdown();
            self.publish(TimerSnapshot::idle(TimerPhase::Stopped, Some(timer.section)));
        }
    }

    fn active_timer(&self) -> Option<Arc<ActiveTimer>> {
        lock(&self.active).clone()
    }

    fn publish(&self, snapshot: TimerSnapshot) {
        self.snapshot_tx.send_replace(snapshot);
    }
}

impl Drop for TimerCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.active).take() {
            timer.shutdown();
        }
    }
}

/// Countdown state of one section. Created on initialize, discarded on stop.
struct ActiveTimer {
    backend: Arc<dyn AssessmentBackend>,
    credentials: Credentials,
    session_id: SessionId,
    section: SectionKind,
    countdown: Countdown,
    degraded: bool,
    on_expire: Option<ExpiryHandler>,
    phase: Mutex<TimerPhase>,
    expired_fired: AtomicBool,
    /// Elapsed seconds the backend last acknowledged.
    last_synced: Mutex<Option<u64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActiveTimer {
    fn phase(&self) -> TimerPhase {
        *lock(&self.phase)
    }

    fn snapshot(&self, now: DateTime<Utc>) -> TimerSnapshot {
        let phase = self.phase();
        let (remaining_secs, elapsed_secs) = if phase == TimerPhase::Expired {
            (0, self.countdown.limit_secs)
        } else {
            (
                self.countdown.remaining_at(now),
                self.countdown.elapsed_at(now).min(self.countdown.limit_secs),
            )
        };
        TimerSnapshot {
            section: Some(self.section),
            phase,
            remaining_secs,
            elapsed_secs,
            degraded: self.degraded,
        }
    }

    /// Transition to `Expired` and fire the handler. Re-entry is a no-op.
    fn expire(&self, tx: &watch::Sender<TimerSnapshot>, now: DateTime<Utc>) {
        if self.expired_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.phase) = TimerPhase::Expired;
        tx.send_replace(self.snapshot(now));
        tracing::info!(session_id = self.session_id, section = %self.section, "section time expired");
        if let Some(handler) = &self.on_expire {
            handler(self.section);
        }
    }

    async fn push(
        &self,
        now: DateTime<Utc>,
        delivery: Delivery,
        min_delta: u64,
    ) -> Result<bool, BackendError> {
        if matches!(self.phase(), TimerPhase::Stopped | TimerPhase::Stale) {
            return Ok(false);
        }
        let elapsed = self.countdown.elapsed_at(now).min(self.countdown.limit_secs);
        let last_synced = *lock(&self.last_synced);
        if let Some(last) = last_synced {
            if elapsed < last.saturating_add(min_delta) {
                return Ok(false);
            }
        }

        let request = SyncTimerRequest {
            session_id: self.session_id,
            time_spent: elapsed,
        };
        self.backend
            .sync_timer(&self.credentials, &request, delivery)
            .await?;

        let mut last = lock(&self.last_synced);
        *last = Some(last.map_or(elapsed, |prev| prev.max(elapsed)));
        tracing::debug!(session_id = self.session_id, elapsed, ?delivery, "timer synced");
        Ok(true)
    }

    fn shutdown(&self) {
        *lock(&self.phase) = TimerPhase::Stopped;
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}
