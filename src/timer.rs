//! # Clock and timers
//!
//! One-shot and recurring timers used by the manager. A timer never calls
//! back into the controller directly: when it fires it posts a
//! [`TimerFired`] message and the manager's event loop handles it like any
//! other event. Cancelling a handle is idempotent and a cancelled timer never
//! delivers.

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Source of "now" in the installation's local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in a fixed IANA timezone
#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.tz).fixed_offset()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock()
    }
}

/// What a timer triggers when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerAction {
    /// Recurring control tick
    Tick,
    /// Re-plan the night pre-heat with fresh temperatures
    PreheatCalc,
    /// Start (or re-check) night pre-heating
    PreheatStart,
    /// End of the pre-heat window at the morning deadline
    PreheatEnd,
    /// Transport has been down for the whole grace period
    TransportGrace,
}

pub type TimerId = u64;

/// Message posted when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub id: TimerId,
    pub action: TimerAction,
}

/// Cancellable reference to a scheduled timer
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    action: TimerAction,
    token: CancellationToken,
}

impl TimerHandle {
    fn new(id: TimerId, action: TimerAction) -> Self {
        Self {
            id,
            action,
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn action(&self) -> TimerAction {
        self.action
    }

    /// Safe to call any number of times, before or after the timer fired.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            trace!(id = self.id, action = ?self.action, "timer cancelled");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether `fired` was produced by this handle
    pub fn matches(&self, fired: &TimerFired) -> bool {
        self.id == fired.id && self.action == fired.action
    }
}

pub trait Timers: Send + Sync {
    fn schedule_at(&self, at: DateTime<FixedOffset>, action: TimerAction) -> TimerHandle;
    fn schedule_every(&self, every: Duration, action: TimerAction) -> TimerHandle;
}

/// Timers backed by tokio sleeps, delivering into an mpsc channel
pub struct TokioTimers {
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<TimerFired>,
    next_id: AtomicU64,
}

impl TokioTimers {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                tx,
                next_id: AtomicU64::new(1),
            },
            rx,
        )
    }

    fn next_handle(&self, action: TimerAction) -> TimerHandle {
        TimerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), action)
    }
}

impl Timers for TokioTimers {
    fn schedule_at(&self, at: DateTime<FixedOffset>, action: TimerAction) -> TimerHandle {
        let handle = self.next_handle(action);
        let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let token = handle.token.clone();
        let tx = self.tx.clone();
        let fired = TimerFired {
            id: handle.id,
            action,
        };
        trace!(id = handle.id, ?action, %at, "timer scheduled");

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        let _ = tx.send(fired);
                    }
                }
            }
        });
        handle
    }

    fn schedule_every(&self, every: Duration, action: TimerAction) -> TimerHandle {
        let handle = self.next_handle(action);
        let token = handle.token.clone();
        let tx = self.tx.clone();
        let fired = TimerFired {
            id: handle.id,
            action,
        };
        let every = every.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if token.is_cancelled() || tx.send(fired).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        handle
    }
}

#[derive(Debug, Clone)]
struct ScheduledTimer {
    handle: TimerHandle,
    at: Option<DateTime<FixedOffset>>,
    every: Option<Duration>,
}

/// Timers that only fire when a test asks them to
#[derive(Debug, Default)]
pub struct ManualTimers {
    scheduled: Mutex<Vec<ScheduledTimer>>,
    next_id: AtomicU64,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (not cancelled, not yet fired) timers
    pub fn pending(&self) -> Vec<TimerHandle> {
        self.scheduled
            .lock()
            .iter()
            .filter(|s| !s.handle.is_cancelled())
            .map(|s| s.handle.clone())
            .collect()
    }

    pub fn is_pending(&self, action: TimerAction) -> bool {
        self.pending().iter().any(|h| h.action() == action)
    }

    /// When the live one-shot timer for `action` is due
    pub fn due_at(&self, action: TimerAction) -> Option<DateTime<FixedOffset>> {
        self.scheduled
            .lock()
            .iter()
            .find(|s| !s.handle.is_cancelled() && s.handle.action() == action)
            .and_then(|s| s.at)
    }

    pub fn interval_of(&self, action: TimerAction) -> Option<Duration> {
        self.scheduled
            .lock()
            .iter()
            .find(|s| !s.handle.is_cancelled() && s.handle.action() == action)
            .and_then(|s| s.every)
    }

    /// Fire the live timer for `action`. One-shot timers are consumed.
    pub fn fire(&self, action: TimerAction) -> Option<TimerFired> {
        let mut scheduled = self.scheduled.lock();
        let idx = scheduled
            .iter()
            .position(|s| !s.handle.is_cancelled() && s.handle.action() == action)?;
        let entry = &scheduled[idx];
        let fired = TimerFired {
            id: entry.handle.id(),
            action,
        };
        if entry.every.is_none() {
            scheduled.remove(idx);
        }
        Some(fired)
    }

    fn push(&self, action: TimerAction, at: Option<DateTime<FixedOffset>>, every: Option<Duration>) -> TimerHandle {
        let handle = TimerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1, action);
        self.scheduled.lock().push(ScheduledTimer {
            handle: handle.clone(),
            at,
            every,
        });
        handle
    }
}

impl Timers for ManualTimers {
    fn schedule_at(&self, at: DateTime<FixedOffset>, action: TimerAction) -> TimerHandle {
        self.push(action, Some(at), None)
    }

    fn schedule_every(&self, every: Duration, action: TimerAction) -> TimerHandle {
        self.push(action, None, Some(every))
    }
}
