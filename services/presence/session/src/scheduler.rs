//! Periodic timers driving the reconnect and update cycles.
//!
//! A timer is a spawned task that invokes its callback on every tick. The
//! [`Scheduler`] itself never deduplicates; [`Cycle`] holds at most one handle
//! and is the only place a timer is started or cancelled.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

/// Identifier carried by every tick so stale ticks can be told apart
pub type TimerId = u64;

/// Shortest period a timer runs at
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a running periodic timer
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Identifier passed to the timer's callback
    pub fn id(&self) -> TimerId {
        self.id
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns periodic timers on the current tokio runtime
#[derive(Debug)]
pub struct Scheduler {
    next_id: TimerId,
}

impl Scheduler {
    /// Create a scheduler; ids it hands out start at 1
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Start a timer that first fires after `initial_delay` and then every
    /// `period`. The callback receives the timer id. Periods below
    /// [`MIN_PERIOD`] are raised to it.
    pub fn start<F>(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        mut callback: F,
    ) -> TimerHandle
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        if period < MIN_PERIOD {
            warn!("Timer period {:?} too short; using {:?}", period, MIN_PERIOD);
        }
        let period = period.max(MIN_PERIOD);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("Timer {} fired", id);
                callback(id);
            }
        });
        TimerHandle { id, task }
    }

    /// Stop a timer. Ticks already delivered are not recalled.
    pub fn cancel(&self, handle: TimerHandle) {
        trace!("Timer {} cancelled", handle.id);
        drop(handle);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// A named periodic cycle owning at most one timer
#[derive(Debug)]
pub struct Cycle {
    name: &'static str,
    handle: Option<TimerHandle>,
}

impl Cycle {
    /// Create an idle cycle
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    /// Whether a timer is currently running
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Id of the running timer, if any
    pub fn timer_id(&self) -> Option<TimerId> {
        self.handle.as_ref().map(TimerHandle::id)
    }

    /// Whether `id` belongs to the running timer
    pub fn owns(&self, id: TimerId) -> bool {
        self.timer_id() == Some(id)
    }

    /// Start the cycle on `scheduler` with an immediate first tick. No-op if
    /// already running. Returns whether a new timer was started.
    pub fn start<F>(&mut self, scheduler: &mut Scheduler, period: Duration, callback: F) -> bool
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        if self.handle.is_some() {
            return false;
        }
        let handle = scheduler.start(Duration::ZERO, period, callback);
        trace!("Started {} cycle (timer {})", self.name, handle.id());
        self.handle = Some(handle);
        true
    }

    /// Stop the cycle. No-op if not running.
    pub fn cancel(&mut self, scheduler: &Scheduler) {
        if let Some(handle) = self.handle.take() {
            scheduler.cancel(handle);
        }
    }
}
