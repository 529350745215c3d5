//! Timer capability used for polling and clock reads.
//!
//! Components never call `tokio::time` directly; they go through a
//! [`Scheduler`] so tests can drive time with [`ManualScheduler`].

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task. Cancelling is idempotent and takes effect
/// immediately: a cancelled task never runs.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`
    fn after(&self, delay: Duration, task: ScheduledTask) -> CancelHandle;

    fn now(&self) -> DateTime<Utc>;
}

/// Scheduler backed by the Tokio timer. Must be used within a runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: ScheduledTask) -> CancelHandle {
        let handle = CancelHandle::new();
        let token = handle.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        task();
                    }
                }
            }
        });

        handle
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct Timer {
    due: Duration,
    seq: u64,
    token: CancellationToken,
    task: ScheduledTask,
}

struct ManualClock {
    start: DateTime<Utc>,
    elapsed: Duration,
    timers: Vec<Timer>,
    seq: u64,
}

/// Virtual-clock scheduler. Time only moves when [`ManualScheduler::advance`]
/// is called; due tasks then run in due order on the calling thread.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: Arc<Mutex<ManualClock>>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            clock: Arc::new(Mutex::new(ManualClock {
                start,
                elapsed: Duration::ZERO,
                timers: Vec::new(),
                seq: 0,
            })),
        }
    }

    fn clock(&self) -> MutexGuard<'_, ManualClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the clock forward, running every task that falls due on the way.
    /// Tasks scheduled by a running task are honoured if they fall due
    /// within the same advance.
    pub fn advance(&self, by: Duration) {
        let target = self.clock().elapsed + by;

        loop {
            let next = {
                let mut clock = self.clock();
                clock.timers.retain(|t| !t.token.is_cancelled());
                let index = clock
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.seq))
                    .map(|(i, _)| i);

                match index {
                    Some(index) => {
                        let timer = clock.timers.swap_remove(index);
                        clock.elapsed = timer.due;
                        Some(timer)
                    }
                    None => {
                        clock.elapsed = target;
                        None
                    }
                }
            };

            match next {
                // Run without the lock so the task can schedule more work
                Some(timer) if !timer.token.is_cancelled() => (timer.task)(),
                Some(_) => {}
                None => break,
            }
        }
    }

    /// Time elapsed since the scheduler was created
    pub fn elapsed(&self) -> Duration {
        self.clock().elapsed
    }

    /// Scheduled tasks that have neither run nor been cancelled
    pub fn pending(&self) -> usize {
        self.clock()
            .timers
            .iter()
            .filter(|t| !t.token.is_cancelled())
            .count()
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: ScheduledTask) -> CancelHandle {
        let handle = CancelHandle::new();
        let mut clock = self.clock();
        clock.seq += 1;
        let timer = Timer {
            due: clock.elapsed + delay,
            seq: clock.seq,
            token: handle.token.clone(),
            task,
        };
        clock.timers.push(timer);
        handle
    }

    fn now(&self) -> DateTime<Utc> {
        let clock = self.clock();
        let elapsed = chrono::Duration::from_std(clock.elapsed).unwrap_or(chrono::Duration::zero());
        clock.start + elapsed
    }
}
