//! Periodic expiry trigger.
//!
//! The scheduler never touches the registry. It only emits
//! [`SessionCommand::Sweep`] into the owner's channel, so a sweep always runs
//! inside the owner task.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::service::SessionCommand;

/// Default period between expiry sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

impl SchedulerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => SchedulerState::Idle,
            RUNNING => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }
}

/// Emits a sweep every `interval`, first one after an equal delay.
///
/// `Idle -> Running -> Stopped` or `Idle -> Stopped`. Stopping is final.
#[derive(Debug)]
pub struct ExpiryScheduler {
    interval: Duration,
    state: AtomicU8,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ExpiryScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }
}

impl ExpiryScheduler {
    /// A zero interval is bumped to one millisecond
    pub fn new(interval: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            interval: interval.max(Duration::from_millis(1)),
            state: AtomicU8::new(IDLE),
            stop,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Start emitting sweeps into `commands`.
    ///
    /// Returns `false` if the scheduler was already running or stopped.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, commands: mpsc::Sender<SessionCommand>) -> bool {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let mut stop = self.stop.subscribe();
        let period = self.interval;
        let first = Instant::now() + period;
        info!(interval_secs = period.as_secs_f64(), "expiry scheduler started");

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        if *stop.borrow() {
                            break;
                        }
                        let now = Utc::now();
                        debug!(%now, "emitting expiry sweep");
                        let sweep = SessionCommand::Sweep { now, reply: None };
                        if commands.send(sweep).await.is_err() {
                            debug!("session owner gone; scheduler exiting");
                            break;
                        }
                    }
                }
            }
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        true
    }

    /// Stop the scheduler for good.
    ///
    /// Returns `true` only for the call that performed the transition. A sweep
    /// already handed to the owner still runs; no further sweep is emitted.
    pub fn cancel(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == STOPPED {
                return false;
            }
            match self
                .state
                .compare_exchange(current, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.stop.send_replace(true);
        info!(was_running = current == RUNNING, "expiry scheduler stopped");
        true
    }

    /// Wait for the background task to finish after [`cancel`](Self::cancel)
    pub async fn join(&self) {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
