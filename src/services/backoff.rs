//! Exponential backoff shared by the answer queue, the realtime supervisor and
//! the engagement poller.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::Rng;
use tokio::{task::JoinHandle, time::sleep};

/// Largest exponent applied to the base delay; keeps the multiplication finite.
const MAX_EXPONENT: u32 = 20;

/// Delay schedule `min(cap, base * 2^(attempt - 1))` with optional ± jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay of the first retry.
    pub base: Duration,
    /// Ceiling the schedule never exceeds before jitter.
    pub cap: Duration,
    /// Jitter ratio applied symmetrically, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Policy without jitter.
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.0,
        }
    }

    /// Spread delays by `ratio` in both directions.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Deterministic delay before retry number `attempt` (1-based; 0 reads as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(1 << exponent).min(self.cap)
    }

    /// [`BackoffPolicy::delay`] spread by the configured jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= f64::EPSILON {
            return delay;
        }

        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}

/// Lifecycle of the single timer a [`BackoffScheduler`] owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Nothing scheduled.
    Idle,
    /// A callback is waiting for its delay to elapse.
    Scheduled,
    /// The callback is running.
    Firing,
}

struct TimerSlot {
    state: TimerState,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Schedules at most one pending callback at a time.
///
/// Scheduling while a callback is pending is a no-op; a running callback may
/// re-arm the scheduler for the next round.
#[derive(Clone)]
pub struct BackoffScheduler {
    policy: BackoffPolicy,
    slot: Arc<Mutex<TimerSlot>>,
}

impl BackoffScheduler {
    /// Idle scheduler using `policy` for its delays.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            slot: Arc::new(Mutex::new(TimerSlot {
                state: TimerState::Idle,
                generation: 0,
                handle: None,
            })),
        }
    }

    /// Delay schedule in use.
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Current timer state.
    pub fn state(&self) -> TimerState {
        lock(&self.slot).state
    }

    /// Whether a callback is waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.state() == TimerState::Scheduled
    }

    /// Run `task` after the delay for `attempt`.
    ///
    /// Returns the chosen delay, or `None` when a callback was already pending.
    pub fn schedule<F, Fut>(&self, attempt: u32, task: F) -> Option<Duration>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if slot.state == TimerState::Scheduled {
            return None;
        }

        let delay = self.policy.jittered_delay(attempt);
        slot.generation += 1;
        slot.state = TimerState::Scheduled;

        let generation = slot.generation;
        let shared = self.slot.clone();
        slot.handle = Some(tokio::spawn(async move {
            sleep(delay).await;

            {
                let mut slot = lock(&shared);
                if slot.generation != generation {
                    return;
                }
                slot.state = TimerState::Firing;
            }

            task().await;

            let mut slot = lock(&shared);
            if slot.generation == generation && slot.state == TimerState::Firing {
                slot.state = TimerState::Idle;
                slot.handle = None;
            }
        }));

        Some(delay)
    }

    /// Drop any pending callback and return to idle.
    pub fn cancel(&self) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        slot.state = TimerState::Idle;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
