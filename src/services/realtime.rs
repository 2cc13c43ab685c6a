//! Self-healing subscription to backend change notifications.
//!
//! `idle -> subscribing -> joined -> (closed | error | timeout) -> retry_scheduled
//! -> subscribing -> ... -> exhausted`. Change events are only forwarded to a
//! caller-supplied handler; the supervisor never touches session state.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::{
    backend::{
        QuizBackend,
        error::BackendError,
        models::{ChangeEvent, ChannelEvent, FeedChannel, FeedTopic},
    },
    config::RealtimeConfig,
};

/// Observable state of one supervised feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedStatus {
    /// Not started.
    Idle,
    /// Waiting for the backend to acknowledge subscription number `attempt`.
    Subscribing {
        /// Consecutive attempt number, starting at 1.
        attempt: u32,
    },
    /// Acknowledged and delivering changes.
    Joined,
    /// Waiting for the reconnect delay after a failed attempt.
    RetryScheduled {
        /// Attempt that failed.
        attempt: u32,
        /// Delay before the next attempt, in milliseconds.
        delay_ms: u64,
    },
    /// Gave up after too many consecutive failures.
    Exhausted,
    /// Stopped by its owner.
    Stopped,
}

/// Callback receiving change notifications.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Debug)]
enum Failure {
    Subscribe(BackendError),
    Timeout,
    Channel(String),
    Closed,
}

enum AttemptEnd {
    Stopped,
    Failed { failure: Failure, joined: bool },
}

/// Owner handle of a supervised feed. Dropping it without [`FeedSupervisor::stop`]
/// aborts the task and leaves the channel to be closed remotely.
pub struct FeedSupervisor {
    topic: FeedTopic,
    status: watch::Receiver<FeedStatus>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedSupervisor {
    /// Start supervising `topic`; the first subscription is attempted immediately.
    pub fn spawn(
        backend: Arc<dyn QuizBackend>,
        topic: FeedTopic,
        config: RealtimeConfig,
        on_change: ChangeHandler,
    ) -> Self {
        let (status_tx, status) = watch::channel(FeedStatus::Idle);
        let (stop, stop_rx) = watch::channel(false);

        let worker = Worker {
            backend,
            topic: topic.clone(),
            config,
            on_change,
            status: status_tx,
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            topic,
            status,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// Topic being supervised.
    pub fn topic(&self) -> &FeedTopic {
        &self.topic
    }

    /// Current status.
    pub fn status(&self) -> FeedStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn watch(&self) -> watch::Receiver<FeedStatus> {
        self.status.clone()
    }

    /// Cancel any pending retry or join timeout and remove the open channel.
    ///
    /// Waits for the removal to finish. Calling it again is a no-op.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        let _ = self.stop.send(true);
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                warn!(table = %self.topic.table, error = %err, "feed supervisor task failed");
            }
        }
    }
}

impl Drop for FeedSupervisor {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

struct Worker {
    backend: Arc<dyn QuizBackend>,
    topic: FeedTopic,
    config: RealtimeConfig,
    on_change: ChangeHandler,
    status: watch::Sender<FeedStatus>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let policy = self.config.policy();
        let mut attempt = 1;

        loop {
            self.status.send_replace(FeedStatus::Subscribing { attempt });

            let (failure, joined) = match self.attempt().await {
                AttemptEnd::Stopped => break,
                AttemptEnd::Failed { failure, joined } => (failure, joined),
            };

            if joined {
                // A channel that was acknowledged earns a fresh retry budget.
                attempt = 1;
            }
            if attempt >= self.config.max_attempts {
                warn!(
                    table = %self.topic.table,
                    attempts = attempt,
                    ?failure,
                    "change feed retries exhausted; giving up"
                );
                self.status.send_replace(FeedStatus::Exhausted);
                return;
            }

            let delay = policy.jittered_delay(attempt);
            info!(
                table = %self.topic.table,
                attempt,
                delay_ms = delay.as_millis() as u64,
                ?failure,
                "change feed failed; reconnecting"
            );
            self.status.send_replace(FeedStatus::RetryScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            if !self.wait(delay).await {
                break;
            }
            attempt += 1;
        }

        self.status.send_replace(FeedStatus::Stopped);
    }

    async fn attempt(&mut self) -> AttemptEnd {
        let subscribe = self.backend.subscribe_changes(self.topic.clone());
        let mut channel = tokio::select! {
            biased;
            _ = stopped(&mut self.stop) => return AttemptEnd::Stopped,
            result = subscribe => match result {
                Ok(channel) => channel,
                Err(err) => {
                    return AttemptEnd::Failed {
                        failure: Failure::Subscribe(err),
                        joined: false,
                    };
                }
            },
        };

        let end = self.consume(&mut channel).await;
        channel.remove().await;
        end
    }

    async fn consume(&mut self, channel: &mut FeedChannel) -> AttemptEnd {
        let deadline = Instant::now() + self.config.join_timeout;
        let mut joined = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return AttemptEnd::Stopped,
                _ = sleep_until(deadline), if !joined => {
                    return AttemptEnd::Failed { failure: Failure::Timeout, joined };
                }
                event = channel.next() => event,
            };

            let failure = match event {
                Some(ChannelEvent::Joined) => {
                    if !joined {
                        joined = true;
                        debug!(table = %self.topic.table, filter = %self.topic.filter, "change feed joined");
                        self.status.send_replace(FeedStatus::Joined);
                    }
                    continue;
                }
                Some(ChannelEvent::Change(change)) => {
                    (self.on_change)(change);
                    continue;
                }
                Some(ChannelEvent::Error(message)) => Failure::Channel(message),
                Some(ChannelEvent::Closed) | None => Failure::Closed,
            };
            return AttemptEnd::Failed { failure, joined };
        }
    }

    /// Sleep for `delay`; `false` when stopped first.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = stopped(&mut self.stop) => false,
            _ = sleep(delay) => true,
        }
    }
}

/// Resolve once the owner asked to stop (or went away).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
