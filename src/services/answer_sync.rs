//! Answer writes with a bounded, coalescing retry queue.
//!
//! Every selection is written straight through. A failed write lands in the
//! queue (one entry per question, newest selection wins) and the whole queue is
//! retried on one backoff schedule keyed to its head entry.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    backend::{QuizBackend, error::BackendError, models::AnswerEntity},
    config::AnswerSyncConfig,
    services::{
        backoff::BackoffScheduler,
        notices::{Notice, NoticeHub},
    },
};

/// A failed answer write waiting for its next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RetryEntry {
    /// Question the answer belongs to.
    pub question_id: Uuid,
    /// Selected option.
    pub option_id: Uuid,
    /// Failed writes so far.
    pub attempt: u32,
}

/// What happened to a direct write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The backend stored the answer.
    Synced,
    /// The write failed and the answer waits in the retry queue.
    Queued,
    /// A newer selection for the same question superseded this one.
    Superseded,
    /// The queue is sealed or has no user; nothing was written.
    Discarded,
}

/// Receives confirmation that an answer reached the backend.
pub trait SyncObserver: Send + Sync + 'static {
    /// `option_id` was stored for `question_id`.
    fn answer_synced(&self, question_id: Uuid, option_id: Uuid);
}

impl SyncObserver for () {
    fn answer_synced(&self, _question_id: Uuid, _option_id: Uuid) {}
}

#[derive(Default)]
struct QueueState {
    user_id: Option<Uuid>,
    sealed: bool,
    entries: IndexMap<Uuid, RetryEntry>,
    latest: HashMap<Uuid, Uuid>,
    warned: HashSet<Uuid>,
    writing: usize,
}

impl QueueState {
    fn is_latest(&self, question_id: Uuid, option_id: Uuid) -> bool {
        self.latest.get(&question_id) == Some(&option_id)
    }

    /// Insert at the back, replacing any entry for the same question.
    fn push(&mut self, entry: RetryEntry) {
        self.entries.shift_remove(&entry.question_id);
        self.entries.insert(entry.question_id, entry);
    }

    fn enforce_cap(&mut self, cap: usize) -> usize {
        let overflow = self.entries.len().saturating_sub(cap);
        for _ in 0..overflow {
            self.entries.shift_remove_index(0);
        }
        overflow
    }
}

struct Shared {
    backend: Arc<dyn QuizBackend>,
    notices: NoticeHub,
    observer: Box<dyn SyncObserver>,
    config: AnswerSyncConfig,
    scheduler: BackoffScheduler,
    state: Mutex<QueueState>,
    flushing: AsyncMutex<()>,
}

/// Counts a direct write as unsettled until it finishes or is dropped.
struct WriteInFlight<'a>(&'a AnswerSync);

impl<'a> WriteInFlight<'a> {
    fn enter(sync: &'a AnswerSync, state: &mut QueueState) -> Self {
        state.writing += 1;
        Self(sync)
    }
}

impl Drop for WriteInFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.writing = state.writing.saturating_sub(1);
    }
}

/// The only writer of answer rows.
#[derive(Clone)]
pub struct AnswerSync {
    shared: Arc<Shared>,
}

impl AnswerSync {
    /// Build an empty queue without a user.
    pub fn new(
        backend: Arc<dyn QuizBackend>,
        notices: NoticeHub,
        observer: impl SyncObserver,
        config: AnswerSyncConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                notices,
                observer: Box::new(observer),
                config,
                scheduler: BackoffScheduler::new(config.policy()),
                state: Mutex::new(QueueState::default()),
                flushing: AsyncMutex::new(()),
            }),
        }
    }

    /// Set the user answers are written for.
    pub fn set_user(&self, user_id: Option<Uuid>) {
        self.lock().user_id = user_id;
    }

    /// Answers waiting for a retry.
    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Queue contents, oldest first.
    pub fn entries(&self) -> Vec<RetryEntry> {
        self.lock().entries.values().copied().collect()
    }

    /// Whether writes are refused because the participation is completed.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Write a selection straight through, queueing it on failure.
    pub async fn write(&self, question_id: Uuid, option_id: Uuid) -> WriteOutcome {
        let (user_id, _in_flight) = {
            let mut state = self.lock();
            let Some(user_id) = state.user_id.filter(|_| !state.sealed) else {
                return WriteOutcome::Discarded;
            };
            state.latest.insert(question_id, option_id);
            (user_id, WriteInFlight::enter(self, &mut state))
        };

        let answer = AnswerEntity {
            user_id,
            question_id,
            option_id,
        };
        match self.shared.backend.upsert_answer(answer).await {
            Ok(()) => {
                self.confirm(answer);
                WriteOutcome::Synced
            }
            Err(err) => {
                warn!(%question_id, error = %err, "answer write failed; queueing for retry");
                self.enqueue(RetryEntry {
                    question_id,
                    option_id,
                    attempt: 1,
                })
            }
        }
    }

    /// Retry every queued answer once. Returns the number of answers not yet
    /// stored: those still queued plus direct writes that have not settled.
    ///
    /// Flushes run one at a time; a caller arriving during a flush waits for
    /// it and then retries whatever it left behind. Entries stay queued while
    /// their write is in flight, so a flush dropped midway loses nothing.
    pub fn flush(&self) -> BoxFuture<'static, usize> {
        let this = self.clone();
        Box::pin(async move { this.drain().await })
    }

    /// Refuse every further write and forget queued ones.
    pub fn seal(&self) {
        self.shared.scheduler.cancel();
        let mut state = self.lock();
        state.sealed = true;
        let dropped = state.entries.len();
        state.entries.clear();
        if dropped > 0 {
            info!(dropped, "answer queue sealed with entries still queued");
        }
    }

    /// Cancel the retry timer and forget every entry and warning.
    pub fn clear(&self) {
        self.shared.scheduler.cancel();
        let mut state = self.lock();
        state.entries.clear();
        state.latest.clear();
        state.warned.clear();
    }

    async fn drain(&self) -> usize {
        let _serial = self.shared.flushing.lock().await;
        let batch: Vec<RetryEntry> = {
            let mut state = self.lock();
            if state.sealed || state.user_id.is_none() {
                if !state.entries.is_empty() {
                    debug!(count = state.entries.len(), "dropping queued answers after completion");
                    state.entries.clear();
                }
                Vec::new()
            } else {
                state.entries.values().copied().collect()
            }
        };
        if !batch.is_empty() {
            debug!(count = batch.len(), "flushing answer queue");
        }

        for entry in batch {
            let Some(user_id) = self.writable_user() else {
                debug!(question_id = %entry.question_id, "queue sealed during flush; stopping");
                break;
            };

            let answer = AnswerEntity {
                user_id,
                question_id: entry.question_id,
                option_id: entry.option_id,
            };
            match self.shared.backend.upsert_answer(answer).await {
                Ok(()) => self.confirm(answer),
                Err(err) => self.record_failure(entry, &err),
            }
        }

        let (unsettled, head_attempt) = {
            let state = self.lock();
            (
                state.entries.len() + state.writing,
                state.entries.first().map(|(_, entry)| entry.attempt),
            )
        };

        if let Some(attempt) = head_attempt {
            self.arm(attempt);
        }
        unsettled
    }

    fn writable_user(&self) -> Option<Uuid> {
        let state = self.lock();
        state.user_id.filter(|_| !state.sealed)
    }

    /// Count a failed retry against the queued entry, unless a newer
    /// selection replaced it meanwhile.
    fn record_failure(&self, entry: RetryEntry, err: &BackendError) {
        let mut state = self.lock();
        let Some(queued) = state.entries.get_mut(&entry.question_id) else {
            return;
        };
        if queued.option_id != entry.option_id || queued.attempt != entry.attempt {
            return;
        }

        let attempt = entry.attempt + 1;
        if attempt > self.shared.config.max_attempts {
            state.entries.shift_remove(&entry.question_id);
            warn!(
                question_id = %entry.question_id,
                attempts = entry.attempt,
                error = %err,
                "answer retries exhausted; dropping"
            );
            self.shared.notices.publish(Notice::AnswerDropped {
                question_id: entry.question_id,
            });
        } else {
            debug!(question_id = %entry.question_id, attempt, error = %err, "answer retry failed");
            queued.attempt = attempt;
        }
    }

    fn enqueue(&self, entry: RetryEntry) -> WriteOutcome {
        let head_attempt = {
            let mut state = self.lock();
            if state.sealed || state.user_id.is_none() {
                return WriteOutcome::Discarded;
            }
            if !state.is_latest(entry.question_id, entry.option_id) {
                return WriteOutcome::Superseded;
            }

            state.push(entry);
            let evicted = state.enforce_cap(self.shared.config.max_queue);
            if evicted > 0 {
                warn!(evicted, "answer queue full; evicted oldest entries");
            }
            if state.warned.insert(entry.question_id) {
                self.shared.notices.publish(Notice::AnswerQueued {
                    question_id: entry.question_id,
                });
            }
            state.entries.first().map(|(_, head)| head.attempt)
        };

        if let Some(attempt) = head_attempt {
            self.arm(attempt);
        }
        WriteOutcome::Queued
    }

    fn confirm(&self, answer: AnswerEntity) {
        let current = {
            let mut state = self.lock();
            let current = state.is_latest(answer.question_id, answer.option_id);
            if current
                && state
                    .entries
                    .get(&answer.question_id)
                    .is_some_and(|entry| entry.option_id == answer.option_id)
            {
                state.entries.shift_remove(&answer.question_id);
            }
            current
        };

        if current {
            self.shared
                .observer
                .answer_synced(answer.question_id, answer.option_id);
        } else {
            debug!(question_id = %answer.question_id, "stale answer write landed; newer selection pending");
        }
    }

    fn arm(&self, attempt: u32) {
        let this = self.clone();
        if let Some(delay) = self.shared.scheduler.schedule(attempt, move || async move {
            this.flush().await;
        }) {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "answer retry scheduled");
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;
    use tokio::time::{Instant, sleep};

    use super::*;
    use crate::backend::{
        models::{QuizEntity, QuizOrSlot},
        scripted::{Call, ScriptedBackend, offline_error},
    };

    const USER: Uuid = Uuid::from_u128(0xaa);

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Uuid, Uuid)>>);

    impl SyncObserver for Arc<Recorder> {
        fn answer_synced(&self, question_id: Uuid, option_id: Uuid) {
            self.0.lock().unwrap().push((question_id, option_id));
        }
    }

    fn backend() -> Arc<ScriptedBackend> {
        ScriptedBackend::new(QuizOrSlot::Legacy(QuizEntity {
            id: Uuid::from_u128(1),
            title: "Quiz".into(),
            category: None,
            start_time: datetime!(2026-01-01 10:00 UTC),
            end_time: datetime!(2026-01-01 10:05 UTC),
            prizes: vec![],
            prize_unit: String::new(),
        }))
    }

    fn config() -> AnswerSyncConfig {
        AnswerSyncConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
            max_queue: 50,
        }
    }

    fn queue(backend: &Arc<ScriptedBackend>, notices: &NoticeHub) -> (AnswerSync, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let sync = AnswerSync::new(backend.clone(), notices.clone(), recorder.clone(), config());
        sync.set_user(Some(USER));
        (sync, recorder)
    }

    fn upserts(backend: &ScriptedBackend) -> Vec<(Instant, AnswerEntity)> {
        backend
            .timed_calls()
            .into_iter()
            .filter_map(|(at, call)| match call {
                Call::Upsert(answer) => Some((at, answer)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn successful_write_is_reported_once() {
        let backend = backend();
        let (sync, recorder) = queue(&backend, &NoticeHub::default());
        let (q, o) = (Uuid::from_u128(10), Uuid::from_u128(11));

        assert_eq!(sync.write(q, o).await, WriteOutcome::Synced);
        assert_eq!(sync.pending(), 0);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(q, o)]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_selection_replaces_queued_entry() {
        let backend = backend();
        let notices = NoticeHub::default();
        let mut received = notices.subscribe();
        let (sync, _) = queue(&backend, &notices);
        backend.set_offline(true);
        let q = Uuid::from_u128(10);

        assert_eq!(sync.write(q, Uuid::from_u128(11)).await, WriteOutcome::Queued);
        assert_eq!(sync.write(q, Uuid::from_u128(12)).await, WriteOutcome::Queued);

        assert_eq!(
            sync.entries(),
            vec![RetryEntry {
                question_id: q,
                option_id: Uuid::from_u128(12),
                attempt: 1,
            }]
        );
        assert_eq!(received.recv().await.unwrap(), Notice::AnswerQueued { question_id: q });
        assert!(received.try_recv().is_err(), "warned twice for one question");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_the_doubling_schedule() {
        let backend = backend();
        let (sync, recorder) = queue(&backend, &NoticeHub::default());
        for _ in 0..3 {
            backend.script_upsert(Err(offline_error()));
        }
        let (q, o) = (Uuid::from_u128(10), Uuid::from_u128(11));
        let started = Instant::now();

        assert_eq!(sync.write(q, o).await, WriteOutcome::Queued);
        sleep(Duration::from_secs(10)).await;

        let offsets: Vec<_> = upserts(&backend)
            .into_iter()
            .map(|(at, _)| at - started)
            .collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(7),
            ]
        );
        assert_eq!(sync.pending(), 0);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(q, o)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_entry_is_dropped_with_a_notice() {
        let backend = backend();
        let notices = NoticeHub::default();
        let mut received = notices.subscribe();
        let (sync, _) = queue(&backend, &notices);
        backend.set_offline(true);
        let q = Uuid::from_u128(10);

        sync.write(q, Uuid::from_u128(11)).await;
        sleep(Duration::from_secs(120)).await;

        assert_eq!(sync.pending(), 0);
        // one direct write plus `max_attempts` retries
        assert_eq!(upserts(&backend).len(), 6);
        assert_eq!(received.recv().await.unwrap(), Notice::AnswerQueued { question_id: q });
        assert_eq!(received.recv().await.unwrap(), Notice::AnswerDropped { question_id: q });
    }

    #[tokio::test(start_paused = true)]
    async fn cap_keeps_the_most_recent_answers() {
        let backend = backend();
        let (sync, _) = queue(&backend, &NoticeHub::default());
        backend.set_offline(true);

        for n in 0..60u128 {
            sync.write(Uuid::from_u128(100 + n), Uuid::from_u128(1_000 + n)).await;
        }

        let kept: Vec<_> = sync.entries().iter().map(|entry| entry.question_id).collect();
        let expected: Vec<_> = (10..60u128).map(|n| Uuid::from_u128(100 + n)).collect();
        assert_eq!(kept, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn sealed_queue_drops_entries_silently() {
        let backend = backend();
        let (sync, _) = queue(&backend, &NoticeHub::default());
        backend.set_offline(true);
        sync.write(Uuid::from_u128(10), Uuid::from_u128(11)).await;

        sync.seal();
        backend.set_offline(false);
        sleep(Duration::from_secs(5)).await;

        assert_eq!(upserts(&backend).len(), 1);
        assert_eq!(
            sync.write(Uuid::from_u128(10), Uuid::from_u128(12)).await,
            WriteOutcome::Discarded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flush_drains_after_reconnect() {
        let backend = backend();
        let (sync, recorder) = queue(&backend, &NoticeHub::default());
        backend.set_offline(true);
        sync.write(Uuid::from_u128(10), Uuid::from_u128(11)).await;
        sync.write(Uuid::from_u128(20), Uuid::from_u128(21)).await;

        backend.set_offline(false);
        assert_eq!(sync.flush().await, 0);
        assert_eq!(recorder.0.lock().unwrap().len(), 2);

        // the timer armed earlier finds nothing left to do
        sleep(Duration::from_secs(2)).await;
        assert_eq!(upserts(&backend).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_the_retry_in_flight() {
        let backend = backend();
        let (sync, recorder) = queue(&backend, &NoticeHub::default());
        let (q, o) = (Uuid::from_u128(10), Uuid::from_u128(11));
        backend.set_offline(true);
        sync.write(q, o).await;

        // the timer retry starts at 1s and fails at 4s
        backend.delay_upserts(Duration::from_secs(3));
        sleep(Duration::from_millis(1_500)).await;
        backend.set_offline(false);
        let started = Instant::now();

        assert_eq!(sync.flush().await, 0);
        assert_eq!(Instant::now() - started, Duration::from_millis(5_500));
        assert_eq!(*recorder.0.lock().unwrap(), vec![(q, o)]);
        assert_eq!(sync.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_counts_direct_writes_still_running() {
        let backend = backend();
        let (sync, _) = queue(&backend, &NoticeHub::default());
        backend.delay_upserts(Duration::from_secs(3));

        let writer = tokio::spawn({
            let sync = sync.clone();
            async move { sync.write(Uuid::from_u128(10), Uuid::from_u128(11)).await }
        });
        sleep(Duration::from_secs(1)).await;

        assert_eq!(sync.flush().await, 1);
        assert_eq!(writer.await.unwrap(), WriteOutcome::Synced);
        assert_eq!(sync.flush().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_flush_keeps_entries_queued() {
        let backend = backend();
        let (sync, recorder) = queue(&backend, &NoticeHub::default());
        let (q, o) = (Uuid::from_u128(10), Uuid::from_u128(11));
        backend.set_offline(true);
        sync.write(q, o).await;

        backend.set_offline(false);
        backend.delay_upserts(Duration::from_secs(12));
        let flushed = tokio::time::timeout(Duration::from_secs(10), sync.flush()).await;

        assert!(flushed.is_err());
        assert_eq!(
            sync.entries(),
            vec![RetryEntry {
                question_id: q,
                option_id: o,
                attempt: 1,
            }]
        );

        // the timer flush queued behind the abandoned one delivers the answer
        sleep(Duration::from_secs(13)).await;
        assert_eq!(sync.pending(), 0);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(q, o)]);
    }
}
