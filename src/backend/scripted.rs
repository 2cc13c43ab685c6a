//! Scripted in-memory backend driving the engine tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep},
};
use uuid::Uuid;

use super::{
    QuizBackend,
    error::{BackendError, BackendResult},
    models::{
        AnswerEntity, ChannelEvent, EngagementEntity, FeedChannel, FeedTopic, JoinTarget,
        QuestionEntity, QuizOrSlot,
    },
};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    FetchQuiz(Uuid),
    FetchQuestions(Uuid),
    Join(JoinTarget),
    PreJoin(JoinTarget),
    Upsert(AnswerEntity),
    Submit(Uuid, Uuid),
    Engagement(Uuid),
    Subscribe(FeedTopic),
    Health,
}

/// Events pushed onto a freshly opened feed channel.
pub type FeedScript = Vec<ChannelEvent>;

#[derive(Default)]
struct Scripts {
    quiz: Option<QuizOrSlot>,
    quiz_errors: VecDeque<BackendError>,
    quiz_delays: VecDeque<Duration>,
    questions: Vec<QuestionEntity>,
    join: VecDeque<BackendResult<()>>,
    join_delay: Duration,
    pre_join: VecDeque<BackendResult<()>>,
    upsert: VecDeque<BackendResult<()>>,
    upsert_delay: Duration,
    submit: VecDeque<BackendResult<()>>,
    engagement: VecDeque<BackendResult<EngagementEntity>>,
    feeds: VecDeque<FeedScript>,
    health: VecDeque<BackendResult<()>>,
}

/// Backend returning queued outcomes per operation and `Ok` once a queue runs dry.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<Scripts>,
    calls: Mutex<Vec<(Instant, Call)>>,
    feed_senders: Mutex<Vec<mpsc::Sender<ChannelEvent>>>,
    removals: Arc<AtomicUsize>,
    offline: AtomicBool,
}

pub fn offline_error() -> BackendError {
    BackendError::unavailable(
        "network unreachable",
        std::io::Error::other("connection refused"),
    )
}

impl ScriptedBackend {
    pub fn new(quiz: QuizOrSlot) -> Arc<Self> {
        let backend = Self::default();
        backend.scripts.lock().unwrap().quiz = Some(quiz);
        Arc::new(backend)
    }

    pub fn with_questions(self: &Arc<Self>, questions: Vec<QuestionEntity>) -> Arc<Self> {
        self.scripts.lock().unwrap().questions = questions;
        self.clone()
    }

    pub fn set_quiz(&self, quiz: QuizOrSlot) {
        self.scripts.lock().unwrap().quiz = Some(quiz);
    }

    pub fn fail_quiz(&self, error: BackendError) {
        self.scripts.lock().unwrap().quiz_errors.push_back(error);
    }

    /// Delay the response of the next quiz fetch.
    pub fn delay_quiz(&self, delay: Duration) {
        self.scripts.lock().unwrap().quiz_delays.push_back(delay);
    }

    pub fn script_join(&self, outcome: BackendResult<()>) {
        self.scripts.lock().unwrap().join.push_back(outcome);
    }

    /// Make every join call take `delay` before answering.
    pub fn delay_joins(&self, delay: Duration) {
        self.scripts.lock().unwrap().join_delay = delay;
    }

    pub fn script_pre_join(&self, outcome: BackendResult<()>) {
        self.scripts.lock().unwrap().pre_join.push_back(outcome);
    }

    pub fn script_upsert(&self, outcome: BackendResult<()>) {
        self.scripts.lock().unwrap().upsert.push_back(outcome);
    }

    /// Make every answer write take `delay` before answering.
    pub fn delay_upserts(&self, delay: Duration) {
        self.scripts.lock().unwrap().upsert_delay = delay;
    }

    pub fn script_submit(&self, outcome: BackendResult<()>) {
        self.scripts.lock().unwrap().submit.push_back(outcome);
    }

    pub fn script_engagement(&self, outcome: BackendResult<EngagementEntity>) {
        self.scripts.lock().unwrap().engagement.push_back(outcome);
    }

    pub fn script_feed(&self, events: FeedScript) {
        self.scripts.lock().unwrap().feeds.push_back(events);
    }

    pub fn script_health(&self, outcome: BackendResult<()>) {
        self.scripts.lock().unwrap().health.push_back(outcome);
    }

    /// Make every answer write fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// Sender of the most recently opened feed channel.
    pub fn last_feed(&self) -> Option<mpsc::Sender<ChannelEvent>> {
        self.feed_senders.lock().unwrap().last().cloned()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }
}

impl QuizBackend for ScriptedBackend {
    fn fetch_quiz_or_slot(&self, id: Uuid) -> BoxFuture<'static, BackendResult<QuizOrSlot>> {
        self.record(Call::FetchQuiz(id));
        let mut scripts = self.scripts.lock().unwrap();
        let outcome = match scripts.quiz_errors.pop_front() {
            Some(err) => Err(err),
            None => scripts
                .quiz
                .clone()
                .ok_or_else(|| BackendError::NotFound(format!("quiz `{id}`"))),
        };
        let delay = scripts.quiz_delays.pop_front();
        Box::pin(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            outcome
        })
    }

    fn fetch_questions(&self, quiz_id: Uuid) -> BoxFuture<'static, BackendResult<Vec<QuestionEntity>>> {
        self.record(Call::FetchQuestions(quiz_id));
        let questions = self.scripts.lock().unwrap().questions.clone();
        Box::pin(async move { Ok(questions) })
    }

    fn join(&self, target: JoinTarget) -> BoxFuture<'static, BackendResult<()>> {
        self.record(Call::Join(target));
        let mut scripts = self.scripts.lock().unwrap();
        let outcome = scripts.join.pop_front().unwrap_or(Ok(()));
        let delay = scripts.join_delay;
        Box::pin(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            outcome
        })
    }

    fn pre_join(&self, target: JoinTarget) -> BoxFuture<'static, BackendResult<()>> {
        self.record(Call::PreJoin(target));
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .pre_join
            .pop_front()
            .unwrap_or(Ok(()));
        Box::pin(async move { outcome })
    }

    fn upsert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, BackendResult<()>> {
        self.record(Call::Upsert(answer));
        let mut scripts = self.scripts.lock().unwrap();
        let outcome = if self.offline.load(Ordering::SeqCst) {
            Err(offline_error())
        } else {
            scripts.upsert.pop_front().unwrap_or(Ok(()))
        };
        let delay = scripts.upsert_delay;
        Box::pin(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            outcome
        })
    }

    fn submit_participation(&self, user_id: Uuid, quiz_id: Uuid) -> BoxFuture<'static, BackendResult<()>> {
        self.record(Call::Submit(user_id, quiz_id));
        let outcome = self.scripts.lock().unwrap().submit.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { outcome })
    }

    fn fetch_engagement(&self, key: Uuid) -> BoxFuture<'static, BackendResult<EngagementEntity>> {
        self.record(Call::Engagement(key));
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .engagement
            .pop_front()
            .unwrap_or(Ok(EngagementEntity::default()));
        Box::pin(async move { outcome })
    }

    fn subscribe_changes(&self, topic: FeedTopic) -> BoxFuture<'static, BackendResult<FeedChannel>> {
        self.record(Call::Subscribe(topic));
        let script = self.scripts.lock().unwrap().feeds.pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        for event in script {
            let _ = tx.try_send(event);
        }
        self.feed_senders.lock().unwrap().push(tx);
        let removals = self.removals.clone();
        Box::pin(async move {
            Ok(FeedChannel::new(rx, async move {
                removals.fetch_add(1, Ordering::SeqCst);
            }))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, BackendResult<()>> {
        self.record(Call::Health);
        let outcome = self.scripts.lock().unwrap().health.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { outcome })
    }
}
