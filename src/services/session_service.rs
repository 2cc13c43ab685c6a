//! The quiz session engine.
//!
//! Owns the session state machine and composes the phase timer, the join
//! protocol, answer sync, engagement polling and the change feeds. Every timer
//! and task lives in the [`SessionContext`] handle registry so identity changes
//! and teardown release them in one place.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use time::OffsetDateTime;
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{
        QuizBackend,
        error::BackendError,
        models::{ChangeEvent, FeedTopic, ParticipationStatus},
    },
    config::EngineConfig,
    dto::session::{
        AnswerView, JoinResponse, QuestionView, QuizSummary, SelectAnswerResponse,
        SelectOutcome, SessionSnapshot,
    },
    error::ServiceError,
    services::{
        answer_sync::{AnswerSync, SyncObserver, WriteOutcome},
        engagement,
        join::{JoinCoordinator, JoinOutcome, PreJoinOutcome},
        notices::{Notice, NoticeHub, Redirect},
        realtime::FeedSupervisor,
        visibility::{VisibilityGate, resumption},
    },
    state::{
        Snapshot,
        clock::SharedClock,
        engagement::EngagementTracker,
        phase::{PhaseReading, QuizPhase, read_phase},
        quiz::{Question, QuestionSet, QuizIdentity, QuizRecord},
        session::{LocalAnswer, ParticipationView, SessionContext, SessionData},
        state_machine::{SessionEvent, SessionPhase},
    },
};

const PARTICIPANTS_TABLE: &str = "quiz_participants";
const SLOTS_TABLE: &str = "quiz_slots";

/// Who and what a session is for, plus the process-wide collaborators it shares.
pub struct SessionOptions {
    /// Quiz or slot id the session was opened with.
    pub target_id: Uuid,
    /// Authenticated user, if any. Without one the session is read-only.
    pub user_id: Option<Uuid>,
    /// Wall clock driving the phase timer.
    pub clock: SharedClock,
    /// Visibility/online gate.
    pub gate: VisibilityGate,
    /// Hub user-facing notices are published on.
    pub notices: NoticeHub,
}

struct SessionInner {
    backend: Arc<dyn QuizBackend>,
    clock: SharedClock,
    config: EngineConfig,
    gate: VisibilityGate,
    notices: NoticeHub,
    target_id: Uuid,
    user_id: Option<Uuid>,
    context: SessionContext,
    questions: DashMap<Uuid, QuestionSet>,
    fetching_questions: DashSet<Uuid>,
    answers: AnswerSync,
    joins: JoinCoordinator,
    engagement: Arc<EngagementTracker>,
    load_seq: AtomicU64,
    snapshot: watch::Sender<SessionSnapshot>,
    phase: watch::Sender<SessionPhase>,
}

/// Marks local answers as synced once the backend stored them.
struct SyncedAnswers(Weak<SessionInner>);

impl SyncObserver for SyncedAnswers {
    fn answer_synced(&self, question_id: Uuid, option_id: Uuid) {
        let Some(session) = QuizSession::upgrade(&self.0) else {
            return;
        };
        if let Some(answer) = session.inner.context.data().answers.get_mut(&question_id) {
            if answer.option_id == option_id {
                answer.synced = true;
            }
        }
        tokio::spawn(async move { session.publish().await });
    }
}

/// A single user's session on one quiz.
#[derive(Clone)]
pub struct QuizSession {
    inner: Arc<SessionInner>,
}

impl QuizSession {
    /// Build an idle session; nothing runs until [`QuizSession::start`].
    pub fn new(backend: Arc<dyn QuizBackend>, config: EngineConfig, options: SessionOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let answers = AnswerSync::new(
                backend.clone(),
                options.notices.clone(),
                SyncedAnswers(weak.clone()),
                config.answer_sync,
            );
            answers.set_user(options.user_id);

            SessionInner {
                joins: JoinCoordinator::new(backend.clone(), config.join),
                context: SessionContext::new(Some(config.transition_timeout)),
                backend,
                clock: options.clock,
                config,
                gate: options.gate,
                notices: options.notices,
                target_id: options.target_id,
                user_id: options.user_id,
                questions: DashMap::new(),
                fetching_questions: DashSet::new(),
                answers,
                engagement: Arc::new(EngagementTracker::new()),
                load_seq: AtomicU64::new(0),
                snapshot: watch::channel(SessionSnapshot::loading()).0,
                phase: watch::channel(SessionPhase::Loading).0,
            }
        });

        Self { inner }
    }

    fn weak(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Start the phase timer and the resume watcher, then load the quiz.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.spawn_ticker();
        self.spawn_resume_watcher();
        self.load().await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Watch published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Hub carrying this session's notices.
    pub fn notices(&self) -> &NoticeHub {
        &self.inner.notices
    }

    /// Gate pausing pollers and flushing answers on resumption.
    pub fn gate(&self) -> &VisibilityGate {
        &self.inner.gate
    }

    fn identity(&self) -> Option<QuizIdentity> {
        self.inner
            .context
            .data()
            .quiz
            .as_ref()
            .map(|quiz| quiz.identity)
    }

    fn require_user(&self) -> Result<Uuid, ServiceError> {
        self.inner
            .user_id
            .ok_or_else(|| ServiceError::Unauthorized("no user is attached to the session".into()))
    }

    /// Fetch the quiz or slot and install it. Responses overtaken by a newer
    /// load are discarded.
    pub async fn load(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let seq = inner.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let fetched = inner.backend.fetch_quiz_or_slot(inner.target_id).await;

        if inner.load_seq.load(Ordering::SeqCst) != seq {
            debug!(target_id = %inner.target_id, seq, "discarding stale quiz response");
            return Ok(());
        }

        let record = fetched
            .map_err(ServiceError::from)
            .and_then(|entity| QuizRecord::try_from(entity).map_err(ServiceError::from));
        match record {
            Ok(record) => {
                self.install(record).await;
                Ok(())
            }
            Err(err) => self.fail_load(err).await,
        }
    }

    async fn fail_load(&self, err: ServiceError) -> Result<(), ServiceError> {
        let context = &self.inner.context;
        if context.phase().await != SessionPhase::Loading {
            warn!(error = %err, "quiz refresh failed; keeping the current record");
            return Err(err);
        }

        warn!(target_id = %self.inner.target_id, error = %err, "quiz could not be loaded");
        context.data().error = Some(err.to_string());
        if let Err(plan_err) = context.transition(SessionEvent::LoadFailed).await {
            debug!(error = ?plan_err, "load failure not applied");
        }
        self.publish().await;
        Err(err)
    }

    async fn install(&self, record: QuizRecord) {
        let identity = record.identity;
        let (previous, window_changed) = {
            let mut data = self.inner.context.data();
            let previous = data.quiz.as_ref().map(|quiz| (quiz.identity, quiz.window));
            if previous.is_some_and(|(known, _)| known != identity) {
                let auto_submitted = std::mem::take(&mut data.auto_submitted);
                *data = SessionData {
                    auto_submitted,
                    ..SessionData::default()
                };
            }
            let window_changed = previous.is_some_and(|(_, window)| window != record.window);
            data.quiz = Some(record);
            data.error = None;
            (previous.map(|(known, _)| known), window_changed)
        };

        match previous {
            None => {
                info!(
                    quiz_id = %identity.quiz_id,
                    slot_id = ?identity.slot_id,
                    "quiz loaded"
                );
                self.start_feeds(identity);
            }
            Some(known) if known != identity => {
                info!(
                    previous = %known.guard_key(),
                    current = %identity.guard_key(),
                    "quiz identity changed; releasing timers"
                );
                self.release_identity().await;
                self.start_feeds(identity);
            }
            Some(_) if window_changed => {
                debug!(quiz_id = %identity.quiz_id, "quiz window changed; rescheduling redirect");
                if let Some((_, redirect)) = self.inner.context.handles().redirect.take() {
                    redirect.abort();
                }
            }
            Some(_) => {}
        }

        self.tick().await;
    }

    async fn release_identity(&self) {
        let feeds = self.inner.context.handles().release_identity();
        for feed in &feeds {
            feed.stop().await;
        }
        self.inner.joins.clear();
        self.inner.answers.clear();
        self.inner.engagement.reset();
    }

    /// Leave the error phase and load again.
    pub async fn retry(&self) -> Result<SessionSnapshot, ServiceError> {
        self.inner.context.transition(SessionEvent::Retry).await?;
        self.inner.context.data().error = None;
        info!(target_id = %self.inner.target_id, "retrying quiz load");
        self.publish().await;

        if let Err(err) = self.load().await {
            debug!(error = %err, "retry failed");
        }
        Ok(self.snapshot())
    }

    fn spawn_ticker(&self) {
        let weak = self.weak();
        let period = self.inner.config.tick_interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = QuizSession::upgrade(&weak) else {
                    break;
                };
                session.tick().await;
            }
        });

        if let Some(previous) = self.inner.context.handles().ticker.replace(task) {
            previous.abort();
        }
    }

    fn spawn_resume_watcher(&self) {
        let weak = self.weak();
        let mut gate = self.inner.gate.subscribe();
        let task = tokio::spawn(async move {
            let mut previous = *gate.borrow_and_update();
            while gate.changed().await.is_ok() {
                let next = *gate.borrow_and_update();
                let edge = resumption(previous, next);
                previous = next;

                let Some(session) = QuizSession::upgrade(&weak) else {
                    break;
                };
                if let Some(edge) = edge {
                    let remaining = session.inner.answers.flush().await;
                    debug!(?edge, remaining, "flushed answer queue on resumption");
                }
                session.publish().await;
            }
        });

        if let Some(previous) = self.inner.context.handles().resume_watcher.replace(task) {
            previous.abort();
        }
    }

    /// Recompute the phase and drive its side effects.
    pub async fn tick(&self) {
        let machine = self.inner.context.snapshot().await;
        if machine.phase.is_terminal() || machine.pending.is_some() {
            return;
        }

        let now = self.inner.clock.now();
        let reading = {
            let mut data = self.inner.context.data();
            let Some(quiz) = data.quiz.as_ref() else {
                return;
            };
            let reading = if data.forced_finished {
                PhaseReading {
                    phase: QuizPhase::Finished,
                    time_left: Duration::ZERO,
                }
            } else {
                read_phase(quiz.window, quiz.is_paused(), now)
            };
            data.reading = Some(reading);
            reading
        };

        let phase = if machine.phase == SessionPhase::Loading {
            self.apply(SessionEvent::Loaded(reading.phase)).await
        } else if machine.phase != SessionPhase::from(reading.phase) {
            self.apply(SessionEvent::PhaseChanged(reading.phase)).await
        } else {
            machine.phase
        };

        self.publish().await;
        self.drive(phase).await;
    }

    async fn apply(&self, event: SessionEvent) -> SessionPhase {
        match self.inner.context.transition(event).await {
            Ok(next) => {
                info!(?event, phase = ?next, "session phase changed");
                next
            }
            Err(err) => {
                debug!(?event, error = ?err, "phase change ignored");
                self.inner.context.phase().await
            }
        }
    }

    async fn drive(&self, phase: SessionPhase) {
        let Some((identity, end, participation)) = ({
            let data = self.inner.context.data();
            data.quiz
                .as_ref()
                .map(|quiz| (quiz.identity, quiz.window.end, data.participation.view()))
        }) else {
            return;
        };

        match phase {
            SessionPhase::Waiting => self.ensure_poller(identity),
            SessionPhase::Active => {
                self.ensure_poller(identity);
                self.ensure_joined(identity);
                if participation != ParticipationView::NotJoined {
                    self.spawn_questions(identity.quiz_id);
                }
            }
            SessionPhase::Finished => {
                self.auto_submit(identity).await;
                self.schedule_redirect(identity, end);
            }
            SessionPhase::Completed => self.schedule_redirect(identity, end),
            SessionPhase::Loading | SessionPhase::Error => {}
        }
    }

    fn ensure_poller(&self, identity: QuizIdentity) {
        let mut handles = self.inner.context.handles();
        if handles.poller.as_ref().is_some_and(|poller| !poller.is_finished()) {
            return;
        }

        let inner = &self.inner;
        handles.poller = Some(engagement::spawn(
            inner.backend.clone(),
            inner.engagement.clone(),
            inner.gate.clone(),
            inner.phase.subscribe(),
            identity.engagement_key(),
            inner.config.engagement,
        ));
    }

    fn ensure_joined(&self, identity: QuizIdentity) {
        if self.inner.user_id.is_none() || self.inner.joins.is_guarded(&identity) {
            return;
        }

        let mut handles = self.inner.context.handles();
        if handles.join.as_ref().is_some_and(|join| !join.is_finished()) {
            return;
        }

        let weak = self.weak();
        handles.join = Some(tokio::spawn(async move {
            let Some(session) = QuizSession::upgrade(&weak) else {
                return;
            };
            let Some(outcome) = session.inner.joins.join(&identity).await else {
                return;
            };
            session.record_join(identity, outcome).await;
        }));
    }

    async fn record_join(&self, identity: QuizIdentity, outcome: JoinOutcome) {
        let current = {
            let mut data = self.inner.context.data();
            if data.quiz.as_ref().map(|quiz| quiz.identity) != Some(identity) {
                false
            } else {
                match &outcome {
                    JoinOutcome::Suppressed(_) => data.participation.assume_joined(),
                    JoinOutcome::Ended => data.forced_finished = true,
                    _ => {}
                }
                if let Some(status) = outcome.backend_status() {
                    data.participation.confirm(status);
                }
                true
            }
        };
        if !current {
            debug!(quiz_id = %identity.quiz_id, "join settled for a replaced quiz; ignoring");
            return;
        }

        let quiz_id = identity.participation_key();
        match outcome {
            JoinOutcome::Ended => {
                self.inner.notices.publish(Notice::QuizEnded { quiz_id });
                self.tick().await;
            }
            JoinOutcome::PreJoined => {
                self.inner.notices.publish(Notice::JoinDeferred { quiz_id });
                self.ensure_questions(identity.quiz_id).await;
            }
            JoinOutcome::Joined | JoinOutcome::AlreadyJoined | JoinOutcome::Suppressed(_) => {
                self.ensure_questions(identity.quiz_id).await;
            }
        }
        self.publish().await;
    }

    fn spawn_questions(&self, quiz_id: Uuid) {
        if self.inner.questions.contains_key(&quiz_id)
            || self.inner.fetching_questions.contains(&quiz_id)
        {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move { session.ensure_questions(quiz_id).await });
    }

    async fn ensure_questions(&self, quiz_id: Uuid) {
        let inner = &self.inner;
        if inner.questions.contains_key(&quiz_id) || !inner.fetching_questions.insert(quiz_id) {
            return;
        }

        let fetched = inner.backend.fetch_questions(quiz_id).await;
        inner.fetching_questions.remove(&quiz_id);
        match fetched {
            Ok(entities) => {
                let questions: Vec<Question> = entities.into_iter().map(Question::from).collect();
                info!(%quiz_id, count = questions.len(), "questions loaded");
                inner.questions.insert(quiz_id, Arc::new(questions));
            }
            Err(err) => {
                warn!(%quiz_id, error = %err, "question fetch failed; retrying on the next tick");
            }
        }
        self.publish().await;
    }

    fn start_feeds(&self, identity: QuizIdentity) {
        let inner = &self.inner;
        let mut feeds = Vec::with_capacity(2);

        let participants = match identity.slot_id {
            Some(slot_id) => FeedTopic::rows(PARTICIPANTS_TABLE, "slot_id", slot_id),
            None => FeedTopic::rows(PARTICIPANTS_TABLE, "quiz_id", identity.quiz_id),
        };
        let weak = self.weak();
        let key = identity.engagement_key();
        feeds.push(FeedSupervisor::spawn(
            inner.backend.clone(),
            participants,
            inner.config.realtime,
            Arc::new(move |event: ChangeEvent| {
                let Some(session) = QuizSession::upgrade(&weak) else {
                    return;
                };
                debug!(table = %event.table, kind = %event.kind, "participants changed");
                tokio::spawn(async move {
                    let inner = &session.inner;
                    if let Err(err) =
                        engagement::refresh(inner.backend.as_ref(), &inner.engagement, key).await
                    {
                        warn!(%key, error = %err, "engagement refresh after change failed");
                    }
                    session.publish().await;
                });
            }),
        ));

        if let Some(slot_id) = identity.slot_id {
            let weak = self.weak();
            feeds.push(FeedSupervisor::spawn(
                inner.backend.clone(),
                FeedTopic::rows(SLOTS_TABLE, "id", slot_id),
                inner.config.realtime,
                Arc::new(move |event: ChangeEvent| {
                    let Some(session) = QuizSession::upgrade(&weak) else {
                        return;
                    };
                    debug!(table = %event.table, kind = %event.kind, "slot changed; reloading");
                    tokio::spawn(async move {
                        if let Err(err) = session.load().await {
                            debug!(error = %err, "slot reload failed");
                        }
                    });
                }),
            ));
        }

        inner.context.handles().feeds.extend(feeds);
    }

    /// Record a selection locally and write it through the answer queue.
    pub async fn select(
        &self,
        question_id: Uuid,
        option_id: Uuid,
    ) -> Result<SelectAnswerResponse, ServiceError> {
        let inner = &self.inner;
        let machine = inner.context.snapshot().await;
        let (quiz_id, completed) = {
            let data = inner.context.data();
            (
                data.quiz.as_ref().map(|quiz| quiz.identity.quiz_id),
                data.participation.view() == ParticipationView::Completed,
            )
        };

        if inner.user_id.is_none()
            || machine.phase != SessionPhase::Active
            || machine.pending.is_some()
            || completed
            || inner.answers.is_sealed()
        {
            debug!(%question_id, phase = ?machine.phase, "selection ignored");
            return Ok(SelectAnswerResponse {
                outcome: SelectOutcome::Ignored,
                pending_sync: inner.answers.pending(),
            });
        }

        let questions = quiz_id
            .and_then(|id| inner.questions.get(&id).map(|set| Arc::clone(set.value())))
            .ok_or_else(|| ServiceError::InvalidState("questions are not loaded yet".into()))?;
        let question = questions
            .iter()
            .find(|question| question.id == question_id)
            .ok_or_else(|| ServiceError::NotFound(format!("question `{question_id}`")))?;
        if !question.has_option(option_id) {
            return Err(ServiceError::InvalidInput(format!(
                "option `{option_id}` does not belong to question `{question_id}`"
            )));
        }

        inner.context.data().answers.insert(
            question_id,
            LocalAnswer {
                option_id,
                synced: false,
            },
        );
        self.publish().await;

        let outcome = match inner.answers.write(question_id, option_id).await {
            WriteOutcome::Synced => SelectOutcome::Saved,
            WriteOutcome::Queued => SelectOutcome::Queued,
            WriteOutcome::Superseded => SelectOutcome::Superseded,
            WriteOutcome::Discarded => SelectOutcome::Ignored,
        };
        self.publish().await;

        Ok(SelectAnswerResponse {
            outcome,
            pending_sync: inner.answers.pending(),
        })
    }

    /// Explicit request to take part, before or during the quiz.
    pub async fn pre_join(&self) -> Result<JoinResponse, ServiceError> {
        self.require_user()?;
        let identity = self
            .identity()
            .ok_or_else(|| ServiceError::InvalidState("quiz is not loaded yet".into()))?;

        let active = match self.inner.context.phase().await {
            SessionPhase::Waiting => false,
            SessionPhase::Active => true,
            SessionPhase::Completed => {
                return Ok(JoinResponse {
                    outcome: PreJoinOutcome::Already,
                    participation: ParticipationView::Completed,
                });
            }
            phase => {
                return Err(ServiceError::InvalidState(format!(
                    "cannot join while the session is {phase:?}"
                )));
            }
        };

        match self.inner.joins.pre_join(&identity, active).await {
            Ok(outcome) => {
                if let Some(status) = outcome.backend_status() {
                    self.inner.context.data().participation.confirm(status);
                }
                info!(quiz_id = %identity.quiz_id, ?outcome, "join requested");
                if active && matches!(outcome, PreJoinOutcome::Joined | PreJoinOutcome::Already) {
                    self.ensure_questions(identity.quiz_id).await;
                }
                self.publish().await;
                let participation = self.inner.context.data().participation.view();
                Ok(JoinResponse {
                    outcome,
                    participation,
                })
            }
            Err(BackendError::Ended(reason)) => {
                info!(quiz_id = %identity.quiz_id, %reason, "quiz ended before the join");
                self.inner.context.data().forced_finished = true;
                self.inner.notices.publish(Notice::QuizEnded {
                    quiz_id: identity.participation_key(),
                });
                self.tick().await;
                Err(BackendError::Ended(reason).into())
            }
            Err(err) => {
                warn!(quiz_id = %identity.quiz_id, error = %err, "join request failed");
                Err(err.into())
            }
        }
    }

    /// Submit the answers. Refused while answers are still waiting to sync.
    pub async fn submit(&self) -> Result<SessionSnapshot, ServiceError> {
        let identity = self
            .identity()
            .ok_or_else(|| ServiceError::InvalidState("quiz is not loaded yet".into()))?;
        if self.inner.context.data().participation.view() == ParticipationView::Completed {
            return Ok(self.snapshot());
        }

        self.submit_with(identity, false).await?;
        Ok(self.snapshot())
    }

    async fn auto_submit(&self, identity: QuizIdentity) {
        if self.inner.user_id.is_none() {
            return;
        }
        let eligible = {
            let mut data = self.inner.context.data();
            data.participation.view() == ParticipationView::Joined
                && !data.answers.is_empty()
                && data.auto_submitted.insert(identity.guard_key())
        };
        if !eligible {
            return;
        }

        info!(quiz_id = %identity.quiz_id, "quiz finished; submitting answers");
        if let Err(err) = self.submit_with(identity, true).await {
            warn!(quiz_id = %identity.quiz_id, error = %err, "automatic submission failed");
        }
    }

    async fn submit_with(&self, identity: QuizIdentity, automatic: bool) -> Result<(), ServiceError> {
        let user_id = self.require_user()?;
        let session = self;
        let inner = &self.inner;
        let quiz_id = identity.participation_key();

        let result = inner
            .context
            .run_transition(SessionEvent::Submit, move || async move {
                session.publish().await;
                let remaining = inner.answers.flush().await;
                if remaining > 0 {
                    inner.notices.publish(Notice::SyncPending { pending: remaining });
                    return Err(ServiceError::SyncPending(remaining));
                }

                match inner.backend.submit_participation(user_id, quiz_id).await {
                    Ok(()) => Ok(()),
                    Err(BackendError::Already(reason)) => {
                        debug!(%quiz_id, %reason, "participation already completed");
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            })
            .await;

        if let Err(err) = result {
            self.publish().await;
            return Err(err);
        }

        inner.answers.seal();
        let end = {
            let mut data = inner.context.data();
            data.participation.confirm(ParticipationStatus::Completed);
            data.auto_submitted.insert(identity.guard_key());
            data.quiz.as_ref().map(|quiz| quiz.window.end)
        };
        info!(%quiz_id, automatic, "answers submitted");
        inner
            .notices
            .publish(Notice::Submitted { quiz_id, automatic });
        if let Some(end) = end {
            self.schedule_redirect(identity, end);
        }
        self.publish().await;
        Ok(())
    }

    fn schedule_redirect(&self, identity: QuizIdentity, end: OffsetDateTime) {
        if self.inner.context.data().redirect.is_some() {
            return;
        }

        let key = identity.guard_key();
        let mut handles = self.inner.context.handles();
        if handles
            .redirect
            .as_ref()
            .is_some_and(|(scheduled, _)| *scheduled == key)
        {
            return;
        }

        let due = end + self.inner.config.redirect_grace;
        let delay = Duration::try_from(due - self.inner.clock.now()).unwrap_or_default();
        debug!(quiz_id = %identity.quiz_id, delay_ms = delay.as_millis(), "redirect scheduled");

        let weak = self.weak();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(session) = QuizSession::upgrade(&weak) {
                session.fire_redirect(identity).await;
            }
        });
        if let Some((_, previous)) = handles.redirect.replace((key, task)) {
            previous.abort();
        }
    }

    async fn fire_redirect(&self, identity: QuizIdentity) {
        let redirect = {
            let mut data = self.inner.context.data();
            if data.quiz.as_ref().map(|quiz| quiz.identity) != Some(identity) {
                return;
            }
            let redirect =
                Redirect::to_results(identity.participation_key(), self.inner.clock.now());
            data.redirect = Some(redirect.clone());
            redirect
        };

        info!(path = %redirect.path, "redirecting to results");
        self.inner.notices.publish(Notice::Redirect(redirect));
        self.publish().await;
    }

    /// Stop every timer and feed and forget all session state.
    pub async fn teardown(&self) {
        let inner = &self.inner;
        inner.load_seq.fetch_add(1, Ordering::SeqCst);
        inner.context.teardown().await;
        inner.answers.clear();
        inner.joins.clear();
        inner.engagement.reset();
        inner.questions.clear();
        info!(target_id = %inner.target_id, "quiz session torn down");
    }

    async fn publish(&self) {
        let machine = self.inner.context.snapshot().await;
        let snapshot = self.build_snapshot(machine);

        self.inner.phase.send_if_modified(|phase| {
            let changed = *phase != machine.phase;
            *phase = machine.phase;
            changed
        });
        self.inner.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn build_snapshot(&self, machine: Snapshot) -> SessionSnapshot {
        let inner = &self.inner;
        let pending_sync = inner.answers.pending();
        let engagement = inner.engagement.current();
        let gate = inner.gate.state();

        let data = inner.context.data();
        let participation = data.participation.view();
        let questions = match (&data.quiz, participation) {
            (Some(quiz), ParticipationView::Joined | ParticipationView::Completed) => inner
                .questions
                .get(&quiz.identity.quiz_id)
                .map(|set| set.iter().map(QuestionView::from).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let mut answers: Vec<AnswerView> = data
            .answers
            .iter()
            .map(|(question_id, answer)| AnswerView {
                question_id: *question_id,
                option_id: answer.option_id,
                synced: answer.synced,
            })
            .collect();
        answers.sort_by_key(|answer| answer.question_id);

        SessionSnapshot {
            phase: machine.phase,
            version: machine.version,
            submitting: machine.pending.is_some(),
            time_left_ms: data
                .reading
                .map(|reading| u64::try_from(reading.time_left.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default(),
            quiz: data.quiz.as_ref().map(QuizSummary::from),
            questions,
            participation,
            backend_participation: data.participation.backend,
            answers,
            pending_sync,
            engagement,
            redirect: data.redirect.clone(),
            error: data.error.clone(),
            gate,
        }
    }
}
