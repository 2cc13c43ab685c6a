use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{Mutex as AsyncMutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    backend::models::ParticipationStatus,
    error::ServiceError,
    services::{notices::Redirect, realtime::FeedSupervisor},
    state::{
        phase::PhaseReading,
        quiz::QuizRecord,
        state_machine::{
            AbortError, ApplyError, Plan, PlanError, PlanId, SessionEvent, SessionPhase,
            SessionStateMachine, Snapshot,
        },
    },
};

/// Participation as the user sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationView {
    /// No participation yet.
    NotJoined,
    /// Joined or pre-joined.
    Joined,
    /// Answers submitted.
    Completed,
}

/// Participation keeping the backend's three states next to the collapsed view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Participation {
    /// Last status the backend confirmed.
    pub backend: Option<ParticipationStatus>,
    /// Treated as joined although the backend never confirmed it.
    pub assumed: bool,
}

impl Participation {
    /// Record a status confirmed by the backend. Never moves back from completed.
    pub fn confirm(&mut self, status: ParticipationStatus) {
        if self.backend != Some(ParticipationStatus::Completed) {
            self.backend = Some(status);
        }
    }

    /// Treat the user as joined without backend confirmation.
    pub fn assume_joined(&mut self) {
        self.assumed = true;
    }

    /// Two-state view: pre-joined reads as joined.
    pub fn view(&self) -> ParticipationView {
        match self.backend {
            Some(ParticipationStatus::Completed) => ParticipationView::Completed,
            Some(_) => ParticipationView::Joined,
            None if self.assumed => ParticipationView::Joined,
            None => ParticipationView::NotJoined,
        }
    }
}

/// Locally recorded selection for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAnswer {
    /// Most recent selection.
    pub option_id: Uuid,
    /// Whether the backend stored this exact selection.
    pub synced: bool,
}

/// Mutable session data owned by the engine.
#[derive(Debug, Default)]
pub struct SessionData {
    /// Normalized quiz record once loaded.
    pub quiz: Option<QuizRecord>,
    /// Latest phase timer reading.
    pub reading: Option<PhaseReading>,
    /// Selections by question id.
    pub answers: HashMap<Uuid, LocalAnswer>,
    /// Participation of the session user.
    pub participation: Participation,
    /// Set when the backend reported the quiz as over before its end time.
    pub forced_finished: bool,
    /// Guard keys of identities already auto-submitted.
    pub auto_submitted: HashSet<Uuid>,
    /// Redirect once it became due.
    pub redirect: Option<Redirect>,
    /// Load failure shown while in the error phase.
    pub error: Option<String>,
}

/// Every timer and task a session owns.
#[derive(Default)]
pub struct SessionHandles {
    /// Phase timer.
    pub ticker: Option<JoinHandle<()>>,
    /// Visibility/online watcher flushing the answer queue.
    pub resume_watcher: Option<JoinHandle<()>>,
    /// Engagement poller of the current identity.
    pub poller: Option<JoinHandle<()>>,
    /// Automatic join sequence of the current identity.
    pub join: Option<JoinHandle<()>>,
    /// Redirect timer and the guard key it was computed for.
    pub redirect: Option<(Uuid, JoinHandle<()>)>,
    /// Change feeds of the current identity.
    pub feeds: Vec<FeedSupervisor>,
}

impl SessionHandles {
    /// Abort timers bound to the current quiz identity; returns the feeds to stop.
    pub fn release_identity(&mut self) -> Vec<FeedSupervisor> {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(join) = self.join.take() {
            join.abort();
        }
        if let Some((_, redirect)) = self.redirect.take() {
            redirect.abort();
        }
        std::mem::take(&mut self.feeds)
    }

    /// Abort every timer; returns the feeds to stop.
    pub fn release_all(&mut self) -> Vec<FeedSupervisor> {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(watcher) = self.resume_watcher.take() {
            watcher.abort();
        }
        self.release_identity()
    }
}

/// Session-scoped context: state machine, data and every handle, with one teardown path.
pub struct SessionContext {
    machine: RwLock<SessionStateMachine>,
    transition_gate: AsyncMutex<()>,
    transition_timeout: Option<Duration>,
    data: Mutex<SessionData>,
    handles: Mutex<SessionHandles>,
}

impl SessionContext {
    /// Fresh context in the loading phase.
    pub fn new(transition_timeout: Option<Duration>) -> Self {
        Self {
            machine: RwLock::new(SessionStateMachine::new()),
            transition_gate: AsyncMutex::new(()),
            transition_timeout,
            data: Mutex::new(SessionData::default()),
            handles: Mutex::new(SessionHandles::default()),
        }
    }

    /// Lock the session data. Never hold the guard across an await.
    pub fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the handle registry. Never hold the guard across an await.
    pub fn handles(&self) -> MutexGuard<'_, SessionHandles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase.
    pub async fn phase(&self) -> SessionPhase {
        self.machine.read().await.phase()
    }

    /// Snapshot of the state machine.
    pub async fn snapshot(&self) -> Snapshot {
        self.machine.read().await.snapshot()
    }

    /// Apply a transition without attached work.
    pub async fn transition(&self, event: SessionEvent) -> Result<SessionPhase, PlanError> {
        self.machine.write().await.transition(event)
    }

    async fn plan_transition(&self, event: SessionEvent) -> Result<Plan, PlanError> {
        self.machine.write().await.plan(event)
    }

    async fn apply_planned_transition(&self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        self.machine.write().await.apply(plan_id)
    }

    async fn abort_transition(&self, plan_id: PlanId) -> Result<(), AbortError> {
        self.machine.write().await.abort(plan_id)
    }

    /// Plan `event`, run `work`, then apply on success or abort on failure/timeout.
    ///
    /// While the work runs the plan stays pending, so concurrent transitions
    /// (phase ticks, a second submission) are refused.
    pub async fn run_transition<F, Fut, T>(
        &self,
        event: SessionEvent,
        work: F,
    ) -> Result<(T, SessionPhase), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let gate = self.transition_gate.lock().await;
        let Plan { id: plan_id, .. } = self.plan_transition(event).await?;

        let work_future = work();
        let outcome = if let Some(limit) = self.transition_timeout {
            match timeout(limit, work_future).await {
                Ok(result) => result,
                Err(_) => {
                    if let Err(abort_err) = self.abort_transition(plan_id).await {
                        warn!(
                            event = ?event,
                            plan_id = %plan_id,
                            error = ?abort_err,
                            "failed to abort transition after timeout"
                        );
                    }
                    drop(gate);
                    return Err(ServiceError::Timeout);
                }
            }
        } else {
            work_future.await
        };

        match outcome {
            Ok(value) => {
                let next = self.apply_planned_transition(plan_id).await?;
                drop(gate);
                Ok((value, next))
            }
            Err(err) => {
                if let Err(abort_err) = self.abort_transition(plan_id).await {
                    warn!(
                        event = ?event,
                        plan_id = %plan_id,
                        error = ?abort_err,
                        "failed to abort transition after work error"
                    );
                }
                drop(gate);
                Err(err)
            }
        }
    }

    /// Clear every timer, stop every feed and forget the data.
    pub async fn teardown(&self) {
        let feeds = self.handles().release_all();
        for feed in &feeds {
            feed.stop().await;
        }
        *self.data() = SessionData::default();
    }
}
