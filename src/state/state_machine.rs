use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::phase::QuizPhase;

/// Top-level phases of a quiz session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Quiz or slot metadata is being fetched.
    Loading,
    /// Before the opening time, or paused.
    Waiting,
    /// Answers are accepted.
    Active,
    /// The window closed; answers may still need submitting.
    Finished,
    /// Answers submitted. Terminal.
    Completed,
    /// The quiz could not be loaded. Terminal until retried.
    Error,
}

impl SessionPhase {
    /// Phases no tick may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Error)
    }
}

impl From<QuizPhase> for SessionPhase {
    fn from(value: QuizPhase) -> Self {
        match value {
            QuizPhase::Waiting => SessionPhase::Waiting,
            QuizPhase::Active => SessionPhase::Active,
            QuizPhase::Finished => SessionPhase::Finished,
        }
    }
}

/// Events that can be applied to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Quiz metadata arrived; the phase timer produced its first reading.
    Loaded(QuizPhase),
    /// Quiz metadata could not be fetched.
    LoadFailed,
    /// The phase timer crossed a boundary (or the slot was paused/resumed).
    PhaseChanged(QuizPhase),
    /// Answers were submitted, explicitly or automatically.
    Submit,
    /// The user asked to reload after an error.
    Retry,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending,
    /// The requested transition is not valid from the current phase.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// State machine phase changed since the plan was created.
    PhaseMismatch {
        /// Phase when plan was created.
        expected: SessionPhase,
        /// Current phase.
        actual: SessionPhase,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the state machine is currently in.
    pub from: SessionPhase,
    /// Phase the state machine will transition to.
    pub to: SessionPhase,
    /// Event that triggered this transition.
    pub event: SessionEvent,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase of the state machine.
    pub phase: SessionPhase,
    /// Version number (increments on each transition).
    pub version: usize,
    /// Target phase of a planned but not yet applied transition.
    pub pending: Option<SessionPhase>,
}

/// Session lifecycle: `loading -> (waiting | active) -> finished -> completed`,
/// with `error` reachable from `loading`.
///
/// Long-running transitions (submission) are planned first, then applied or
/// aborted once their work settles; while a plan is pending no other
/// transition can be planned.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    version: usize,
    pending: Option<Plan>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Loading,
            version: 0,
            pending: None,
        }
    }
}

impl SessionStateMachine {
    /// Create a new state machine initialised in the loading state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether a planned transition is waiting to be applied.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Create a snapshot of the current state machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Plan a transition by validating that the event can be applied from the current phase.
    pub fn plan(&mut self, event: SessionEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to: next,
            event,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, returning the new phase.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }

        self.phase = plan.to;
        self.version += 1;

        Ok(self.phase)
    }

    /// Abort a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Plan and apply in one step, for transitions without attached work.
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionPhase, PlanError> {
        let plan = self.plan(event)?;
        // The plan was created from the current phase a line above.
        self.apply(plan.id).map_err(|_| PlanError::AlreadyPending)
    }

    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (SessionPhase::Loading, SessionEvent::Loaded(phase)) => phase.into(),
            (SessionPhase::Loading, SessionEvent::LoadFailed) => SessionPhase::Error,
            (SessionPhase::Waiting, SessionEvent::PhaseChanged(QuizPhase::Active)) => {
                SessionPhase::Active
            }
            (
                SessionPhase::Waiting | SessionPhase::Active,
                SessionEvent::PhaseChanged(QuizPhase::Finished),
            ) => SessionPhase::Finished,
            (SessionPhase::Active, SessionEvent::PhaseChanged(QuizPhase::Waiting)) => {
                SessionPhase::Waiting
            }
            (
                SessionPhase::Waiting | SessionPhase::Active | SessionPhase::Finished,
                SessionEvent::Submit,
            ) => SessionPhase::Completed,
            (SessionPhase::Error, SessionEvent::Retry) => SessionPhase::Loading,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
