/// Wall-clock sources.
pub mod clock;
/// Sequence-guarded participant counts.
pub mod engagement;
/// Time-derived quiz phase.
pub mod phase;
/// Normalized quiz record and identity resolver.
pub mod quiz;
/// Session-scoped data and handle registry.
pub mod session;
/// Top-level session state machine.
pub mod state_machine;

use std::sync::Arc;

use crate::{
    backend::QuizBackend,
    services::{notices::NoticeHub, session_service::QuizSession, visibility::VisibilityGate},
};

pub use self::state_machine::{AbortError, ApplyError, Plan, PlanError, PlanId, Snapshot};

/// Shared handle given to every route.
pub type SharedState = Arc<AppState>;

/// Central application state: the hosted quiz session and the backend it talks to.
pub struct AppState {
    session: QuizSession,
    backend: Arc<dyn QuizBackend>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(session: QuizSession, backend: Arc<dyn QuizBackend>) -> SharedState {
        Arc::new(Self { session, backend })
    }

    /// The session driven by this process.
    pub fn session(&self) -> &QuizSession {
        &self.session
    }

    /// Backend used for health probes.
    pub fn backend(&self) -> &Arc<dyn QuizBackend> {
        &self.backend
    }

    /// Visibility/online gate of the session.
    pub fn gate(&self) -> &VisibilityGate {
        self.session.gate()
    }

    /// Notices raised by the session.
    pub fn notices(&self) -> &NoticeHub {
        self.session.notices()
    }

    /// Whether the backend is currently considered unreachable.
    pub fn is_degraded(&self) -> bool {
        !self.gate().state().online
    }
}
