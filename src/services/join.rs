//! Join and pre-join protocol.
//!
//! The backend may still report a freshly opened quiz as not active, so joins
//! are retried within a small budget and fall back to a pre-join. Every
//! outcome short of the quiz having ended leaves the user treated as joined.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    backend::{QuizBackend, error::BackendError, models::ParticipationStatus},
    config::JoinConfig,
    state::quiz::QuizIdentity,
};

/// Result of the automatic join sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The backend accepted the join.
    Joined,
    /// The participation already existed.
    AlreadyJoined,
    /// Joins kept failing; a pre-join was recorded instead.
    PreJoined,
    /// Joins and the pre-join fallback failed; retries are suppressed anyway.
    Suppressed(String),
    /// The backend reported the quiz as over.
    Ended,
}

impl JoinOutcome {
    /// Participation status to record for this outcome, if the backend confirmed one.
    pub fn backend_status(&self) -> Option<ParticipationStatus> {
        match self {
            JoinOutcome::Joined | JoinOutcome::AlreadyJoined => Some(ParticipationStatus::Joined),
            JoinOutcome::PreJoined => Some(ParticipationStatus::PreJoined),
            JoinOutcome::Suppressed(_) | JoinOutcome::Ended => None,
        }
    }
}

/// Result of an explicit join/pre-join request by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PreJoinOutcome {
    /// Participation already recorded.
    Already,
    /// Joined an active quiz.
    Joined,
    /// Intent recorded before the quiz opened.
    PreJoined,
    /// The quiz is opening; the automatic join will follow up.
    ScheduledRetry,
}

impl PreJoinOutcome {
    /// Participation status to record for this outcome, if the backend confirmed one.
    pub fn backend_status(self) -> Option<ParticipationStatus> {
        match self {
            PreJoinOutcome::Joined | PreJoinOutcome::Already => Some(ParticipationStatus::Joined),
            PreJoinOutcome::PreJoined | PreJoinOutcome::ScheduledRetry => {
                Some(ParticipationStatus::PreJoined)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    InFlight,
    Done,
}

/// Claims the in-flight guard of one identity; released unless finished.
struct InFlightGuard<'a> {
    guards: &'a DashMap<Uuid, GuardState>,
    key: Uuid,
}

impl InFlightGuard<'_> {
    fn finish(self) {
        self.guards.insert(self.key, GuardState::Done);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.guards
            .remove_if(&self.key, |_, state| *state == GuardState::InFlight);
    }
}

/// Runs at most one join sequence per quiz identity.
pub struct JoinCoordinator {
    backend: Arc<dyn QuizBackend>,
    config: JoinConfig,
    guards: DashMap<Uuid, GuardState>,
}

impl JoinCoordinator {
    /// Coordinator without any guard set.
    pub fn new(backend: Arc<dyn QuizBackend>, config: JoinConfig) -> Self {
        Self {
            backend,
            config,
            guards: DashMap::new(),
        }
    }

    /// Whether a sequence is running or finished for `identity`.
    pub fn is_guarded(&self, identity: &QuizIdentity) -> bool {
        self.guards.contains_key(&identity.guard_key())
    }

    /// Forget the guard of `identity` so it may join again.
    pub fn reset(&self, identity: &QuizIdentity) {
        self.guards.remove(&identity.guard_key());
    }

    /// Forget every guard.
    pub fn clear(&self) {
        self.guards.clear();
    }

    /// Join an active quiz. `None` when a sequence already ran or is running.
    pub async fn join(&self, identity: &QuizIdentity) -> Option<JoinOutcome> {
        let key = identity.guard_key();
        match self.guards.entry(key) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(GuardState::InFlight);
            }
        }

        let outcome = self.run(identity).await;
        self.guards.insert(key, GuardState::Done);
        Some(outcome)
    }

    async fn run(&self, identity: &QuizIdentity) -> JoinOutcome {
        let target = identity.join_target();
        let attempts = self.config.attempts.max(1);

        for attempt in 1..=attempts {
            match self.backend.join(target).await {
                Ok(()) => {
                    info!(?target, attempt, "joined quiz");
                    return JoinOutcome::Joined;
                }
                Err(BackendError::Already(reason)) => {
                    debug!(?target, %reason, "participation already recorded");
                    return JoinOutcome::AlreadyJoined;
                }
                Err(BackendError::Ended(reason)) => {
                    info!(?target, %reason, "quiz ended before join");
                    return JoinOutcome::Ended;
                }
                Err(BackendError::NotActive(reason)) => {
                    debug!(?target, attempt, %reason, "quiz not active yet");
                    if attempt < attempts {
                        sleep(self.config.grace).await;
                    }
                }
                Err(err) => {
                    warn!(?target, attempt, error = %err, "join failed; giving up on retries");
                    break;
                }
            }
        }

        match self.backend.pre_join(target).await {
            Ok(()) | Err(BackendError::Already(_)) => {
                info!(?target, "join fell back to pre-join");
                JoinOutcome::PreJoined
            }
            Err(BackendError::Ended(_)) => JoinOutcome::Ended,
            Err(err) => {
                warn!(?target, error = %err, "pre-join fallback failed; suppressing further joins");
                JoinOutcome::Suppressed(err.to_string())
            }
        }
    }

    /// Explicit user request to take part, before or during the quiz.
    pub async fn pre_join(
        &self,
        identity: &QuizIdentity,
        active: bool,
    ) -> Result<PreJoinOutcome, BackendError> {
        let key = identity.guard_key();
        let guard = match self.guards.entry(key) {
            Entry::Occupied(slot) => {
                return Ok(match *slot.get() {
                    GuardState::Done => PreJoinOutcome::Already,
                    GuardState::InFlight => PreJoinOutcome::ScheduledRetry,
                });
            }
            Entry::Vacant(slot) if active => {
                slot.insert(GuardState::InFlight);
                Some(InFlightGuard {
                    guards: &self.guards,
                    key,
                })
            }
            Entry::Vacant(_) => None,
        };

        let target = identity.join_target();
        if let Some(guard) = guard {
            match self.backend.join(target).await {
                Ok(()) => {
                    guard.finish();
                    return Ok(PreJoinOutcome::Joined);
                }
                Err(BackendError::Already(_)) => {
                    guard.finish();
                    return Ok(PreJoinOutcome::Already);
                }
                Err(BackendError::NotActive(reason)) => {
                    debug!(?target, %reason, "join refused at click time; pre-joining");
                }
                Err(err) => return Err(err),
            }
        }

        match self.backend.pre_join(target).await {
            Ok(()) if active => Ok(PreJoinOutcome::ScheduledRetry),
            Ok(()) => Ok(PreJoinOutcome::PreJoined),
            Err(BackendError::Already(_)) => Ok(PreJoinOutcome::Already),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::backend::{
        models::{JoinTarget, QuizEntity, QuizOrSlot},
        scripted::{Call, ScriptedBackend, offline_error},
    };

    fn identity() -> QuizIdentity {
        QuizIdentity::slot(Uuid::from_u128(1), Uuid::from_u128(2))
    }

    fn backend() -> Arc<ScriptedBackend> {
        ScriptedBackend::new(QuizOrSlot::Legacy(QuizEntity {
            id: Uuid::from_u128(1),
            title: "Quiz".into(),
            category: None,
            start_time: time::macros::datetime!(2026-01-01 10:00 UTC),
            end_time: time::macros::datetime!(2026-01-01 10:05 UTC),
            prizes: vec![],
            prize_unit: String::new(),
        }))
    }

    fn coordinator(backend: &Arc<ScriptedBackend>) -> JoinCoordinator {
        JoinCoordinator::new(backend.clone(), JoinConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn not_active_then_success_after_grace() {
        let backend = backend();
        backend.script_join(Err(BackendError::NotActive("NOT_ACTIVE".into())));
        let coordinator = coordinator(&backend);
        let started = Instant::now();

        let outcome = coordinator.join(&identity()).await;

        assert_eq!(outcome, Some(JoinOutcome::Joined));
        let joins: Vec<_> = backend
            .timed_calls()
            .into_iter()
            .filter(|(_, call)| matches!(call, Call::Join(_)))
            .map(|(at, _)| at - started)
            .collect();
        assert_eq!(joins, vec![Duration::ZERO, Duration::from_millis(1_500)]);
        assert_eq!(backend.count(|call| matches!(call, Call::PreJoin(_))), 0);
        assert_eq!(
            backend.calls()[0],
            Call::Join(JoinTarget::Slot(Uuid::from_u128(2)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_joins_issue_one_sequence() {
        let backend = backend();
        backend.script_join(Err(BackendError::NotActive("NOT_ACTIVE".into())));
        let coordinator = coordinator(&backend);
        let id = identity();

        let (first, second, third) =
            tokio::join!(coordinator.join(&id), coordinator.join(&id), coordinator.join(&id));

        assert_eq!(first, Some(JoinOutcome::Joined));
        assert_eq!((second, third), (None, None));
        assert_eq!(coordinator.join(&id).await, None);
        assert_eq!(backend.count(|call| matches!(call, Call::Join(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn already_counts_as_joined() {
        let backend = backend();
        backend.script_join(Err(BackendError::Already("already joined".into())));
        let coordinator = coordinator(&backend);

        assert_eq!(
            coordinator.join(&identity()).await,
            Some(JoinOutcome::AlreadyJoined)
        );
        assert_eq!(backend.count(|call| matches!(call, Call::Join(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stops_without_fallback() {
        let backend = backend();
        backend.script_join(Err(BackendError::Ended("quiz has ended".into())));
        let coordinator = coordinator(&backend);

        assert_eq!(coordinator.join(&identity()).await, Some(JoinOutcome::Ended));
        assert_eq!(backend.count(|call| matches!(call, Call::PreJoin(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_fall_back_to_pre_join() {
        let backend = backend();
        backend.script_join(Err(BackendError::NotActive("NOT_ACTIVE".into())));
        backend.script_join(Err(BackendError::NotActive("NOT_ACTIVE".into())));
        let coordinator = coordinator(&backend);

        assert_eq!(coordinator.join(&identity()).await, Some(JoinOutcome::PreJoined));
        assert_eq!(backend.count(|call| matches!(call, Call::Join(_))), 2);
        assert_eq!(backend.count(|call| matches!(call, Call::PreJoin(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fallback_is_suppressed_but_guarded() {
        let backend = backend();
        backend.script_join(Err(BackendError::Rejected("boom".into())));
        backend.script_pre_join(Err(offline_error()));
        let coordinator = coordinator(&backend);
        let id = identity();

        assert!(matches!(
            coordinator.join(&id).await,
            Some(JoinOutcome::Suppressed(_))
        ));
        assert!(coordinator.is_guarded(&id));
        assert_eq!(coordinator.join(&id).await, None);

        coordinator.reset(&id);
        assert_eq!(coordinator.join(&id).await, Some(JoinOutcome::Joined));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_pre_join_maps_every_path() {
        let backend = backend();
        let coordinator = coordinator(&backend);
        let id = identity();

        assert_eq!(coordinator.pre_join(&id, false).await.unwrap(), PreJoinOutcome::PreJoined);

        backend.script_join(Err(BackendError::NotActive("NOT_ACTIVE".into())));
        assert_eq!(
            coordinator.pre_join(&id, true).await.unwrap(),
            PreJoinOutcome::ScheduledRetry
        );
        assert!(!coordinator.is_guarded(&id));

        assert_eq!(coordinator.pre_join(&id, true).await.unwrap(), PreJoinOutcome::Joined);
        assert_eq!(coordinator.pre_join(&id, true).await.unwrap(), PreJoinOutcome::Already);
        assert_eq!(coordinator.join(&id).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_join_blocks_the_automatic_one_while_in_flight() {
        let backend = backend();
        backend.delay_joins(Duration::from_secs(3));
        let coordinator = coordinator(&backend);
        let id = identity();

        let (explicit, automatic) = tokio::join!(coordinator.pre_join(&id, true), async {
            sleep(Duration::from_secs(1)).await;
            coordinator.join(&id).await
        });

        assert_eq!(explicit.unwrap(), PreJoinOutcome::Joined);
        assert_eq!(automatic, None);
        assert_eq!(backend.count(|call| matches!(call, Call::Join(_))), 1);
        assert!(coordinator.is_guarded(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_explicit_join_releases_the_guard() {
        let backend = backend();
        backend.script_join(Err(BackendError::Rejected("boom".into())));
        let coordinator = coordinator(&backend);
        let id = identity();

        assert!(coordinator.pre_join(&id, true).await.is_err());
        assert!(!coordinator.is_guarded(&id));
        assert_eq!(coordinator.join(&id).await, Some(JoinOutcome::Joined));
    }
}
