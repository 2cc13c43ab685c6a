use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::{QuizBackend, error::BackendResult},
    config::EngagementConfig,
    services::visibility::VisibilityGate,
    state::{engagement::EngagementTracker, state_machine::SessionPhase},
};

/// Fetch counts for `key` once and commit them unless a newer fetch started meanwhile.
pub async fn refresh(
    backend: &dyn QuizBackend,
    tracker: &EngagementTracker,
    key: Uuid,
) -> BackendResult<bool> {
    let ticket = tracker.ticket();
    let counts = backend.fetch_engagement(key).await?;
    let committed = tracker.commit(ticket, counts.into());
    if !committed {
        debug!(%key, ticket, "discarding stale engagement response");
    }
    Ok(committed)
}

fn polls_in(phase: SessionPhase) -> bool {
    matches!(phase, SessionPhase::Waiting | SessionPhase::Active)
}

/// Poll participant counts while the session waits or runs.
///
/// Pauses while the gate is closed, doubles the interval after each failure
/// (capped) and returns once the phase leaves `waiting`/`active`.
pub fn spawn(
    backend: Arc<dyn QuizBackend>,
    tracker: Arc<EngagementTracker>,
    gate: VisibilityGate,
    mut phase: watch::Receiver<SessionPhase>,
    key: Uuid,
    config: EngagementConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let policy = config.policy();
        let mut failures = 0u32;

        loop {
            if !polls_in(*phase.borrow_and_update()) {
                debug!(%key, "engagement polling stopped");
                return;
            }

            if !gate.is_open() {
                tokio::select! {
                    _ = gate.opened() => {}
                    changed = phase.changed() => if changed.is_err() { return },
                }
                continue;
            }

            match refresh(backend.as_ref(), &tracker, key).await {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(%key, failures, error = %err, "engagement refresh failed");
                }
            }

            let interval = policy.delay(failures + 1);
            tokio::select! {
                _ = sleep(interval) => {}
                changed = phase.changed() => if changed.is_err() { return },
            }
        }
    })
}
