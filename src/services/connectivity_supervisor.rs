use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{backend::QuizBackend, config::ConnectivityConfig, services::visibility::VisibilityGate};

/// Probe the backend forever and mirror its reachability onto the gate's `online` flag.
///
/// Healthy backends are probed every `probe_interval`; while unreachable the
/// probe backs off exponentially up to `cap`. Coming back online wakes the
/// pollers and flushes queued answers through the gate.
pub async fn run(backend: Arc<dyn QuizBackend>, gate: VisibilityGate, config: ConnectivityConfig) {
    let policy = config.policy();
    let mut failures = 0u32;

    loop {
        match backend.health_check().await {
            Ok(()) => {
                if failures > 0 {
                    info!(failures, "backend reachable again; leaving offline mode");
                } else {
                    debug!("backend health probe succeeded");
                }
                failures = 0;
                gate.set_online(true);
                sleep(config.probe_interval).await;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                if failures == 1 {
                    warn!(error = %err, "backend health probe failed; entering offline mode");
                    gate.set_online(false);
                } else {
                    warn!(attempt = failures, error = %err, "backend still unreachable");
                }
                sleep(policy.delay(failures)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;
    use tokio::time::Instant;
    use uuid::Uuid;

    use super::*;
    use crate::backend::{
        models::{QuizEntity, QuizOrSlot},
        scripted::{Call, ScriptedBackend, offline_error},
    };

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

    #[tokio::test(start_paused = true)]
    async fn unreachable_backend_flips_the_gate_offline_until_it_recovers() {
        let backend = backend();
        backend.script_health(Err(offline_error()));
        backend.script_health(Err(offline_error()));
        let gate = VisibilityGate::new();
        let started = Instant::now();

        let task = tokio::spawn(run(backend.clone(), gate.clone(), ConnectivityConfig::default()));

        sleep(Duration::from_millis(500)).await;
        assert!(!gate.state().online);

        sleep(Duration::from_secs(3)).await;
        assert!(gate.state().online);

        let probes: Vec<u64> = backend
            .timed_calls()
            .into_iter()
            .filter(|(_, call)| matches!(call, Call::Health))
            .map(|(at, _)| (at - started).as_secs())
            .collect();
        // failures wait 1s then 2s
        assert_eq!(probes, vec![0, 1, 3]);
        task.abort();
    }
}
