use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Probe the backend once and report whether the session runs degraded.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    if let Err(err) = state.backend().health_check().await {
        warn!(error = %err, "backend health check failed");
        return HealthResponse::degraded();
    }

    if state.is_degraded() {
        HealthResponse::degraded()
    } else {
        HealthResponse::ok()
    }
}
