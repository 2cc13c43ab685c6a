use axum::Router;

use crate::state::SharedState;

/// Swagger UI.
pub mod docs;
/// Liveness and backend reachability.
pub mod health;
/// Session snapshot and user actions.
pub mod session;
/// Server-sent events.
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(session::router())
        .merge(sse::router())
        .merge(docs::router())
        .with_state(state)
}
