use std::convert::Infallible;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/session",
    tag = "sse",
    responses((status = 200, description = "Session snapshots and notices", content_type = "text/event-stream", body = String))
)]
/// Stream session snapshots and notices to the page.
pub async fn session_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New session SSE connection");
    sse_service::session_stream(&state)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/session", get(session_stream))
}
