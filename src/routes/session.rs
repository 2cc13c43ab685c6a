use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::session::{
        JoinResponse, SelectAnswerRequest, SelectAnswerResponse, SessionSnapshot,
        VisibilityRequest,
    },
    error::AppError,
    services::visibility::GateState,
    state::SharedState,
};

/// Routes exposing the hosted quiz session.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/answers", post(select_answer))
        .route("/session/join", post(join))
        .route("/session/submit", post(submit))
        .route("/session/retry", post(retry))
        .route("/session/visibility", post(visibility))
}

/// Return the latest session snapshot.
#[utoipa::path(
    get,
    path = "/session",
    tag = "session",
    responses(
        (status = 200, description = "Current session snapshot", body = SessionSnapshot)
    )
)]
pub async fn get_session(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    Json(state.session().snapshot())
}

/// Select an option for a question; failed writes are queued for retry.
#[utoipa::path(
    post,
    path = "/session/answers",
    tag = "session",
    request_body = SelectAnswerRequest,
    responses(
        (status = 200, description = "Selection recorded or ignored", body = SelectAnswerResponse),
        (status = 400, description = "Invalid identifiers or foreign option"),
        (status = 404, description = "Unknown question"),
        (status = 409, description = "Questions are not loaded yet")
    )
)]
pub async fn select_answer(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<SelectAnswerRequest>>,
) -> Result<Json<SelectAnswerResponse>, AppError> {
    let response = state
        .session()
        .select(payload.question_id, payload.option_id)
        .await?;
    Ok(Json(response))
}

/// Register the user ahead of the opening time, or join when already active.
#[utoipa::path(
    post,
    path = "/session/join",
    tag = "session",
    responses(
        (status = 200, description = "Participation recorded", body = JoinResponse),
        (status = 401, description = "No user attached to the session"),
        (status = 409, description = "The quiz is not open for joining")
    )
)]
pub async fn join(State(state): State<SharedState>) -> Result<Json<JoinResponse>, AppError> {
    let response = state.session().pre_join().await?;
    Ok(Json(response))
}

/// Submit the answers once every queued write reached the backend.
#[utoipa::path(
    post,
    path = "/session/submit",
    tag = "session",
    responses(
        (status = 200, description = "Answers submitted", body = SessionSnapshot),
        (status = 401, description = "No user attached to the session"),
        (status = 409, description = "Submission already running or answers still syncing")
    )
)]
pub async fn submit(State(state): State<SharedState>) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = state.session().submit().await?;
    Ok(Json(snapshot))
}

/// Reload the quiz after a failed load.
#[utoipa::path(
    post,
    path = "/session/retry",
    tag = "session",
    responses(
        (status = 200, description = "Quiz reloaded", body = SessionSnapshot),
        (status = 409, description = "The session is not in the error phase")
    )
)]
pub async fn retry(State(state): State<SharedState>) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = state.session().retry().await?;
    Ok(Json(snapshot))
}

/// Report page visibility or browser connectivity.
#[utoipa::path(
    post,
    path = "/session/visibility",
    tag = "session",
    request_body = VisibilityRequest,
    responses(
        (status = 200, description = "Updated gate", body = GateState),
        (status = 400, description = "Neither signal supplied")
    )
)]
pub async fn visibility(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<VisibilityRequest>>,
) -> Json<GateState> {
    let gate = state.gate();
    if let Some(visible) = payload.visible {
        gate.set_visible(visible);
    }
    if let Some(online) = payload.online {
        gate.set_online(online);
    }
    Json(gate.state())
}
