use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the quiz session bridge.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::session::get_session,
        crate::routes::session::select_answer,
        crate::routes::session::join,
        crate::routes::session::submit,
        crate::routes::session::retry,
        crate::routes::session::visibility,
        crate::routes::sse::session_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::SessionSnapshot,
            crate::dto::session::SelectAnswerRequest,
            crate::dto::session::SelectAnswerResponse,
            crate::dto::session::SelectOutcome,
            crate::dto::session::JoinResponse,
            crate::dto::session::VisibilityRequest,
            crate::dto::sse::Handshake,
            crate::services::notices::Notice,
            crate::services::notices::Redirect,
            crate::services::visibility::GateState,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "session", description = "Quiz session snapshot and user actions"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_session_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/healthcheck",
            "/session",
            "/session/answers",
            "/session/join",
            "/session/submit",
            "/session/retry",
            "/session/visibility",
            "/sse/session",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
