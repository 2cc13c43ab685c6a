use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{services::documentation::ApiDoc, state::SharedState};

/// Path of the generated OpenAPI document.
pub const OPENAPI_PATH: &str = "/api-doc/openapi.json";

/// Serve the Swagger UI for the session API.
pub fn router() -> Router<SharedState> {
    SwaggerUi::new("/docs").url(OPENAPI_PATH, ApiDoc::openapi()).into()
}
