use quiz_session::services::documentation::ApiDoc;
use utoipa::OpenApi;

fn main() -> serde_json::Result<()> {
    println!("{}", ApiDoc::openapi().to_pretty_json()?);
    Ok(())
}
