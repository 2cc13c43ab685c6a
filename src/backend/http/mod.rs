mod config;
mod error;
mod store;

pub use config::HttpBackendConfig;
pub use error::{HttpDaoError, HttpResult};
pub use store::HttpQuizBackend;
