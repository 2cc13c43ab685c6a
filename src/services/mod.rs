/// Failed-answer retry queue.
pub mod answer_sync;
/// Exponential backoff schedules.
pub mod backoff;
/// Backend reachability probe driving offline mode.
pub mod connectivity_supervisor;
/// OpenAPI documentation generation.
pub mod documentation;
/// Participant count refresh.
pub mod engagement;
/// Health check service.
pub mod health_service;
/// Join and pre-join coordination.
pub mod join;
/// User-facing notices.
pub mod notices;
/// Supervised change-notification feeds.
pub mod realtime;
/// The quiz session engine.
pub mod session_service;
/// Server-Sent Events streaming of the session.
pub mod sse_service;
/// Page visibility and connectivity gate.
pub mod visibility;
