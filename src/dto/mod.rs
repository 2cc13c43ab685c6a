/// Health check payloads.
pub mod health;
/// Session snapshot and action payloads.
pub mod session;
/// Server-sent event frames.
pub mod sse;
