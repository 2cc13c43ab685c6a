use serde::Serialize;
use utoipa::ToSchema;

use crate::state::state_machine::SessionPhase;

#[derive(Clone, Debug, PartialEq)]
/// Dispatched payload carried across the SSE channel.
pub struct ServerEvent {
    /// SSE `event:` field.
    pub event: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Identifier of the SSE stream.
    pub stream: String,
    /// Human-readable message confirming the subscription.
    pub message: String,
    /// Session phase at connection time.
    pub phase: SessionPhase,
    /// Whether the backend is currently unreachable.
    pub degraded: bool,
}
