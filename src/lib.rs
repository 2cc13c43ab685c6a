//! Quiz session engine: timer-driven phases, join/answer/submit flows and a
//! local HTTP bridge exposing the session to a page.

/// Backend abstraction and its REST implementation.
pub mod backend;
/// Engine tunables.
pub mod config;
/// Request and response payloads.
pub mod dto;
/// Error taxonomy shared by services and routes.
pub mod error;
/// HTTP routes.
pub mod routes;
/// Session engine and supporting services.
pub mod services;
/// Session state, phases and shared application state.
pub mod state;
