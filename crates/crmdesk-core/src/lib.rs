//! Core library for crmdesk.
//!
//! - `api`: the HTTP gateway (credential attachment and renewal), the typed
//!   endpoint client and the error taxonomy
//! - `auth`: credential storage and the session store
//! - `models`: user profile, conversations and the service queue
//! - `config`, `utils`: configuration and display helpers

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod utils;

pub use api::{ApiClient, ApiError, Gateway, GatewayEvent};
pub use auth::{SessionPhase, SessionState, SessionStore};
pub use config::Config;
