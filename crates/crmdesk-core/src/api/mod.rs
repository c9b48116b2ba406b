//! REST API module for the customer-service backend.
//!
//! - `Gateway`: the single request pipeline; attaches the bearer credential
//!   and renews it once on a 401
//! - `ApiClient`: typed methods for each endpoint
//! - `ApiError`: failure taxonomy and user-facing messages
//!
//! The backend issues JWT access/refresh pairs from `/token/` and renews
//! access credentials at `/token/refresh/`.

pub mod client;
pub mod error;
pub mod gateway;

pub use client::{ApiClient, TokenResponse};
pub use error::{ApiError, ErrorBody, ErrorCategory, RenewalError};
pub use gateway::{ApiRequest, Gateway, GatewayEvent, PendingRequest};
