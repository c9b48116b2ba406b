use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Body fields the backend uses for human-readable errors, highest priority first.
const BACKEND_MESSAGE_FIELDS: [&str; 4] = ["detail", "message", "erro", "non_field_errors"];

const NETWORK_MESSAGE: &str = "Server is not responding. Check your connection.";
const AUTHORIZATION_MESSAGE: &str = "Session expired. Please sign in again.";
const PERMISSION_MESSAGE: &str = "You do not have permission to perform this action.";
const SERVER_MESSAGE: &str = "The server failed to process the request. Try again later.";

/// Body of a failed response: the raw text (truncated) and, when the body
/// is a JSON object, its parsed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorBody {
    raw: String,
    fields: Option<Map<String, Value>>,
}

impl ErrorBody {
    pub fn parse(body: &str) -> Self {
        let fields = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        };
        Self {
            raw: truncate_body(body),
            fields,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.fields.as_ref()
    }

    /// Non-empty string value of a field. Lists (as DRF returns for
    /// validation errors) yield their first string element.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = self.fields.as_ref()?.get(name)?;
        let text = match value {
            Value::String(s) => s.as_str(),
            Value::Array(items) => items.iter().find_map(Value::as_str)?,
            _ => return None,
        };
        let text = text.trim();
        (!text.is_empty()).then_some(text)
    }

    /// First field present among `names`, in order.
    pub fn first_field(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.field(name))
    }

    /// Backend-supplied human-readable message, if any.
    pub fn backend_message(&self) -> Option<&str> {
        self.first_field(&BACKEND_MESSAGE_FIELDS)
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Why a credential renewal did not produce a new access credential.
///
/// Cloneable so a single renewal outcome can be handed to every request
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("no refresh credential is stored")]
    MissingRefreshToken,

    #[error("renewal rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("renewal request failed: {0}")]
    Transport(String),

    #[error("renewal response was malformed: {0}")]
    InvalidResponse(String),
}

/// Coarse failure classes, used to pick a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No response was received.
    Network,
    /// 401-class, or the session could not be renewed.
    Authorization,
    /// 403-class.
    Permission,
    /// The backend rejected the request with a structured error body.
    Validation,
    /// The response did not have the expected shape.
    MalformedResponse,
    /// 5xx, rate limiting.
    Server,
}

impl ErrorCategory {
    pub fn generic_message(&self) -> Option<&'static str> {
        match self {
            ErrorCategory::Network => Some(NETWORK_MESSAGE),
            ErrorCategory::Authorization => Some(AUTHORIZATION_MESSAGE),
            ErrorCategory::Permission => Some(PERMISSION_MESSAGE),
            ErrorCategory::Server => Some(SERVER_MESSAGE),
            ErrorCategory::Validation | ErrorCategory::MalformedResponse => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unable to reach server: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unauthorized - token may be expired")]
    Unauthorized(ErrorBody),

    #[error("Access denied: {0}")]
    AccessDenied(ErrorBody),

    #[error("Resource not found: {0}")]
    NotFound(ErrorBody),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected ({status}): {body}")]
    Rejected { status: u16, body: ErrorBody },

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: ErrorBody },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session could not be renewed: {0}")]
    RenewalFailed(#[from] RenewalError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = ErrorBody::parse(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(body),
            403 => ApiError::AccessDenied(body),
            404 => ApiError::NotFound(body),
            429 => ApiError::RateLimited,
            code @ 400..=499 => ApiError::Rejected { status: code, body },
            code @ 500..=599 => ApiError::ServerError { status: code, body },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, body)),
        }
    }

    /// HTTP status of the failed response, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            ApiError::Unauthorized(_) => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited => Some(429),
            ApiError::Rejected { status, .. } | ApiError::ServerError { status, .. } => {
                Some(*status)
            }
            ApiError::InvalidResponse(_)
            | ApiError::RenewalFailed(_)
            | ApiError::InvalidRequest(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    pub fn body(&self) -> Option<&ErrorBody> {
        match self {
            ApiError::Unauthorized(body)
            | ApiError::AccessDenied(body)
            | ApiError::NotFound(body)
            | ApiError::ServerError { body, .. }
            | ApiError::Rejected { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Network(_) => ErrorCategory::Network,
            ApiError::Unauthorized(_) | ApiError::RenewalFailed(_) => ErrorCategory::Authorization,
            ApiError::AccessDenied(_) => ErrorCategory::Permission,
            ApiError::NotFound(_) | ApiError::Rejected { .. } | ApiError::InvalidRequest(_) => {
                ErrorCategory::Validation
            }
            ApiError::InvalidResponse(_) => ErrorCategory::MalformedResponse,
            ApiError::RateLimited | ApiError::ServerError { .. } => ErrorCategory::Server,
        }
    }

    pub fn backend_message(&self) -> Option<&str> {
        self.body().and_then(ErrorBody::backend_message)
    }

    /// Message to show the user: the backend's own message, else the
    /// category's generic message, else `fallback`.
    pub fn user_message(&self, fallback: &str) -> String {
        self.backend_message()
            .or_else(|| self.category().generic_message())
            .unwrap_or(fallback)
            .to_string()
    }
}
