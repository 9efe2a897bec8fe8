//! Centralized error type for the Parley voice server.
//!
//! Uses `thiserror` for ergonomic error definitions. Every variant maps to a
//! stable string code and a numeric wire code (4xxx: the client did something
//! wrong, 5xxx: we did), which is what clients see in an `error` signal.
//! The same type converts into an HTTP response for the REST side routes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::ids::ParticipantId;
use crate::signal::ServerSignal;

/// Core application error type used across Parley services.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    // === Auth errors ===
    #[error("Invalid token")]
    InvalidToken,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Forbidden")]
    Forbidden,

    // === Validation errors ===
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Routing errors ===
    #[error("Participant {participant} is not connected")]
    NotConnected { participant: ParticipantId },

    #[error("Target {target} is not connected")]
    TargetUnavailable { target: ParticipantId },

    // === Call invitation errors ===
    #[error("A call between these participants is already ringing or active")]
    AlreadyRinging,

    #[error("No such call invitation")]
    InvitationNotFound,

    #[error("Call invitation is {state}")]
    InvalidInvitationState { state: String },

    #[error("Not in a call")]
    NotInCall,

    // === Capacity ===
    #[error("Limit reached: {message}")]
    LimitReached { message: String },

    // === Infrastructure errors ===
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to HTTP clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ParleyError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken | Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } | Self::InvitationNotFound => StatusCode::NOT_FOUND,
            Self::NotConnected { .. } | Self::TargetUnavailable { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyRinging | Self::InvalidInvitationState { .. } | Self::NotInCall => {
                StatusCode::CONFLICT
            }
            Self::LimitReached { .. } => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidToken => "INVALID_TOKEN",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            Self::AlreadyRinging => "ALREADY_RINGING",
            Self::InvitationNotFound => "INVITATION_NOT_FOUND",
            Self::InvalidInvitationState { .. } => "INVALID_INVITATION_STATE",
            Self::NotInCall => "NOT_IN_CALL",
            Self::LimitReached { .. } => "LIMIT_REACHED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Numeric code carried by the `error` signal on the voice socket.
    pub fn wire_code(&self) -> u32 {
        match self {
            Self::Validation { .. } => 4000,
            Self::InvalidToken => 4004,
            Self::NotAuthenticated => 4003,
            Self::Forbidden => 4005,
            Self::NotFound { .. } => 4006,
            Self::NotConnected { .. } | Self::TargetUnavailable { .. } => 4010,
            Self::AlreadyRinging => 4020,
            Self::InvitationNotFound => 4021,
            Self::InvalidInvitationState { .. } => 4022,
            Self::NotInCall => 4023,
            Self::LimitReached { .. } => 4029,
            Self::Internal(_) => 5000,
        }
    }

    /// Render as an `error` signal. Internal details are logged, not sent.
    pub fn to_signal(&self) -> ServerSignal {
        let message = match self {
            Self::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };
        ServerSignal::Error {
            code: self.wire_code(),
            message,
        }
    }
}

impl IntoResponse for ParleyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            ParleyError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using ParleyError.
pub type ParleyResult<T> = Result<T, ParleyError>;
