//! Error types for the Parley voice client.

use parley_common::ParticipantId;
use thiserror::Error;

use crate::media::{DeviceKind, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// A capture device could not be opened.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Offer/answer or track negotiation with one remote failed. Only that
    /// remote's link is affected.
    #[error("Negotiation with {remote} failed: {message}")]
    Negotiation {
        remote: ParticipantId,
        message: String,
    },

    /// The requested video source is not captured right now.
    #[error("Video source is not available")]
    SourceUnavailable,

    /// The call command does not fit the current call state.
    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    /// The operation needs a voice context.
    #[error("Not in a voice context")]
    NotInVoice,

    /// Opening another peer link would exceed the full-mesh ceiling.
    #[error("Peer link limit reached ({max})")]
    LinkLimit { max: usize },

    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The voice gateway or client task is gone.
    #[error("Voice client is not connected")]
    NotConnected,
}

impl ClientError {
    pub fn negotiation(remote: &ParticipantId, error: TransportError) -> Self {
        Self::Negotiation {
            remote: remote.clone(),
            message: error.to_string(),
        }
    }
}

/// Typed capture failure, tagged with the device class it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{device} capture failed: {kind}")]
pub struct CaptureError {
    pub device: DeviceKind,
    pub kind: CaptureErrorKind,
}

impl CaptureError {
    pub fn new(device: DeviceKind, kind: CaptureErrorKind) -> Self {
        Self { device, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureErrorKind {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found")]
    NotFound,
    #[error("device busy")]
    Busy,
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ClientError>;
