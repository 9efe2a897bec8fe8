//! The seams to the platform's media stack.
//!
//! The engine never touches codecs or sockets itself. Capture devices and the
//! peer-to-peer transport (a browser `RTCPeerConnection`, a native WebRTC
//! stack, or an in-memory fake in tests) plug in through these traits.

use async_trait::async_trait;
use parley_common::config::IceServerConfig;
use parley_common::signal::IceCandidate;
use parley_common::ParticipantId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::CaptureError;

/// Capture device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Microphone,
    Camera,
    Screen,
}

impl DeviceKind {
    pub fn track_kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Microphone => "microphone",
            Self::Camera => "camera",
            Self::Screen => "screen",
        };
        f.write_str(s)
    }
}

/// A peer link sends at most one track of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A live local capture track.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn device(&self) -> DeviceKind;
    /// Disabled tracks keep flowing as silence/black frames.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Release the underlying device. Idempotent.
    fn stop(&self);

    fn kind(&self) -> TrackKind {
        self.device().track_kind()
    }
}

pub type TrackHandle = Arc<dyn LocalTrack>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenConstraints {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for ScreenConstraints {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRequest {
    Microphone { device_id: Option<String> },
    Camera { device_id: Option<String> },
    Screen(ScreenConstraints),
}

impl CaptureRequest {
    pub fn device(&self) -> DeviceKind {
        match self {
            Self::Microphone { .. } => DeviceKind::Microphone,
            Self::Camera { .. } => DeviceKind::Camera,
            Self::Screen(_) => DeviceKind::Screen,
        }
    }
}

/// Local capture devices. Acquisition may wait on a user permission prompt.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, request: CaptureRequest) -> Result<TrackHandle, CaptureError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Handle to one outbound track slot of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// One negotiated peer-to-peer media connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;
    async fn create_answer(&self) -> Result<String, TransportError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    /// Discard the pending local offer.
    async fn rollback(&self) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn add_track(&self, track: TrackHandle) -> Result<SenderId, TransportError>;
    /// Swap the track of an existing sender without renegotiating.
    async fn replace_track(&self, sender: SenderId, track: TrackHandle) -> Result<(), TransportError>;
    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError>;
    async fn close(&self);
}

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A local candidate was gathered and must reach the remote.
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack { track_id: String, kind: TrackKind },
    RemoteTrackEnded { track_id: String },
}

/// A transport event, tagged with the link it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub remote: ParticipantId,
    pub link_id: LinkId,
    pub kind: TransportEventKind,
}

/// Sender handed to a transport at creation; tags every event with its link.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    remote: ParticipantId,
    link_id: LinkId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(remote: ParticipantId, link_id: LinkId, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { remote, link_id, tx }
    }

    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            remote: self.remote.clone(),
            link_id: self.link_id,
            kind,
        });
    }
}

pub trait PeerTransportFactory: Send + Sync {
    fn create(
        &self,
        remote: &ParticipantId,
        ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
