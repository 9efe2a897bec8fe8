//! Voice signaling protocol — the messages exchanged over the voice WebSocket.
//!
//! Wire format is JSON `{"op": "<snake_case>", "d": {...}}`. Each message kind
//! is one enum variant, decoded once at the connection boundary so handlers
//! are plain exhaustive matches.
//!
//! The server never looks inside `sdp` or `candidate` payloads. It only routes
//! on `target` (peer-addressed messages) or on the sender's voice context
//! (state notices).

use crate::config::IceServerConfig;
use crate::context::{MediaNotice, RosterMember, TrackToggleState, VoiceContext};
use crate::ids::{ChannelId, ParticipantId, ServerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// An ICE candidate as produced by the media transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Client → Server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum ClientSignal {
    /// Authenticate with an access token. Must be the first message.
    Identify { token: String },

    /// Keepalive.
    Heartbeat,

    JoinChannel {
        server_id: ServerId,
        channel_id: ChannelId,
    },

    LeaveChannel,

    StartCall { peer: ParticipantId },
    AcceptCall { peer: ParticipantId },
    RejectCall { peer: ParticipantId },
    HangUp,

    // === Peer-addressed, relayed verbatim ===
    Offer {
        target: ParticipantId,
        sdp: String,
    },
    Answer {
        target: ParticipantId,
        sdp: String,
    },
    IceCandidate {
        target: ParticipantId,
        candidate: IceCandidate,
    },
    SwitchVideoSource {
        target: ParticipantId,
        show_screen: bool,
    },

    // === Broadcast to the sender's voice context ===
    MuteState { value: bool },
    VideoState { value: bool },
    ScreenShareState { value: bool },
    VideoSourceChanged { showing_screen: bool },
}

impl ClientSignal {
    /// Split a peer-addressed message into its target and payload.
    pub fn into_peer_signal(self) -> Result<(ParticipantId, PeerPayload), Self> {
        match self {
            Self::Offer { target, sdp } => Ok((target, PeerPayload::Offer { sdp })),
            Self::Answer { target, sdp } => Ok((target, PeerPayload::Answer { sdp })),
            Self::IceCandidate { target, candidate } => {
                Ok((target, PeerPayload::IceCandidate { candidate }))
            }
            Self::SwitchVideoSource {
                target,
                show_screen,
            } => Ok((target, PeerPayload::SwitchVideoSource { show_screen })),
            other => Err(other),
        }
    }

    /// The state notice carried by a context-broadcast message.
    pub fn media_notice(&self) -> Option<MediaNotice> {
        match *self {
            Self::MuteState { value } => Some(MediaNotice::Mute { value }),
            Self::VideoState { value } => Some(MediaNotice::Video { value }),
            Self::ScreenShareState { value } => Some(MediaNotice::ScreenShare { value }),
            Self::VideoSourceChanged { showing_screen } => {
                Some(MediaNotice::VideoSource { showing_screen })
            }
            _ => None,
        }
    }

    pub fn from_notice(notice: MediaNotice) -> Self {
        match notice {
            MediaNotice::Mute { value } => Self::MuteState { value },
            MediaNotice::Video { value } => Self::VideoState { value },
            MediaNotice::ScreenShare { value } => Self::ScreenShareState { value },
            MediaNotice::VideoSource { showing_screen } => {
                Self::VideoSourceChanged { showing_screen }
            }
        }
    }
}

/// Body of a peer-addressed message, independent of direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    SwitchVideoSource { show_screen: bool },
}

impl PeerPayload {
    pub fn kind(&self) -> RelayKind {
        match self {
            Self::Offer { .. } => RelayKind::Offer,
            Self::Answer { .. } => RelayKind::Answer,
            Self::IceCandidate { .. } => RelayKind::IceCandidate,
            Self::SwitchVideoSource { .. } => RelayKind::SwitchVideoSource,
        }
    }

    /// Wrap the payload for delivery to its target.
    pub fn deliver_from(self, from: ParticipantId) -> ServerSignal {
        match self {
            Self::Offer { sdp } => ServerSignal::Offer { from, sdp },
            Self::Answer { sdp } => ServerSignal::Answer { from, sdp },
            Self::IceCandidate { candidate } => ServerSignal::IceCandidate { from, candidate },
            Self::SwitchVideoSource { show_screen } => {
                ServerSignal::SwitchVideoSource { from, show_screen }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
    SwitchVideoSource,
}

impl RelayKind {
    /// Whether a routing failure must be reported back to the sender.
    /// Best-effort kinds are dropped silently.
    pub fn reports_failure(self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::SwitchVideoSource => "switch_video_source",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterState {
    Joined,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Rejected,
    Timeout,
    HungUp,
    Cancelled,
    Disconnected,
}

/// Server → Client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum ServerSignal {
    /// Authentication succeeded.
    Ready {
        participant_id: ParticipantId,
        session_id: String,
        ice_servers: Vec<IceServerConfig>,
        /// Channel capacity; a client needs one peer link per other member.
        max_roster_size: usize,
    },

    HeartbeatAck,

    /// You joined `context`; `roster` lists the members that were already
    /// there, in join order.
    Joined {
        context: VoiceContext,
        roster: Vec<RosterMember>,
    },

    /// You left `context` at your own request.
    Left { context: VoiceContext },

    /// Another member joined or left your current context.
    RosterChanged {
        context: VoiceContext,
        state: RosterState,
        participant: ParticipantId,
    },

    IncomingCall {
        caller: ParticipantId,
        call_id: Uuid,
    },
    CallRinging {
        callee: ParticipantId,
        call_id: Uuid,
    },
    /// The invitation became active. `initiator` tells the receiver whether
    /// it must send the first offer.
    CallAccepted {
        peer: ParticipantId,
        call_id: Uuid,
        initiator: bool,
    },
    CallEnded {
        peer: ParticipantId,
        call_id: Uuid,
        reason: CallEndReason,
    },

    // === Relayed from another participant ===
    Offer {
        from: ParticipantId,
        sdp: String,
    },
    Answer {
        from: ParticipantId,
        sdp: String,
    },
    IceCandidate {
        from: ParticipantId,
        candidate: IceCandidate,
    },
    SwitchVideoSource {
        from: ParticipantId,
        show_screen: bool,
    },
    MediaState {
        participant: ParticipantId,
        notice: MediaNotice,
        state: TrackToggleState,
    },

    /// An offer/answer could not be delivered because `target` is gone.
    RelayFailed {
        target: ParticipantId,
        kind: RelayKind,
    },

    Error { code: u32, message: String },
}
