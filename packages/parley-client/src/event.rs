//! Events the voice client surfaces to the application.

use parley_common::config::IceServerConfig;
use parley_common::signal::CallEndReason;
use parley_common::{MediaNotice, ParticipantId, RosterMember, TrackToggleState, VoiceContext};
use uuid::Uuid;

use crate::error::CaptureError;
use crate::media::TrackKind;

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// The gateway authenticated this connection.
    Ready {
        participant_id: ParticipantId,
        ice_servers: Vec<IceServerConfig>,
    },

    /// Entered a voice context. `roster` lists who was already there.
    Joined {
        context: VoiceContext,
        roster: Vec<RosterMember>,
    },
    Left {
        context: VoiceContext,
    },
    ParticipantJoined {
        participant: ParticipantId,
    },
    ParticipantLeft {
        participant: ParticipantId,
    },

    MediaStateChanged {
        participant: ParticipantId,
        notice: MediaNotice,
        state: TrackToggleState,
    },
    /// A remote switched between camera and screen on its single video track.
    RemoteVideoSource {
        participant: ParticipantId,
        show_screen: bool,
    },

    LinkConnected {
        remote: ParticipantId,
    },
    LinkClosed {
        remote: ParticipantId,
    },
    RemoteTrackAdded {
        remote: ParticipantId,
        track_id: String,
        kind: TrackKind,
    },
    RemoteTrackRemoved {
        remote: ParticipantId,
        track_id: String,
    },

    IncomingCall {
        caller: ParticipantId,
        call_id: Uuid,
    },
    CallRinging {
        callee: ParticipantId,
        call_id: Uuid,
    },
    CallActive {
        peer: ParticipantId,
        call_id: Uuid,
    },
    CallEnded {
        peer: ParticipantId,
        call_id: Uuid,
        reason: CallEndReason,
    },

    CaptureFailed(CaptureError),

    /// The server refused a request.
    ServerError {
        code: u32,
        message: String,
    },

    /// The gateway connection dropped. Links and context are gone.
    Disconnected,
}
