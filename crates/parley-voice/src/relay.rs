//! Signaling relay — routes negotiation messages between participants.
//!
//! The relay is transport-agnostic: it never parses SDP or candidate strings,
//! and it keeps no per-message state. Peer-addressed payloads go to exactly
//! one target; state notices go to everyone else in the sender's context.

use parley_common::signal::PeerPayload;
use parley_common::{MediaNotice, ParleyError, ParleyResult, ParticipantId, TrackToggleState};

use crate::hub::ConnectionHub;
use crate::registry::VoiceSessionRegistry;

#[derive(Clone)]
pub struct SignalingRelay {
    hub: ConnectionHub,
    registry: VoiceSessionRegistry,
}

impl SignalingRelay {
    pub fn new(hub: ConnectionHub, registry: VoiceSessionRegistry) -> Self {
        Self { hub, registry }
    }

    /// Deliver `payload` from `from` to `target`.
    ///
    /// An offer or answer that cannot be delivered is reported as
    /// [`ParleyError::TargetUnavailable`]; ICE candidates and source switches
    /// are best effort and dropped silently.
    pub async fn forward(
        &self,
        from: &ParticipantId,
        target: &ParticipantId,
        payload: PeerPayload,
    ) -> ParleyResult<()> {
        if !self.hub.is_connected(from).await {
            return Err(ParleyError::NotAuthenticated);
        }
        if from == target {
            return Err(ParleyError::validation("cannot signal yourself"));
        }

        let kind = payload.kind();
        match self.hub.send(target, payload.deliver_from(from.clone())).await {
            Ok(()) => {
                tracing::trace!(from = %from, target = %target, %kind, "Relayed signal");
                Ok(())
            }
            Err(_) if kind.reports_failure() => {
                tracing::debug!(from = %from, target = %target, %kind, "Relay target unavailable");
                Err(ParleyError::TargetUnavailable {
                    target: target.clone(),
                })
            }
            Err(_) => {
                tracing::debug!(from = %from, target = %target, %kind, "Dropped best-effort signal");
                Ok(())
            }
        }
    }

    /// Broadcast a track-state notice to the rest of `from`'s context.
    /// A sender that is not in voice has nobody to tell.
    pub async fn broadcast_state(
        &self,
        from: &ParticipantId,
        notice: MediaNotice,
    ) -> Option<TrackToggleState> {
        self.registry.publish_media_state(from, notice).await
    }
}
