//! One negotiated media connection to exactly one remote participant.
//!
//! ```text
//!            offer sent                answer applied
//!   New ───────────────► HaveLocalOffer ──────────────► Stable ──transport──► Connected
//!    │                                                    ▲        connected
//!    │  offer received        answer sent                 │
//!    └──────────────► HaveRemoteOffer ────────────────────┘
//! ```
//!
//! Any state goes to `Closed` on close or transport failure. Adding or
//! removing an outbound track renegotiates from `Stable`/`Connected`;
//! replacing one does not.
//!
//! Glare (an offer arrives while ours is outstanding): the side with the
//! lexicographically smaller participant id keeps its offer and ignores the
//! incoming one; the other side rolls back and answers. Whoever offered first
//! in a non-simultaneous exchange simply wins.

use parley_common::signal::{ClientSignal, IceCandidate};
use parley_common::ParticipantId;
use std::collections::HashMap;

use crate::error::{ClientError, Result};
use crate::media::{
    LinkId, PeerTransport, SenderId, SessionDescription, TrackHandle, TrackKind, TransportState,
};
use crate::SignalOutbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    /// Both descriptions applied; waiting for the transport to confirm.
    Stable,
    Connected,
    Closed,
}

/// What the owner must do after feeding the link a transport state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Alive,
    /// The transport reported disconnected/failed; the link must be dropped.
    Failed,
}

struct Outbound {
    sender: SenderId,
    track: TrackHandle,
}

pub struct PeerLink {
    id: LinkId,
    local: ParticipantId,
    remote: ParticipantId,
    role: LinkRole,
    state: NegotiationState,
    transport: Box<dyn PeerTransport>,
    outbox: SignalOutbox,
    outbound: HashMap<TrackKind, Outbound>,
    inbound: HashMap<String, TrackKind>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    transport_connected: bool,
    renegotiate_pending: bool,
    announced: bool,
}

impl PeerLink {
    /// Create a link, attach `tracks`, and send the first offer if we initiate.
    pub async fn open(
        id: LinkId,
        local: ParticipantId,
        remote: ParticipantId,
        role: LinkRole,
        transport: Box<dyn PeerTransport>,
        outbox: SignalOutbox,
        tracks: &[TrackHandle],
    ) -> Result<Self> {
        let mut link = Self {
            id,
            local,
            remote,
            role,
            state: NegotiationState::New,
            transport,
            outbox,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            transport_connected: false,
            renegotiate_pending: false,
            announced: false,
        };

        for track in tracks {
            let sender = link
                .transport
                .add_track(track.clone())
                .await
                .map_err(|e| ClientError::negotiation(&link.remote, e))?;
            link.outbound.insert(
                track.kind(),
                Outbound {
                    sender,
                    track: track.clone(),
                },
            );
        }

        if role == LinkRole::Initiator {
            link.send_offer().await?;
        }

        tracing::debug!(remote = %link.remote, ?role, link = id, "Peer link opened");
        Ok(link)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiationState::Connected
    }

    /// True exactly once: the first time the link is seen connected.
    pub fn newly_connected(&mut self) -> bool {
        if self.is_connected() && !self.announced {
            self.announced = true;
            return true;
        }
        false
    }

    /// The local track of `kind` currently sent on this link.
    pub fn outbound_track(&self, kind: TrackKind) -> Option<&TrackHandle> {
        self.outbound.get(&kind).map(|o| &o.track)
    }

    pub fn inbound_tracks(&self) -> impl Iterator<Item = (&str, TrackKind)> {
        self.inbound.iter().map(|(id, kind)| (id.as_str(), *kind))
    }

    pub async fn on_remote_offer(&mut self, sdp: String) -> Result<()> {
        match self.state {
            NegotiationState::Closed => return Ok(()),
            NegotiationState::HaveLocalOffer => {
                if self.local < self.remote {
                    tracing::debug!(remote = %self.remote, "Glare: keeping our offer, ignoring theirs");
                    return Ok(());
                }
                tracing::debug!(remote = %self.remote, "Glare: rolling back our offer to answer theirs");
                self.transport
                    .rollback()
                    .await
                    .map_err(|e| ClientError::negotiation(&self.remote, e))?;
                self.role = LinkRole::Responder;
            }
            _ => {}
        }

        self.transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.state = NegotiationState::HaveRemoteOffer;
        self.remote_description_set = true;
        self.flush_candidates().await?;

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.transport
            .set_local_description(SessionDescription::answer(answer.clone()))
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.send(ClientSignal::Answer {
            target: self.remote.clone(),
            sdp: answer,
        });

        self.settle().await
    }

    pub async fn on_remote_answer(&mut self, sdp: String) -> Result<()> {
        if self.state != NegotiationState::HaveLocalOffer {
            tracing::debug!(remote = %self.remote, state = ?self.state, "Ignoring unexpected answer");
            return Ok(());
        }

        self.transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.remote_description_set = true;
        self.flush_candidates().await?;

        self.settle().await
    }

    /// Candidates that arrive before the remote description are held back
    /// and applied in arrival order once it is set.
    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))
    }

    /// A candidate gathered locally: relay it to the remote.
    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.state != NegotiationState::Closed {
            self.send(ClientSignal::IceCandidate {
                target: self.remote.clone(),
                candidate,
            });
        }
    }

    pub fn on_transport_state(&mut self, state: TransportState) -> LinkHealth {
        match state {
            TransportState::Connected => {
                self.transport_connected = true;
                if self.state == NegotiationState::Stable {
                    self.state = NegotiationState::Connected;
                    tracing::info!(remote = %self.remote, "Peer link connected");
                }
                LinkHealth::Alive
            }
            TransportState::Connecting => LinkHealth::Alive,
            TransportState::Disconnected | TransportState::Failed => {
                tracing::info!(remote = %self.remote, ?state, "Peer link transport lost");
                LinkHealth::Failed
            }
        }
    }

    pub fn on_remote_track(&mut self, track_id: String, kind: TrackKind) {
        self.inbound.insert(track_id, kind);
    }

    pub fn on_remote_track_ended(&mut self, track_id: &str) -> bool {
        self.inbound.remove(track_id).is_some()
    }

    /// Send `track` as this link's track of its kind.
    ///
    /// A kind already on the wire is swapped in place without signaling;
    /// a new kind is attached and renegotiates.
    pub async fn send_track(&mut self, track: &TrackHandle) -> Result<()> {
        if self.outbound.contains_key(&track.kind()) {
            self.swap_track(track).await
        } else {
            self.attach_track(track).await
        }
    }

    pub async fn remove_track(&mut self, kind: TrackKind) -> Result<()> {
        let Some(outbound) = self.outbound.remove(&kind) else {
            return Ok(());
        };
        self.transport
            .remove_track(outbound.sender)
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.renegotiate().await
    }

    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.outbound.clear();
        self.inbound.clear();
        self.pending_candidates.clear();
        self.transport.close().await;
        tracing::debug!(remote = %self.remote, link = self.id, "Peer link closed");
    }

    async fn attach_track(&mut self, track: &TrackHandle) -> Result<()> {
        let sender = self
            .transport
            .add_track(track.clone())
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.outbound.insert(
            track.kind(),
            Outbound {
                sender,
                track: track.clone(),
            },
        );
        self.renegotiate().await
    }

    async fn swap_track(&mut self, track: &TrackHandle) -> Result<()> {
        let Some(outbound) = self.outbound.get_mut(&track.kind()) else {
            return Ok(());
        };
        self.transport
            .replace_track(outbound.sender, track.clone())
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        outbound.track = track.clone();
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.transport
            .set_local_description(SessionDescription::offer(offer.clone()))
            .await
            .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        self.state = NegotiationState::HaveLocalOffer;
        self.send(ClientSignal::Offer {
            target: self.remote.clone(),
            sdp: offer,
        });
        Ok(())
    }

    async fn renegotiate(&mut self) -> Result<()> {
        match self.state {
            NegotiationState::Stable | NegotiationState::Connected => self.send_offer().await,
            NegotiationState::Closed => Ok(()),
            // Picked up once the exchange in flight completes.
            _ => {
                self.renegotiate_pending = true;
                Ok(())
            }
        }
    }

    /// An offer/answer exchange completed.
    async fn settle(&mut self) -> Result<()> {
        self.state = if self.transport_connected {
            NegotiationState::Connected
        } else {
            NegotiationState::Stable
        };
        if std::mem::take(&mut self.renegotiate_pending) {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<()> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.transport
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| ClientError::negotiation(&self.remote, e))?;
        }
        Ok(())
    }

    fn send(&self, signal: ClientSignal) {
        let _ = self.outbox.send(signal);
    }
}
