//! Peer link pool: the full mesh of links for the current voice context.
//!
//! At most one link per remote. A channel context links to every other
//! roster member; a direct context links to the call peer only. Links never
//! outlive the context they were opened for.

use async_trait::async_trait;
use parley_common::config::IceServerConfig;
use parley_common::signal::IceCandidate;
use parley_common::{ParticipantId, VoiceContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::{ClientError, Result};
use crate::event::VoiceEvent;
use crate::link::{LinkHealth, LinkRole, PeerLink};
use crate::media::{
    LinkId, PeerTransportFactory, TrackHandle, TrackKind, TransportEvent, TransportEventKind, TransportEvents,
};
use crate::track::TrackSink;
use crate::SignalOutbox;

pub struct PeerLinkPool {
    local: ParticipantId,
    factory: Arc<dyn PeerTransportFactory>,
    outbox: SignalOutbox,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    events: broadcast::Sender<VoiceEvent>,
    ice_servers: Vec<IceServerConfig>,
    max_links: usize,
    links: HashMap<ParticipantId, PeerLink>,
    next_link_id: LinkId,
    context: Option<VoiceContext>,
}

impl PeerLinkPool {
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        outbox: SignalOutbox,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        events: broadcast::Sender<VoiceEvent>,
        max_links: usize,
    ) -> Self {
        Self {
            local: ParticipantId::new(""),
            factory,
            outbox,
            transport_tx,
            events,
            ice_servers: Vec::new(),
            max_links,
            links: HashMap::new(),
            next_link_id: 1,
            context: None,
        }
    }

    /// Identity and ICE servers handed out in `ready`.
    pub fn set_identity(&mut self, local: ParticipantId, ice_servers: Vec<IceServerConfig>) {
        self.local = local;
        self.ice_servers = ice_servers;
    }

    /// Mesh limit: one link per other member of the largest roster.
    pub fn set_max_links(&mut self, max_links: usize) {
        self.max_links = max_links;
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn context(&self) -> Option<&VoiceContext> {
        self.context.as_ref()
    }

    /// Move the pool to `context`. Links opened for a different context are
    /// torn down. Links that exist while no context is set were opened for
    /// offers that outran our own `joined` and are kept.
    pub async fn set_context(&mut self, context: Option<VoiceContext>) {
        if self.context.is_some() && self.context != context {
            self.close_all().await;
        }
        self.context = context;
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Remotes in id order.
    pub fn remotes_sorted(&self) -> Vec<ParticipantId> {
        let mut remotes: Vec<_> = self.links.keys().cloned().collect();
        remotes.sort();
        remotes
    }

    pub fn link(&self, remote: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    /// Open a link to `remote`, replacing any existing one.
    pub async fn connect(&mut self, remote: ParticipantId, role: LinkRole, tracks: &[TrackHandle]) -> Result<()> {
        if remote == self.local {
            return Ok(());
        }
        if self.links.contains_key(&remote) {
            self.destroy(&remote).await;
        } else if self.links.len() >= self.max_links {
            tracing::warn!(%remote, max = self.max_links, "Refusing peer link beyond mesh limit");
            return Err(ClientError::LinkLimit { max: self.max_links });
        }

        let id = self.next_link_id;
        self.next_link_id += 1;

        let events = TransportEvents::new(remote.clone(), id, self.transport_tx.clone());
        let transport = self
            .factory
            .create(&remote, &self.ice_servers, events)
            .map_err(|e| ClientError::negotiation(&remote, e))?;
        let link = PeerLink::open(
            id,
            self.local.clone(),
            remote.clone(),
            role,
            transport,
            self.outbox.clone(),
            tracks,
        )
        .await?;
        self.links.insert(remote, link);
        Ok(())
    }

    /// An offer from `from`: renegotiation on an existing link, or the first
    /// offer of a link we answer.
    pub async fn on_offer(&mut self, from: ParticipantId, sdp: String, tracks: &[TrackHandle]) -> Result<()> {
        if !self.links.contains_key(&from) {
            self.connect(from.clone(), LinkRole::Responder, tracks).await?;
        }
        let result = match self.links.get_mut(&from) {
            Some(link) => link.on_remote_offer(sdp).await,
            None => return Ok(()),
        };
        self.settle(&from, result).await
    }

    pub async fn on_answer(&mut self, from: ParticipantId, sdp: String) -> Result<()> {
        let result = match self.links.get_mut(&from) {
            Some(link) => link.on_remote_answer(sdp).await,
            None => return Ok(()),
        };
        self.settle(&from, result).await
    }

    pub async fn on_candidate(&mut self, from: ParticipantId, candidate: IceCandidate) -> Result<()> {
        let result = match self.links.get_mut(&from) {
            Some(link) => link.on_remote_candidate(candidate).await,
            None => return Ok(()),
        };
        self.settle(&from, result).await
    }

    /// The server could not deliver our offer/answer: the remote is gone.
    pub async fn on_relay_failed(&mut self, target: &ParticipantId) {
        self.destroy(target).await;
    }

    pub async fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(link) = self.links.get_mut(&event.remote) else {
            return;
        };
        if link.id() != event.link_id {
            // From a link that has since been replaced.
            return;
        }

        match event.kind {
            TransportEventKind::IceCandidate(candidate) => link.on_local_candidate(candidate),
            TransportEventKind::StateChanged(state) => {
                if link.on_transport_state(state) == LinkHealth::Failed {
                    self.destroy(&event.remote).await;
                } else if link.newly_connected() {
                    self.emit(VoiceEvent::LinkConnected { remote: event.remote });
                }
            }
            TransportEventKind::RemoteTrack { track_id, kind } => {
                link.on_remote_track(track_id.clone(), kind);
                self.emit(VoiceEvent::RemoteTrackAdded {
                    remote: event.remote,
                    track_id,
                    kind,
                });
            }
            TransportEventKind::RemoteTrackEnded { track_id } => {
                if link.on_remote_track_ended(&track_id) {
                    self.emit(VoiceEvent::RemoteTrackRemoved {
                        remote: event.remote,
                        track_id,
                    });
                }
            }
        }
    }

    /// Close and drop the link to `remote`, if any.
    pub async fn destroy(&mut self, remote: &ParticipantId) {
        if let Some(mut link) = self.links.remove(remote) {
            link.close().await;
            self.emit(VoiceEvent::LinkClosed { remote: remote.clone() });
        }
    }

    pub async fn close_all(&mut self) {
        for (remote, mut link) in self.links.drain() {
            link.close().await;
            let _ = self.events.send(VoiceEvent::LinkClosed { remote });
        }
    }

    /// After feeding a link: drop it on failure, announce it once connected.
    async fn settle(&mut self, remote: &ParticipantId, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            tracing::warn!(%remote, "Dropping peer link: {e}");
            self.destroy(remote).await;
            return Err(e);
        }
        if self.links.get_mut(remote).is_some_and(PeerLink::newly_connected) {
            self.emit(VoiceEvent::LinkConnected { remote: remote.clone() });
        }
        Ok(())
    }

    /// Apply `op` to every link; links it fails on are closed alone.
    async fn apply(&mut self, op: TrackOp<'_>) -> Result<()> {
        let mut failed = Vec::new();
        let mut first_error = None;
        for (remote, link) in self.links.iter_mut() {
            let result = match op {
                TrackOp::Send(track) => link.send_track(track).await,
                TrackOp::Remove(kind) => link.remove_track(kind).await,
            };
            if let Err(e) = result {
                tracing::warn!(%remote, "Track update failed on peer link: {e}");
                failed.push(remote.clone());
                first_error.get_or_insert(e);
            }
        }
        for remote in failed {
            self.destroy(&remote).await;
        }
        first_error.map_or(Ok(()), Err)
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone, Copy)]
enum TrackOp<'a> {
    Send(&'a TrackHandle),
    Remove(TrackKind),
}

#[async_trait]
impl TrackSink for PeerLinkPool {
    async fn add_track(&mut self, track: &TrackHandle) {
        let _ = self.apply(TrackOp::Send(track)).await;
    }

    async fn replace_track(&mut self, _kind: TrackKind, track: &TrackHandle) -> Result<()> {
        self.apply(TrackOp::Send(track)).await
    }

    async fn remove_track(&mut self, kind: TrackKind) {
        let _ = self.apply(TrackOp::Remove(kind)).await;
    }

    fn remotes(&self) -> Vec<ParticipantId> {
        self.links.keys().cloned().collect()
    }
}
