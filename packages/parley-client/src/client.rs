//! The voice client actor.
//!
//! One task owns the peer link pool, the track manager and the call state,
//! and serializes everything that touches them: application commands,
//! server signals, transport events and finished device captures. The
//! application drives it through a cloneable [`VoiceHandle`].

use parley_common::config::VoiceConfig;
use parley_common::signal::{ClientSignal, RosterState, ServerSignal};
use parley_common::{ChannelId, ParticipantId, ServerId, TrackToggleState, VoiceContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::call::CallState;
use crate::error::{CaptureError, CaptureErrorKind, ClientError, Result};
use crate::event::VoiceEvent;
use crate::gateway::{GatewayClient, GatewayEvent};
use crate::link::{LinkRole, NegotiationState};
use crate::media::{
    CaptureRequest, DeviceKind, MediaDevices, PeerTransportFactory, ScreenConstraints, TrackHandle, TrackKind,
    TransportEvent,
};
use crate::pool::PeerLinkPool;
use crate::track::{TrackManager, VideoSource};
use crate::SignalOutbox;

/// Something the application asks the voice client to do.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceCommand {
    JoinChannel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    LeaveChannel,
    StartCall(ParticipantId),
    AcceptCall(ParticipantId),
    RejectCall(ParticipantId),
    HangUp,
    EnableAudio { device_id: Option<String> },
    DisableAudio,
    SetMuted(bool),
    EnableVideo { device_id: Option<String> },
    DisableVideo,
    EnableScreenShare(ScreenConstraints),
    DisableScreenShare,
    SwitchVideoSource { show_screen: bool },
    SetMicrophone { device_id: String },
    SetCamera { device_id: String },
    /// Give up on a capture still waiting for device permission.
    CancelCapture(DeviceKind),
    /// The platform ended a local track (device unplugged, OS stop button).
    TrackEnded { track_id: String },
}

/// Snapshot of one peer link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub remote: ParticipantId,
    pub role: LinkRole,
    pub state: NegotiationState,
    /// Outbound track ids by kind.
    pub sending: Vec<(TrackKind, String)>,
    pub receiving: Vec<(String, TrackKind)>,
}

/// Snapshot of the whole client.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceStatus {
    pub participant: ParticipantId,
    pub context: Option<VoiceContext>,
    pub call: CallState,
    pub media: TrackToggleState,
    pub video_source: VideoSource,
    pub links: Vec<LinkStatus>,
}

enum Request {
    Command(VoiceCommand, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<VoiceStatus>),
}

struct CaptureOutcome {
    device: DeviceKind,
    seq: u64,
    result: std::result::Result<TrackHandle, CaptureError>,
}

struct PendingCapture {
    seq: u64,
    task: JoinHandle<()>,
}

/// Cloneable handle to a running [`VoiceClient`].
#[derive(Clone)]
pub struct VoiceHandle {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<VoiceEvent>,
}

impl VoiceHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Run a command. Local validation errors come back here; the server's
    /// verdict arrives later as an event.
    pub async fn execute(&self, command: VoiceCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Command(command, tx))
            .map_err(|_| ClientError::NotConnected)?;
        rx.await.map_err(|_| ClientError::NotConnected)?
    }

    pub async fn status(&self) -> Result<VoiceStatus> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Status(tx))
            .map_err(|_| ClientError::NotConnected)?;
        rx.await.map_err(|_| ClientError::NotConnected)
    }

    pub async fn join_channel(&self, server_id: impl Into<ServerId>, channel_id: impl Into<ChannelId>) -> Result<()> {
        self.execute(VoiceCommand::JoinChannel {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
        })
        .await
    }

    pub async fn leave_channel(&self) -> Result<()> {
        self.execute(VoiceCommand::LeaveChannel).await
    }

    pub async fn start_call(&self, peer: impl Into<ParticipantId>) -> Result<()> {
        self.execute(VoiceCommand::StartCall(peer.into())).await
    }

    pub async fn accept_call(&self, peer: impl Into<ParticipantId>) -> Result<()> {
        self.execute(VoiceCommand::AcceptCall(peer.into())).await
    }

    pub async fn reject_call(&self, peer: impl Into<ParticipantId>) -> Result<()> {
        self.execute(VoiceCommand::RejectCall(peer.into())).await
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.execute(VoiceCommand::HangUp).await
    }

    pub async fn enable_audio(&self, device_id: Option<String>) -> Result<()> {
        self.execute(VoiceCommand::EnableAudio { device_id }).await
    }

    pub async fn disable_audio(&self) -> Result<()> {
        self.execute(VoiceCommand::DisableAudio).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.execute(VoiceCommand::SetMuted(muted)).await
    }

    pub async fn enable_video(&self, device_id: Option<String>) -> Result<()> {
        self.execute(VoiceCommand::EnableVideo { device_id }).await
    }

    pub async fn disable_video(&self) -> Result<()> {
        self.execute(VoiceCommand::DisableVideo).await
    }

    pub async fn enable_screen_share(&self, constraints: ScreenConstraints) -> Result<()> {
        self.execute(VoiceCommand::EnableScreenShare(constraints)).await
    }

    pub async fn disable_screen_share(&self) -> Result<()> {
        self.execute(VoiceCommand::DisableScreenShare).await
    }

    pub async fn switch_video_source(&self, show_screen: bool) -> Result<()> {
        self.execute(VoiceCommand::SwitchVideoSource { show_screen }).await
    }

    pub async fn set_microphone(&self, device_id: impl Into<String>) -> Result<()> {
        self.execute(VoiceCommand::SetMicrophone {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn set_camera(&self, device_id: impl Into<String>) -> Result<()> {
        self.execute(VoiceCommand::SetCamera {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn cancel_capture(&self, device: DeviceKind) -> Result<()> {
        self.execute(VoiceCommand::CancelCapture(device)).await
    }

    pub async fn track_ended(&self, track_id: impl Into<String>) -> Result<()> {
        self.execute(VoiceCommand::TrackEnded {
            track_id: track_id.into(),
        })
        .await
    }
}

pub struct VoiceClient {
    outbox: SignalOutbox,
    inbound: mpsc::UnboundedReceiver<GatewayEvent>,
    requests: mpsc::UnboundedReceiver<Request>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    capture_tx: mpsc::UnboundedSender<CaptureOutcome>,
    capture_rx: mpsc::UnboundedReceiver<CaptureOutcome>,
    devices: Arc<dyn MediaDevices>,
    events: broadcast::Sender<VoiceEvent>,
    pool: PeerLinkPool,
    tracks: TrackManager,
    call: CallState,
    /// A join was sent and its `joined` has not arrived yet.
    pending_join: bool,
    captures: HashMap<DeviceKind, PendingCapture>,
    capture_seq: u64,
}

impl VoiceClient {
    /// Connect to the voice gateway at `url` and spawn the client task.
    pub fn connect(
        url: &str,
        token: impl Into<String>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> VoiceHandle {
        let (outbox, inbound) = GatewayClient::new(token, Some(url)).spawn();
        // Replaced by the server's limit on `ready`.
        let max_links = VoiceConfig::default().max_peer_links();
        let (client, handle) = Self::new(outbox, inbound, devices, factory, max_links);
        tokio::spawn(client.run());
        handle
    }

    /// Build a client over an existing signal channel pair.
    pub fn new(
        outbox: SignalOutbox,
        inbound: mpsc::UnboundedReceiver<GatewayEvent>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerTransportFactory>,
        max_links: usize,
    ) -> (Self, VoiceHandle) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let pool = PeerLinkPool::new(factory, outbox.clone(), transport_tx, events.clone(), max_links);
        let tracks = TrackManager::new(outbox.clone());

        let client = Self {
            outbox,
            inbound,
            requests,
            transport_rx,
            capture_tx,
            capture_rx,
            devices,
            events: events.clone(),
            pool,
            tracks,
            call: CallState::Idle,
            pending_join: false,
            captures: HashMap::new(),
            capture_seq: 0,
        };
        let handle = VoiceHandle {
            requests: requests_tx,
            events,
        };
        (client, handle)
    }

    /// Process inputs until every handle is dropped or the gateway is gone.
    pub async fn run(mut self) {
        while self.step().await {}
        self.shutdown().await;
    }

    /// Process one input. Returns `false` once there is nothing left to serve.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            request = self.requests.recv() => match request {
                Some(Request::Command(command, reply)) => {
                    let result = self.handle_command(command).await;
                    if let Err(e) = &result {
                        tracing::debug!("Voice command failed: {e}");
                    }
                    let _ = reply.send(result);
                }
                Some(Request::Status(reply)) => {
                    let _ = reply.send(self.status());
                }
                None => return false,
            },
            event = self.inbound.recv() => match event {
                Some(GatewayEvent::Signal(signal)) => self.handle_signal(signal).await,
                Some(GatewayEvent::Disconnected) => self.on_disconnected().await,
                None => return false,
            },
            Some(event) = self.transport_rx.recv() => self.pool.on_transport_event(event).await,
            Some(outcome) = self.capture_rx.recv() => self.on_capture(outcome).await,
        }
        true
    }

    pub fn status(&self) -> VoiceStatus {
        let links = self
            .pool
            .remotes_sorted()
            .into_iter()
            .filter_map(|remote| self.pool.link(&remote))
            .map(|link| LinkStatus {
                remote: link.remote().clone(),
                role: link.role(),
                state: link.state(),
                sending: [TrackKind::Audio, TrackKind::Video]
                    .into_iter()
                    .filter_map(|kind| link.outbound_track(kind).map(|t| (kind, t.id().to_owned())))
                    .collect(),
                receiving: {
                    let mut inbound: Vec<_> = link.inbound_tracks().map(|(id, kind)| (id.to_owned(), kind)).collect();
                    inbound.sort_by(|a, b| a.0.cmp(&b.0));
                    inbound
                },
            })
            .collect();

        VoiceStatus {
            participant: self.pool.local().clone(),
            context: self.pool.context().cloned(),
            call: self.call.clone(),
            media: self.tracks.toggle_state(),
            video_source: self.tracks.video_source(),
            links,
        }
    }

    async fn handle_command(&mut self, command: VoiceCommand) -> Result<()> {
        match command {
            VoiceCommand::JoinChannel { server_id, channel_id } => {
                self.pending_join = true;
                self.send(ClientSignal::JoinChannel { server_id, channel_id })
            }
            VoiceCommand::LeaveChannel => {
                if self.pool.context().is_none() && !self.pending_join {
                    return Err(ClientError::NotInVoice);
                }
                self.send(ClientSignal::LeaveChannel)
            }
            VoiceCommand::StartCall(peer) => {
                self.call.start(peer.clone())?;
                self.send(ClientSignal::StartCall { peer })
            }
            VoiceCommand::AcceptCall(peer) => {
                self.call.accept(&peer)?;
                self.send(ClientSignal::AcceptCall { peer })
            }
            VoiceCommand::RejectCall(peer) => {
                self.call.reject(&peer)?;
                self.send(ClientSignal::RejectCall { peer })
            }
            VoiceCommand::HangUp => {
                self.call.hang_up()?;
                self.send(ClientSignal::HangUp)
            }

            VoiceCommand::EnableAudio { device_id } => {
                self.request_capture(CaptureRequest::Microphone { device_id });
                Ok(())
            }
            VoiceCommand::SetMicrophone { device_id } => {
                self.request_capture(CaptureRequest::Microphone {
                    device_id: Some(device_id),
                });
                Ok(())
            }
            VoiceCommand::EnableVideo { device_id } => {
                self.request_capture(CaptureRequest::Camera { device_id });
                Ok(())
            }
            VoiceCommand::SetCamera { device_id } => {
                self.request_capture(CaptureRequest::Camera {
                    device_id: Some(device_id),
                });
                Ok(())
            }
            VoiceCommand::EnableScreenShare(constraints) => {
                self.request_capture(CaptureRequest::Screen(constraints));
                Ok(())
            }

            VoiceCommand::DisableAudio => {
                self.abort_capture(DeviceKind::Microphone);
                self.tracks.disable_audio(&mut self.pool).await;
                Ok(())
            }
            VoiceCommand::DisableVideo => {
                self.abort_capture(DeviceKind::Camera);
                self.tracks.disable_video(&mut self.pool).await;
                Ok(())
            }
            VoiceCommand::DisableScreenShare => {
                self.abort_capture(DeviceKind::Screen);
                self.tracks.disable_screen_share(&mut self.pool).await;
                Ok(())
            }
            VoiceCommand::SetMuted(muted) => self.tracks.set_muted(muted),
            VoiceCommand::SwitchVideoSource { show_screen } => {
                self.tracks.switch_video_source(show_screen, &mut self.pool).await
            }

            VoiceCommand::CancelCapture(device) => {
                if self.abort_capture(device) {
                    self.emit(VoiceEvent::CaptureFailed(CaptureError::new(
                        device,
                        CaptureErrorKind::Cancelled,
                    )));
                }
                Ok(())
            }
            VoiceCommand::TrackEnded { track_id } => {
                self.tracks.on_track_ended(&track_id, &mut self.pool).await;
                Ok(())
            }
        }
    }

    async fn handle_signal(&mut self, signal: ServerSignal) {
        match signal {
            ServerSignal::Ready {
                participant_id,
                ice_servers,
                max_roster_size,
                ..
            } => {
                tracing::info!(participant = %participant_id, max_roster_size, "Voice gateway ready");
                self.pool.set_identity(participant_id.clone(), ice_servers.clone());
                self.pool.set_max_links(max_roster_size.saturating_sub(1));
                self.emit(VoiceEvent::Ready {
                    participant_id,
                    ice_servers,
                });
            }
            ServerSignal::HeartbeatAck => {}

            ServerSignal::Joined { context, roster } => {
                self.pending_join = false;
                // Prior members offer to us; we only answer.
                self.pool.set_context(Some(context.clone())).await;
                self.tracks.announce();
                self.emit(VoiceEvent::Joined { context, roster });
            }
            ServerSignal::Left { context } => {
                if self.pool.context() == Some(&context) {
                    self.pool.set_context(None).await;
                }
                self.emit(VoiceEvent::Left { context });
            }
            ServerSignal::RosterChanged {
                context,
                state,
                participant,
            } => {
                if self.pool.context() != Some(&context) || participant == *self.pool.local() {
                    return;
                }
                match state {
                    RosterState::Joined => {
                        // Direct contexts are linked by `call_accepted`.
                        if !context.is_direct() {
                            let tracks = self.tracks.outbound_tracks();
                            if let Err(e) = self.pool.connect(participant.clone(), LinkRole::Initiator, &tracks).await {
                                tracing::warn!(remote = %participant, "Could not link to new member: {e}");
                            }
                        }
                        self.emit(VoiceEvent::ParticipantJoined { participant });
                    }
                    RosterState::Left => {
                        self.pool.destroy(&participant).await;
                        self.emit(VoiceEvent::ParticipantLeft { participant });
                    }
                }
            }

            ServerSignal::IncomingCall { caller, call_id } => {
                self.call.on_incoming(caller.clone(), call_id);
                self.emit(VoiceEvent::IncomingCall { caller, call_id });
            }
            ServerSignal::CallRinging { callee, call_id } => {
                self.call.on_ringing(callee.clone(), call_id);
                self.emit(VoiceEvent::CallRinging { callee, call_id });
            }
            ServerSignal::CallAccepted {
                peer,
                call_id,
                initiator,
            } => {
                self.call.on_accepted(peer.clone(), call_id);
                self.pending_join = false;
                // Channel links go first.
                self.pool.set_context(Some(VoiceContext::direct(peer.clone()))).await;
                self.tracks.announce();
                if initiator {
                    let tracks = self.tracks.outbound_tracks();
                    if let Err(e) = self.pool.connect(peer.clone(), LinkRole::Initiator, &tracks).await {
                        tracing::warn!(remote = %peer, "Could not link to call peer: {e}");
                    }
                }
                self.emit(VoiceEvent::CallActive { peer, call_id });
            }
            ServerSignal::CallEnded {
                peer,
                call_id,
                reason,
            } => {
                self.call.on_ended(&peer, call_id);
                if self.pool.context() == Some(&VoiceContext::direct(peer.clone())) {
                    self.pool.set_context(None).await;
                }
                self.emit(VoiceEvent::CallEnded { peer, call_id, reason });
            }

            ServerSignal::Offer { from, sdp } => {
                if self.pool.context().is_none() && !self.pending_join {
                    tracing::debug!(remote = %from, "Ignoring offer outside voice");
                    return;
                }
                let tracks = self.tracks.outbound_tracks();
                if let Err(e) = self.pool.on_offer(from, sdp, &tracks).await {
                    tracing::warn!("Answering offer failed: {e}");
                }
            }
            ServerSignal::Answer { from, sdp } => {
                if let Err(e) = self.pool.on_answer(from, sdp).await {
                    tracing::warn!("Applying answer failed: {e}");
                }
            }
            ServerSignal::IceCandidate { from, candidate } => {
                if let Err(e) = self.pool.on_candidate(from, candidate).await {
                    tracing::warn!("Applying ICE candidate failed: {e}");
                }
            }
            ServerSignal::SwitchVideoSource { from, show_screen } => {
                self.emit(VoiceEvent::RemoteVideoSource {
                    participant: from,
                    show_screen,
                });
            }
            ServerSignal::MediaState {
                participant,
                notice,
                state,
            } => {
                self.emit(VoiceEvent::MediaStateChanged {
                    participant,
                    notice,
                    state,
                });
            }
            ServerSignal::RelayFailed { target, kind } => {
                tracing::debug!(%target, %kind, "Relay failed, dropping link");
                self.pool.on_relay_failed(&target).await;
            }
            ServerSignal::Error { code, message } => {
                tracing::warn!(code, "Voice server error: {message}");
                self.pending_join = false;
                // A refused `start_call` never gets a `call_ringing`.
                if matches!(self.call, CallState::Outgoing { call_id: None, .. }) {
                    self.call = CallState::Idle;
                }
                self.emit(VoiceEvent::ServerError { code, message });
            }
        }
    }

    async fn on_disconnected(&mut self) {
        tracing::info!("Voice gateway disconnected");
        self.pool.close_all().await;
        self.pool.set_context(None).await;
        self.call = CallState::Idle;
        self.pending_join = false;
        self.emit(VoiceEvent::Disconnected);
    }

    fn request_capture(&mut self, request: CaptureRequest) {
        let device = request.device();
        self.abort_capture(device);

        self.capture_seq += 1;
        let seq = self.capture_seq;
        let devices = self.devices.clone();
        let tx = self.capture_tx.clone();
        let task = tokio::spawn(async move {
            let result = devices.acquire(request).await;
            let _ = tx.send(CaptureOutcome { device, seq, result });
        });
        self.captures.insert(device, PendingCapture { seq, task });
    }

    /// Returns whether a capture was pending.
    fn abort_capture(&mut self, device: DeviceKind) -> bool {
        match self.captures.remove(&device) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    async fn on_capture(&mut self, outcome: CaptureOutcome) {
        let current = self
            .captures
            .get(&outcome.device)
            .is_some_and(|pending| pending.seq == outcome.seq);
        if !current {
            // Superseded or cancelled while the device was opening.
            if let Ok(track) = outcome.result {
                track.stop();
            }
            return;
        }
        self.captures.remove(&outcome.device);

        let track = match outcome.result {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Capture failed: {e}");
                self.emit(VoiceEvent::CaptureFailed(e));
                return;
            }
        };

        let result = match outcome.device {
            DeviceKind::Microphone => self.tracks.set_microphone(track, &mut self.pool).await,
            DeviceKind::Camera => self.tracks.set_camera(track, &mut self.pool).await,
            DeviceKind::Screen => self.tracks.enable_screen_share(track, &mut self.pool).await,
        };
        if let Err(e) = result {
            tracing::warn!(device = %outcome.device, "Installing captured track failed: {e}");
        }
    }

    async fn shutdown(&mut self) {
        for (_, pending) in self.captures.drain() {
            pending.task.abort();
        }
        self.pool.close_all().await;
        self.tracks.release_all();
    }

    fn send(&self, signal: ClientSignal) -> Result<()> {
        self.outbox.send(signal).map_err(|_| ClientError::NotConnected)
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }
}
