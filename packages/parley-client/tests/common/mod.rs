//! Test harness: voice clients wired to an in-process voice server, with a
//! fake media network standing in for real peer connections.
//!
//! The fake session descriptions list the sender slots of the side that wrote
//! them (`owner;1:audio,2:video`). A receiver names remote tracks after the
//! slot (`owner/1`), so replacing the track inside a slot keeps the remote
//! track alive, as with real transceivers. What each slot actually carries is
//! recorded in [`Network`], which is how tests tell camera from screen.

#![allow(dead_code)]

use async_trait::async_trait;
use parley_client::gateway::GatewayEvent;
use parley_client::media::{
    SenderId, SessionDescription, TransportError, TransportEventKind, TransportEvents, TransportState,
};
use parley_client::{
    CaptureError, CaptureErrorKind, CaptureRequest, DeviceKind, LocalTrack, MediaDevices, PeerTransport,
    PeerTransportFactory, TrackHandle, TrackKind, VoiceClient, VoiceEvent, VoiceHandle, VoiceStatus,
};
use parley_common::config::{IceServerConfig, VoiceConfig};
use parley_common::signal::{ClientSignal, IceCandidate};
use parley_common::{ParleyError, ParleyResult, ParticipantId};
use parley_voice::access::{AllowAll, Authenticator};
use parley_voice::session::{SessionFlow, VoiceSession};
use parley_voice::VoiceServerState;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Let every task run until nothing is left to do. Needs a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// === Media network ===

type Pair = (String, String);

#[derive(Default)]
struct NetState {
    /// (owner, remote) -> slot -> (kind, local track id)
    sending: HashMap<Pair, BTreeMap<u64, (TrackKind, String)>>,
    offers: HashMap<String, usize>,
    /// What each side applied, in order: descriptions and candidates.
    applied: HashMap<Pair, Vec<String>>,
    events: HashMap<Pair, TransportEvents>,
    fail_replace: HashSet<Pair>,
}

#[derive(Clone, Default)]
pub struct Network(Arc<Mutex<NetState>>);

impl Network {
    pub fn factory(&self, owner: &str) -> Arc<dyn PeerTransportFactory> {
        Arc::new(MockFactory {
            owner: owner.into(),
            net: self.clone(),
        })
    }

    /// Local track id carried by `owner`'s `kind` slot toward `remote`.
    pub fn content(&self, owner: &str, remote: &str, kind: TrackKind) -> Option<String> {
        let state = self.0.lock().unwrap();
        state
            .sending
            .get(&(owner.into(), remote.into()))?
            .values()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
    }

    pub fn slots(&self, owner: &str, remote: &str, kind: TrackKind) -> usize {
        let state = self.0.lock().unwrap();
        state
            .sending
            .get(&(owner.into(), remote.into()))
            .map_or(0, |slots| slots.values().filter(|(k, _)| *k == kind).count())
    }

    pub fn offers_created(&self, owner: &str) -> usize {
        self.0.lock().unwrap().offers.get(owner).copied().unwrap_or(0)
    }

    pub fn applied(&self, owner: &str, remote: &str) -> Vec<String> {
        let state = self.0.lock().unwrap();
        state
            .applied
            .get(&(owner.into(), remote.into()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_replace(&self, owner: &str, remote: &str) {
        self.0.lock().unwrap().fail_replace.insert((owner.into(), remote.into()));
    }

    /// Make the transport from `owner` to `remote` report a failure.
    pub fn break_link(&self, owner: &str, remote: &str) {
        let state = self.0.lock().unwrap();
        if let Some(events) = state.events.get(&(owner.into(), remote.into())) {
            events.emit(TransportEventKind::StateChanged(TransportState::Failed));
        }
    }
}

struct MockFactory {
    owner: String,
    net: Network,
}

impl PeerTransportFactory for MockFactory {
    fn create(
        &self,
        remote: &ParticipantId,
        _ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let pair = (self.owner.clone(), remote.to_string());
        let mut state = self.net.0.lock().unwrap();
        state.events.insert(pair.clone(), events.clone());
        state.sending.remove(&pair);
        state.applied.remove(&pair);
        drop(state);

        Ok(Box::new(MockTransport {
            pair,
            net: self.net.clone(),
            events,
            side: Mutex::new(Side::default()),
        }))
    }
}

#[derive(Default)]
struct Side {
    senders: BTreeMap<u64, (TrackKind, String)>,
    next_sender: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_tracks: BTreeSet<String>,
    connected: bool,
    candidates: u32,
}

pub struct MockTransport {
    pair: Pair,
    net: Network,
    events: TransportEvents,
    side: Mutex<Side>,
}

impl MockTransport {
    fn describe(&self, side: &Side) -> String {
        let slots: Vec<String> = side
            .senders
            .iter()
            .map(|(slot, (kind, _))| format!("{slot}:{}", kind_name(*kind)))
            .collect();
        format!("{};{}", self.pair.0, slots.join(","))
    }

    fn publish(&self, side: &Side) {
        self.net
            .0
            .lock()
            .unwrap()
            .sending
            .insert(self.pair.clone(), side.senders.clone());
    }

    fn record(&self, line: String) {
        self.net
            .0
            .lock()
            .unwrap()
            .applied
            .entry(self.pair.clone())
            .or_default()
            .push(line);
    }

    fn check_connected(&self, side: &mut Side) {
        if !side.connected && side.local.is_some() && side.remote.is_some() {
            side.connected = true;
            self.events
                .emit(TransportEventKind::StateChanged(TransportState::Connected));
        }
    }
}

fn kind_name(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        *self
            .net
            .0
            .lock()
            .unwrap()
            .offers
            .entry(self.pair.0.clone())
            .or_default() += 1;
        let side = self.side.lock().unwrap();
        Ok(self.describe(&side))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let side = self.side.lock().unwrap();
        Ok(self.describe(&side))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let mut side = self.side.lock().unwrap();
        side.local = Some(description);
        side.candidates += 1;
        self.events
            .emit(TransportEventKind::IceCandidate(IceCandidate::new(format!(
                "cand-{}-{}",
                self.pair.0, side.candidates
            ))));
        self.check_connected(&mut side);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let (owner, slots) = description
            .sdp
            .split_once(';')
            .ok_or_else(|| TransportError("malformed description".into()))?;

        let mut tracks = BTreeMap::new();
        for slot in slots.split(',').filter(|s| !s.is_empty()) {
            let (id, kind) = slot
                .split_once(':')
                .ok_or_else(|| TransportError("malformed slot".into()))?;
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return Err(TransportError("unknown media kind".into())),
            };
            tracks.insert(format!("{owner}/{id}"), kind);
        }

        self.record(format!("remote {:?}", description.kind));
        let mut side = self.side.lock().unwrap();
        for gone in side.remote_tracks.clone() {
            if !tracks.contains_key(&gone) {
                side.remote_tracks.remove(&gone);
                self.events
                    .emit(TransportEventKind::RemoteTrackEnded { track_id: gone });
            }
        }
        for (track_id, kind) in tracks {
            if side.remote_tracks.insert(track_id.clone()) {
                self.events
                    .emit(TransportEventKind::RemoteTrack { track_id, kind });
            }
        }
        side.remote = Some(description);
        self.check_connected(&mut side);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.side.lock().unwrap().local = None;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.side.lock().unwrap().remote.is_none() {
            return Err(TransportError("candidate before remote description".into()));
        }
        self.record(format!("candidate {}", candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: TrackHandle) -> Result<SenderId, TransportError> {
        let mut side = self.side.lock().unwrap();
        side.next_sender += 1;
        let slot = side.next_sender;
        side.senders.insert(slot, (track.kind(), track.id().to_owned()));
        self.publish(&side);
        Ok(SenderId(slot))
    }

    async fn replace_track(&self, sender: SenderId, track: TrackHandle) -> Result<(), TransportError> {
        if self.net.0.lock().unwrap().fail_replace.contains(&self.pair) {
            return Err(TransportError("replace refused".into()));
        }
        let mut side = self.side.lock().unwrap();
        if let Some(slot) = side.senders.get_mut(&sender.0) {
            slot.1 = track.id().to_owned();
        }
        self.publish(&side);
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError> {
        let mut side = self.side.lock().unwrap();
        side.senders.remove(&sender.0);
        self.publish(&side);
        Ok(())
    }

    async fn close(&self) {
        self.net.0.lock().unwrap().sending.remove(&self.pair);
    }
}

// === Capture devices ===

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    device: DeviceKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn device(&self) -> DeviceKind {
        self.device
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDevices {
    owner: String,
    counter: AtomicU32,
    fail: Mutex<HashMap<DeviceKind, CaptureErrorKind>>,
    delay: Mutex<HashMap<DeviceKind, Duration>>,
    issued: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockDevices {
    pub fn fail(&self, device: DeviceKind, kind: CaptureErrorKind) {
        self.fail.lock().unwrap().insert(device, kind);
    }

    pub fn delay(&self, device: DeviceKind, by: Duration) {
        self.delay.lock().unwrap().insert(device, by);
    }

    pub fn issued(&self) -> Vec<Arc<MockTrack>> {
        self.issued.lock().unwrap().clone()
    }

    pub fn track(&self, id: &str) -> Option<Arc<MockTrack>> {
        self.issued().into_iter().find(|t| t.id == id)
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire(&self, request: CaptureRequest) -> Result<TrackHandle, CaptureError> {
        let device = request.device();
        let delay = self.delay.lock().unwrap().get(&device).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.fail.lock().unwrap().get(&device).copied();
        if let Some(kind) = failure {
            return Err(CaptureError::new(device, kind));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let track = Arc::new(MockTrack {
            id: format!("{}-{device}-{n}", self.owner),
            device,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        self.issued.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

// === Server and clients ===

/// Tokens are participant ids.
struct TokenIsName;

impl Authenticator for TokenIsName {
    fn authenticate(&self, token: &str) -> ParleyResult<ParticipantId> {
        if token.is_empty() {
            return Err(ParleyError::InvalidToken);
        }
        Ok(ParticipantId::from(token))
    }
}

pub struct Harness {
    pub state: Arc<VoiceServerState>,
    pub net: Network,
    /// Link limit clients start with, before the server's `ready`.
    client_links: usize,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(VoiceConfig::default(), VoiceConfig::default().max_peer_links())
    }

    pub fn with_config(config: VoiceConfig, client_links: usize) -> Self {
        Self {
            state: Arc::new(VoiceServerState::new(config, Arc::new(TokenIsName), Arc::new(AllowAll))),
            net: Network::default(),
            client_links,
        }
    }

    /// Connect a voice client for `who` and wait until it is ready.
    pub async fn client(&self, who: &str) -> Peer {
        let (outbox, mut outbound) = mpsc::unbounded_channel::<ClientSignal>();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
        let (kill, mut killed) = oneshot::channel::<()>();

        let forward = gateway_tx.clone();
        // A real gateway outlives any one connection.
        let gateway = gateway_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = server_rx.recv().await {
                if forward.send(GatewayEvent::Signal(signal)).is_err() {
                    break;
                }
            }
        });

        let state = self.state.clone();
        tokio::spawn(async move {
            let mut session = VoiceSession::new(state, server_tx);
            loop {
                tokio::select! {
                    signal = outbound.recv() => match signal {
                        Some(signal) => {
                            if session.handle(signal).await == SessionFlow::Close {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut killed => break,
                }
            }
            session.close().await;
            let _ = gateway_tx.send(GatewayEvent::Disconnected);
        });

        outbox
            .send(ClientSignal::Identify { token: who.into() })
            .unwrap();

        let devices = Arc::new(MockDevices {
            owner: who.into(),
            ..Default::default()
        });
        let (client, handle) = VoiceClient::new(
            outbox,
            gateway_rx,
            devices.clone(),
            self.net.factory(who),
            self.client_links,
        );
        let events = handle.subscribe();
        tokio::spawn(client.run());
        settle().await;

        Peer {
            id: ParticipantId::from(who),
            handle,
            events,
            devices,
            kill: Some(kill),
            _gateway: gateway,
        }
    }
}

pub struct Peer {
    pub id: ParticipantId,
    pub handle: VoiceHandle,
    pub events: broadcast::Receiver<VoiceEvent>,
    pub devices: Arc<MockDevices>,
    kill: Option<oneshot::Sender<()>>,
    _gateway: mpsc::UnboundedSender<GatewayEvent>,
}

impl Peer {
    pub async fn status(&self) -> VoiceStatus {
        self.handle.status().await.unwrap()
    }

    pub fn events(&mut self) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Drop the connection without leaving first.
    pub fn disconnect(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    pub async fn join(&self, channel: &str) {
        self.handle.join_channel("general", channel).await.unwrap();
        settle().await;
    }
}
