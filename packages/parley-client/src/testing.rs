//! In-memory tracks, transports and sinks for unit tests.

use async_trait::async_trait;
use parley_common::signal::{ClientSignal, IceCandidate};
use parley_common::ParticipantId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{ClientError, Result};
use crate::media::{
    DeviceKind, LocalTrack, PeerTransport, SdpKind, SenderId, SessionDescription, TrackHandle, TrackKind,
    TransportError,
};
use crate::track::TrackSink;

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    device: DeviceKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: &str, device: DeviceKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            device,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn handle(id: &str, device: DeviceKind) -> (Arc<Self>, TrackHandle) {
        let track = Self::new(id, device);
        let handle: TrackHandle = track.clone();
        (track, handle)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
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

/// Transport that records every call as a line of text.
#[derive(Default)]
pub struct FakeTransport {
    pub log: Arc<Mutex<Vec<String>>>,
    next_sender: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> (Box<Self>, Arc<Mutex<Vec<String>>>) {
        let transport = Box::new(Self::default());
        let log = transport.log.clone();
        (transport, log)
    }

    fn record(&self, line: impl Into<String>) {
        self.log.lock().unwrap().push(line.into());
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> std::result::Result<String, TransportError> {
        self.record("create_offer");
        Ok("offer-sdp".into())
    }

    async fn create_answer(&self) -> std::result::Result<String, TransportError> {
        self.record("create_answer");
        Ok("answer-sdp".into())
    }

    async fn set_local_description(&self, description: SessionDescription) -> std::result::Result<(), TransportError> {
        self.record(format!("local {}", sdp_kind(description.kind)));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> std::result::Result<(), TransportError> {
        if description.sdp == "garbage" {
            return Err(TransportError("malformed description".into()));
        }
        self.record(format!("remote {}", sdp_kind(description.kind)));
        Ok(())
    }

    async fn rollback(&self) -> std::result::Result<(), TransportError> {
        self.record("rollback");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> std::result::Result<(), TransportError> {
        self.record(format!("candidate {}", candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: TrackHandle) -> std::result::Result<SenderId, TransportError> {
        self.record(format!("add {}", track.id()));
        Ok(SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst)))
    }

    async fn replace_track(&self, _sender: SenderId, track: TrackHandle) -> std::result::Result<(), TransportError> {
        self.record(format!("replace {}", track.id()));
        Ok(())
    }

    async fn remove_track(&self, _sender: SenderId) -> std::result::Result<(), TransportError> {
        self.record("remove");
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
    }
}

fn sdp_kind(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    Add(String),
    Replace(TrackKind, String),
    Remove(TrackKind),
}

/// Track sink that records operations instead of touching links.
#[derive(Default)]
pub struct FakeSink {
    pub ops: Vec<SinkOp>,
    pub remotes: Vec<ParticipantId>,
    pub fail_replace_with: Option<String>,
}

#[async_trait]
impl TrackSink for FakeSink {
    async fn add_track(&mut self, track: &TrackHandle) {
        self.ops.push(SinkOp::Add(track.id().into()));
    }

    async fn replace_track(&mut self, kind: TrackKind, track: &TrackHandle) -> Result<()> {
        self.ops.push(SinkOp::Replace(kind, track.id().into()));
        if self.fail_replace_with.as_deref() == Some(track.id()) {
            return Err(ClientError::Negotiation {
                remote: "bob".into(),
                message: "replace refused".into(),
            });
        }
        Ok(())
    }

    async fn remove_track(&mut self, kind: TrackKind) {
        self.ops.push(SinkOp::Remove(kind));
    }

    fn remotes(&self) -> Vec<ParticipantId> {
        self.remotes.clone()
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<ClientSignal>) -> Vec<ClientSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}
