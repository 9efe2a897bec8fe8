//! Parley voice client engine.
//!
//! Joins voice channels and direct calls through the Parley voice gateway and
//! keeps a full mesh of peer links to everyone else in the same context.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parley_client::{MediaDevices, PeerTransportFactory, VoiceClient, VoiceEvent};
//!
//! async fn run(devices: Arc<dyn MediaDevices>, transports: Arc<dyn PeerTransportFactory>) -> parley_client::Result<()> {
//!     let voice = VoiceClient::connect("ws://localhost:8082/voice", "my-access-token", devices, transports);
//!     let mut events = voice.subscribe();
//!
//!     voice.enable_audio(None).await?;
//!     voice.join_channel("general", "voice-1").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let VoiceEvent::ParticipantJoined { participant } = event {
//!             println!("{participant} joined");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The platform supplies capture devices ([`MediaDevices`]) and the
//! peer-to-peer transport ([`PeerTransportFactory`]); everything about who
//! links to whom, and when to offer, answer or renegotiate, lives here.

pub mod call;
pub mod client;
pub mod error;
pub mod event;
pub mod gateway;
pub mod link;
pub mod media;
pub mod pool;
pub mod track;

#[cfg(test)]
mod testing;

use parley_common::signal::ClientSignal;
use tokio::sync::mpsc;

/// Outbound signals, in send order, to the voice gateway.
pub type SignalOutbox = mpsc::UnboundedSender<ClientSignal>;

pub use call::CallState;
pub use client::{LinkStatus, VoiceClient, VoiceCommand, VoiceHandle, VoiceStatus};
pub use error::{CaptureError, CaptureErrorKind, ClientError, Result};
pub use event::VoiceEvent;
pub use gateway::{GatewayClient, GatewayEvent};
pub use link::{LinkRole, NegotiationState, PeerLink};
pub use media::{
    CaptureRequest, DeviceKind, LocalTrack, MediaDevices, PeerTransport, PeerTransportFactory, ScreenConstraints,
    TrackHandle, TrackKind,
};
pub use pool::PeerLinkPool;
pub use track::{TrackManager, TrackSink, VideoSource};
