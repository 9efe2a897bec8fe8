//! # parley-voice
//!
//! Voice/video signaling server for Parley.
//!
//! Architecture: full mesh with a signaling relay
//! - Each voice channel or accepted direct call is a voice context
//! - Every member of a context holds one peer link to every other member
//! - Media never touches the server; it only relays offers, answers,
//!   ICE candidates and track-state notices between participants
//! - The registry is the single source of truth for who is in voice where

pub mod access;
pub mod calls;
pub mod handler;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod session;

use axum::Router;
use parley_common::config::VoiceConfig;
use std::sync::Arc;

use crate::access::{Authenticator, VoiceAccess};
use crate::calls::CallInvitations;
use crate::hub::ConnectionHub;
use crate::registry::VoiceSessionRegistry;
use crate::relay::SignalingRelay;

/// Voice server state — shared across all voice connections.
pub struct VoiceServerState {
    pub config: VoiceConfig,
    pub hub: ConnectionHub,
    pub registry: VoiceSessionRegistry,
    pub relay: SignalingRelay,
    pub calls: CallInvitations,
    pub authenticator: Arc<dyn Authenticator>,
    pub access: Arc<dyn VoiceAccess>,
}

impl VoiceServerState {
    pub fn new(
        config: VoiceConfig,
        authenticator: Arc<dyn Authenticator>,
        access: Arc<dyn VoiceAccess>,
    ) -> Self {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), config.max_roster_size);
        let relay = SignalingRelay::new(hub.clone(), registry.clone());
        let calls = CallInvitations::new(hub.clone(), registry.clone(), config.ring_timeout());

        Self {
            config,
            hub,
            registry,
            relay,
            calls,
            authenticator,
            access,
        }
    }
}

/// Voice server handle.
#[derive(Clone)]
pub struct VoiceServer {
    state: Arc<VoiceServerState>,
}

impl VoiceServer {
    pub fn new(
        config: VoiceConfig,
        authenticator: Arc<dyn Authenticator>,
        access: Arc<dyn VoiceAccess>,
    ) -> Self {
        Self {
            state: Arc::new(VoiceServerState::new(config, authenticator, access)),
        }
    }

    pub fn state(&self) -> &Arc<VoiceServerState> {
        &self.state
    }

    /// Build the voice signaling router (WebSocket plus HTTP side routes).
    pub fn build_router(&self) -> Router {
        handler::build_router(self.state.clone())
    }
}
