//! # parley-common
//!
//! Shared types, wire protocol, configuration, and error handling used by the
//! Parley voice server and client. No business logic lives here, only the
//! contracts both ends agree on.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod permissions;
pub mod signal;

pub use context::{CallPair, ContextId, MediaNotice, RosterMember, TrackToggleState, VoiceContext};
pub use error::{ParleyError, ParleyResult};
pub use ids::{ChannelId, ParticipantId, ServerId};
