//! Voice permissions.
//!
//! Bitfield permissions with the platform's bit positions. The voice core
//! only asks one question: may this participant connect to this channel?

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Voice-related permissions of a member in a server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permissions: i64 {
        /// See the channel at all
        const VIEW_CHANNEL          = 1 << 0;
        /// Enter the channel's voice context
        const CONNECT               = 1 << 25;
        /// Bypasses every other bit
        const ADMINISTRATOR         = 1 << 40;
    }
}

impl Permissions {
    /// What a member gets when no grant says otherwise.
    pub fn default_everyone() -> Self {
        Self::VIEW_CHANNEL | Self::CONNECT
    }

    pub fn is_admin(&self) -> bool {
        self.contains(Self::ADMINISTRATOR)
    }

    /// `required` is satisfied in full, or the holder is an administrator.
    pub fn has(&self, required: Permissions) -> bool {
        self.is_admin() || self.contains(required)
    }

    /// Joining a voice channel needs to see it and to connect to it.
    pub fn can_join_voice(&self) -> bool {
        self.has(Self::VIEW_CHANNEL | Self::CONNECT)
    }
}
