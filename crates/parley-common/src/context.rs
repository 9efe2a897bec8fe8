//! Voice contexts, rosters, and the replicated per-participant track state.
//!
//! A participant is in at most one voice context at a time:
//! - a channel of a community server (group voice, any number of members)
//! - a direct call with exactly one other participant
//!
//! Clients see a [`VoiceContext`] from their own point of view (a direct
//! context names the *other* party). The server keys rosters by
//! [`ContextId`], where a direct call is the unordered pair of both parties so
//! that caller and callee share one roster.

use crate::ids::{ChannelId, ParticipantId, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The voice scope a participant is transmitting/receiving in, as seen by
/// that participant. "Not in voice" is `Option::<VoiceContext>::None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VoiceContext {
    Channel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    Direct {
        peer_id: ParticipantId,
    },
}

impl VoiceContext {
    pub fn channel(server_id: impl Into<ServerId>, channel_id: impl Into<ChannelId>) -> Self {
        Self::Channel {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn direct(peer_id: impl Into<ParticipantId>) -> Self {
        Self::Direct {
            peer_id: peer_id.into(),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct { .. })
    }

    /// The server-side roster key for this context when viewed by `me`.
    pub fn id_for(&self, me: &ParticipantId) -> ContextId {
        match self {
            Self::Channel {
                server_id,
                channel_id,
            } => ContextId::Channel {
                server_id: server_id.clone(),
                channel_id: channel_id.clone(),
            },
            Self::Direct { peer_id } => ContextId::Direct(CallPair::new(me.clone(), peer_id.clone())),
        }
    }
}

impl fmt::Display for VoiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel {
                server_id,
                channel_id,
            } => write!(f, "{server_id}/{channel_id}"),
            Self::Direct { peer_id } => write!(f, "direct:{peer_id}"),
        }
    }
}

/// Unordered pair of call participants. `low <= high` always holds, so
/// `CallPair::new(a, b) == CallPair::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallPair {
    low: ParticipantId,
    high: ParticipantId,
}

impl CallPair {
    pub fn new(a: ParticipantId, b: ParticipantId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn contains(&self, who: &ParticipantId) -> bool {
        &self.low == who || &self.high == who
    }

    /// The party of the pair that is not `who`, if `who` is in the pair.
    pub fn other(&self, who: &ParticipantId) -> Option<&ParticipantId> {
        if &self.low == who {
            Some(&self.high)
        } else if &self.high == who {
            Some(&self.low)
        } else {
            None
        }
    }
}

/// Server-side roster key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextId {
    Channel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    Direct(CallPair),
}

impl ContextId {
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }

    /// Project the key into the client-facing context of `viewer`.
    ///
    /// Returns `None` for a direct context `viewer` is not part of.
    pub fn view_for(&self, viewer: &ParticipantId) -> Option<VoiceContext> {
        match self {
            Self::Channel {
                server_id,
                channel_id,
            } => Some(VoiceContext::Channel {
                server_id: server_id.clone(),
                channel_id: channel_id.clone(),
            }),
            Self::Direct(pair) => pair.other(viewer).map(|peer| VoiceContext::Direct {
                peer_id: peer.clone(),
            }),
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel {
                server_id,
                channel_id,
            } => write!(f, "{server_id}/{channel_id}"),
            Self::Direct(pair) => write!(f, "direct:{}+{}", pair.low, pair.high),
        }
    }
}

/// Lightweight state notice a participant broadcasts to its context so that
/// remote UIs stay consistent without renegotiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaNotice {
    Mute { value: bool },
    Video { value: bool },
    ScreenShare { value: bool },
    VideoSource { showing_screen: bool },
}

/// Replicated toggle state of one participant's outbound media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackToggleState {
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    /// Which source is on the wire; only meaningful while both video and
    /// screen-share are active.
    pub showing_screen: bool,
}

impl TrackToggleState {
    pub fn apply(&mut self, notice: MediaNotice) {
        match notice {
            MediaNotice::Mute { value } => self.muted = value,
            MediaNotice::Video { value } => self.video_enabled = value,
            MediaNotice::ScreenShare { value } => {
                self.screen_sharing = value;
                if !value {
                    self.showing_screen = false;
                }
            }
            MediaNotice::VideoSource { showing_screen } => self.showing_screen = showing_screen,
        }
    }
}

/// One roster entry, in join order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterMember {
    pub participant: ParticipantId,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub media: TrackToggleState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_pair_is_unordered() {
        let a = ParticipantId::from("alice");
        let b = ParticipantId::from("bob");
        assert_eq!(CallPair::new(a.clone(), b.clone()), CallPair::new(b.clone(), a.clone()));
        assert_eq!(CallPair::new(a.clone(), b.clone()).other(&a), Some(&b));
        assert_eq!(CallPair::new(a.clone(), b).other(&"carol".into()), None);
    }

    #[test]
    fn direct_context_views_name_the_other_party() {
        let a = ParticipantId::from("alice");
        let b = ParticipantId::from("bob");
        let id = VoiceContext::direct(b.clone()).id_for(&a);

        assert_eq!(id.view_for(&a), Some(VoiceContext::direct(b.clone())));
        assert_eq!(id.view_for(&b), Some(VoiceContext::direct(a)));
    }

    #[test]
    fn mute_notice_round_trips_state() {
        let mut state = TrackToggleState::default();
        let original = state;

        state.apply(MediaNotice::Mute { value: true });
        assert!(state.muted);
        state.apply(MediaNotice::Mute { value: false });
        assert_eq!(state, original);
    }

    #[test]
    fn stopping_screen_share_resets_visible_source() {
        let mut state = TrackToggleState::default();
        state.apply(MediaNotice::Video { value: true });
        state.apply(MediaNotice::ScreenShare { value: true });
        state.apply(MediaNotice::VideoSource { showing_screen: true });
        state.apply(MediaNotice::ScreenShare { value: false });

        assert!(state.video_enabled);
        assert!(!state.showing_screen);
    }
}
