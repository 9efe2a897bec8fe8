//! Client-side view of the one-to-one call invitation.
//!
//! The server owns the authoritative state machine. This copy lets commands
//! fail fast locally and keeps track of which call the links belong to.

use parley_common::ParticipantId;
use uuid::Uuid;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// We asked the server to ring `peer`; `call_id` arrives with `call_ringing`.
    Outgoing {
        peer: ParticipantId,
        call_id: Option<Uuid>,
    },
    Incoming {
        peer: ParticipantId,
        call_id: Uuid,
    },
    Active {
        peer: ParticipantId,
        call_id: Uuid,
    },
}

impl CallState {
    pub fn peer(&self) -> Option<&ParticipantId> {
        match self {
            Self::Idle => None,
            Self::Outgoing { peer, .. } | Self::Incoming { peer, .. } | Self::Active { peer, .. } => {
                Some(peer)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    // === Commands ===

    pub fn start(&mut self, peer: ParticipantId) -> Result<()> {
        match self {
            Self::Outgoing { .. } | Self::Incoming { .. } => {
                Err(ClientError::InvalidCallState("a call is already ringing".into()))
            }
            Self::Active { peer: current, .. } => Err(ClientError::InvalidCallState(format!(
                "already in a call with {current}; hang up first"
            ))),
            Self::Idle => {
                *self = Self::Outgoing {
                    peer,
                    call_id: None,
                };
                Ok(())
            }
        }
    }

    /// Accept the incoming call from `peer`.
    pub fn accept(&self, peer: &ParticipantId) -> Result<()> {
        match self {
            Self::Incoming { peer: caller, .. } if caller == peer => Ok(()),
            _ => Err(ClientError::InvalidCallState(format!("no incoming call from {peer}"))),
        }
    }

    pub fn reject(&mut self, peer: &ParticipantId) -> Result<()> {
        self.accept(peer)?;
        *self = Self::Idle;
        Ok(())
    }

    pub fn hang_up(&mut self) -> Result<()> {
        match self {
            Self::Outgoing { .. } | Self::Active { .. } => {
                *self = Self::Idle;
                Ok(())
            }
            _ => Err(ClientError::InvalidCallState("not in a call".into())),
        }
    }

    // === Server updates ===

    pub fn on_ringing(&mut self, callee: ParticipantId, call_id: Uuid) {
        *self = Self::Outgoing {
            peer: callee,
            call_id: Some(call_id),
        };
    }

    pub fn on_incoming(&mut self, caller: ParticipantId, call_id: Uuid) {
        // An outgoing or active call is not displaced by a new ring; the
        // server keeps both invitations apart.
        if matches!(self, Self::Idle) {
            *self = Self::Incoming {
                peer: caller,
                call_id,
            };
        }
    }

    pub fn on_accepted(&mut self, peer: ParticipantId, call_id: Uuid) {
        *self = Self::Active { peer, call_id };
    }

    /// Returns whether the ended call was the one tracked here.
    pub fn on_ended(&mut self, peer: &ParticipantId, call_id: Uuid) -> bool {
        let matches = match self {
            Self::Idle => false,
            Self::Outgoing { peer: p, call_id: id } => p == peer && id.is_none_or(|id| id == call_id),
            Self::Incoming { peer: p, call_id: id } | Self::Active { peer: p, call_id: id } => {
                p == peer && *id == call_id
            }
        };
        if matches {
            *self = Self::Idle;
        }
        matches
    }
}
