//! One voice connection's view of the world.
//!
//! A `VoiceSession` is owned by the socket task of a single connection and
//! handles that connection's inbound signals strictly one at a time. It holds
//! no voice state of its own beyond "who am I": membership lives in the
//! registry, calls in the invitation table.

use parley_common::signal::{ClientSignal, ServerSignal};
use parley_common::{ContextId, ParleyError, ParleyResult, ParticipantId, VoiceContext};
use std::sync::Arc;
use uuid::Uuid;

use crate::hub::SignalSender;
use crate::VoiceServerState;

/// What the socket loop should do after a signal was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlow {
    Continue,
    Close,
}

pub struct VoiceSession {
    state: Arc<VoiceServerState>,
    session_id: String,
    participant: Option<ParticipantId>,
    tx: SignalSender,
}

impl VoiceSession {
    pub fn new(state: Arc<VoiceServerState>, tx: SignalSender) -> Self {
        Self {
            state,
            session_id: Uuid::new_v4().to_string(),
            participant: None,
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant(&self) -> Option<&ParticipantId> {
        self.participant.as_ref()
    }

    /// Handle one inbound signal. Failures are reported to the client as an
    /// `error` signal and never end the connection.
    pub async fn handle(&mut self, signal: ClientSignal) -> SessionFlow {
        if let Some(me) = &self.participant {
            if !self.state.hub.is_current(me, &self.session_id).await {
                tracing::debug!(session = %self.session_id, "Session replaced, closing");
                return SessionFlow::Close;
            }
        }

        if let Err(e) = self.dispatch(signal).await {
            tracing::debug!(session = %self.session_id, error = %e, "Voice signal failed");
            self.reply(e.to_signal());
        }
        SessionFlow::Continue
    }

    /// Report a message that could not be decoded.
    pub fn reject_malformed(&self, error: &serde_json::Error) {
        self.reply(ParleyError::validation(format!("Invalid message: {error}")).to_signal());
    }

    async fn dispatch(&mut self, signal: ClientSignal) -> ParleyResult<()> {
        let signal = match signal {
            ClientSignal::Identify { token } => return self.identify(&token).await,
            ClientSignal::Heartbeat => {
                self.reply(ServerSignal::HeartbeatAck);
                return Ok(());
            }
            other => other,
        };

        let me = self
            .participant
            .clone()
            .ok_or(ParleyError::NotAuthenticated)?;

        if let Some(notice) = signal.media_notice() {
            self.state.relay.broadcast_state(&me, notice).await;
            return Ok(());
        }

        let signal = match signal.into_peer_signal() {
            Ok((target, payload)) => {
                let kind = payload.kind();
                return match self.state.relay.forward(&me, &target, payload).await {
                    Err(ParleyError::TargetUnavailable { target }) => {
                        self.reply(ServerSignal::RelayFailed { target, kind });
                        Ok(())
                    }
                    other => other,
                };
            }
            Err(signal) => signal,
        };

        match signal {
            ClientSignal::JoinChannel {
                server_id,
                channel_id,
            } => {
                if !self
                    .state
                    .access
                    .can_join_voice(&me, &server_id, &channel_id)
                    .await
                {
                    return Err(ParleyError::Forbidden);
                }

                // Joining a channel ends any active call first.
                self.state.calls.hang_up_active(&me).await;

                let context = VoiceContext::Channel {
                    server_id,
                    channel_id,
                };
                let roster = self.state.registry.join(&me, context.id_for(&me)).await?;
                self.reply(ServerSignal::Joined { context, roster });
            }

            ClientSignal::LeaveChannel => match self.state.registry.context_of(&me).await {
                Some(ContextId::Direct(_)) => {
                    self.state.calls.hang_up_active(&me).await;
                }
                Some(_) => {
                    if let Some(left) = self.state.registry.leave(&me).await {
                        if let Some(context) = left.view_for(&me) {
                            self.reply(ServerSignal::Left { context });
                        }
                    }
                }
                None => {}
            },

            ClientSignal::StartCall { peer } => {
                self.state.calls.start_call(&me, &peer).await?;
            }
            ClientSignal::AcceptCall { peer } => {
                self.state.calls.accept_call(&me, &peer).await?;
            }
            ClientSignal::RejectCall { peer } => {
                self.state.calls.reject_call(&me, &peer).await?;
            }
            ClientSignal::HangUp => {
                self.state.calls.hang_up(&me).await?;
            }

            // Handled above.
            ClientSignal::Identify { .. }
            | ClientSignal::Heartbeat
            | ClientSignal::Offer { .. }
            | ClientSignal::Answer { .. }
            | ClientSignal::IceCandidate { .. }
            | ClientSignal::SwitchVideoSource { .. }
            | ClientSignal::MuteState { .. }
            | ClientSignal::VideoState { .. }
            | ClientSignal::ScreenShareState { .. }
            | ClientSignal::VideoSourceChanged { .. } => {}
        }

        Ok(())
    }

    async fn identify(&mut self, token: &str) -> ParleyResult<()> {
        if self.participant.is_some() {
            return Err(ParleyError::validation("already identified"));
        }

        let participant = self.state.authenticator.authenticate(token)?;
        let replaced = self
            .state
            .hub
            .register(participant.clone(), self.session_id.clone(), self.tx.clone())
            .await;

        self.reply(ServerSignal::Ready {
            participant_id: participant.clone(),
            session_id: self.session_id.clone(),
            ice_servers: self.state.config.ice_servers.clone(),
            max_roster_size: self.state.config.max_roster_size,
        });

        // The client starts over with no context and no call; whatever the
        // old connection held is gone, even if its socket has not closed yet.
        if let Some(old) = replaced {
            tracing::info!(
                participant = %participant,
                old_session = %old,
                session = %self.session_id,
                "Voice connection replaced"
            );
            self.state.calls.on_disconnect(&participant).await;
            self.state.registry.leave(&participant).await;
        }

        tracing::info!(
            session = %self.session_id,
            participant = %participant,
            "Voice client authenticated"
        );
        self.participant = Some(participant);
        Ok(())
    }

    /// Tear down everything this connection owned. Safe to call more than once.
    pub async fn close(&mut self) {
        let Some(me) = self.participant.take() else {
            return;
        };

        // A newer connection took over and already cleaned up after this one.
        if !self.state.hub.unregister(&me, &self.session_id).await {
            return;
        }

        self.state.calls.on_disconnect(&me).await;
        self.state.registry.leave(&me).await;
        self.state.registry.forget(&me);

        tracing::info!(session = %self.session_id, participant = %me, "Voice client disconnected");
    }

    fn reply(&self, signal: ServerSignal) {
        let _ = self.tx.send(signal);
    }
}
