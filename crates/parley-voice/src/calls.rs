//! Direct call invitations.
//!
//! One invitation per unordered pair of participants:
//!
//! ```text
//!   start_call ──► Ringing ──accept──► Active ──hang_up / disconnect──► ended
//!                     │
//!                     └── reject / cancel / timeout / disconnect ──► ended
//! ```
//!
//! Ended invitations are removed immediately; the pair can ring again right
//! away. Only an active call puts both parties in a shared direct voice
//! context, so caller and callee exchange offers only after acceptance.

use chrono::{DateTime, Utc};
use parley_common::signal::{CallEndReason, ServerSignal};
use parley_common::{CallPair, ContextId, ParleyError, ParleyResult, ParticipantId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::hub::ConnectionHub;
use crate::registry::VoiceSessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Ringing,
    Active,
}

impl InvitationState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub call_id: Uuid,
    pub caller: ParticipantId,
    pub callee: ParticipantId,
    pub state: InvitationState,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    fn pair(&self) -> CallPair {
        CallPair::new(self.caller.clone(), self.callee.clone())
    }
}

struct CallsInner {
    invitations: Mutex<HashMap<CallPair, Invitation>>,
    hub: ConnectionHub,
    registry: VoiceSessionRegistry,
    ring_timeout: Duration,
}

/// Owns every ringing and active direct call.
#[derive(Clone)]
pub struct CallInvitations {
    inner: Arc<CallsInner>,
}

impl CallInvitations {
    pub fn new(hub: ConnectionHub, registry: VoiceSessionRegistry, ring_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CallsInner {
                invitations: Mutex::new(HashMap::new()),
                hub,
                registry,
                ring_timeout,
            }),
        }
    }

    /// Ring `callee` on behalf of `caller`.
    pub async fn start_call(&self, caller: &ParticipantId, callee: &ParticipantId) -> ParleyResult<Uuid> {
        if caller == callee {
            return Err(ParleyError::validation("cannot call yourself"));
        }
        if !self.inner.hub.is_connected(callee).await {
            return Err(ParleyError::NotConnected {
                participant: callee.clone(),
            });
        }

        let pair = CallPair::new(caller.clone(), callee.clone());
        let invitation = {
            let mut invitations = self.inner.invitations.lock().await;
            if invitations.contains_key(&pair) {
                return Err(ParleyError::AlreadyRinging);
            }
            let invitation = Invitation {
                call_id: Uuid::new_v4(),
                caller: caller.clone(),
                callee: callee.clone(),
                state: InvitationState::Ringing,
                created_at: Utc::now(),
            };
            invitations.insert(pair.clone(), invitation.clone());
            invitation
        };

        let call_id = invitation.call_id;
        let _ = self
            .inner
            .hub
            .send(
                callee,
                ServerSignal::IncomingCall {
                    caller: caller.clone(),
                    call_id,
                },
            )
            .await;
        let _ = self
            .inner
            .hub
            .send(
                caller,
                ServerSignal::CallRinging {
                    callee: callee.clone(),
                    call_id,
                },
            )
            .await;

        let calls = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(calls.inner.ring_timeout).await;
            calls.expire(&pair, call_id).await;
        });

        tracing::info!(caller = %caller, callee = %callee, %call_id, "Call ringing");
        Ok(call_id)
    }

    /// `callee` accepts the invitation from `caller`.
    ///
    /// Both parties leave whatever voice context they were in and are placed
    /// in the call's direct context. The callee is told first, so that by the
    /// time the caller (the initiator) sends its offer the callee already
    /// expects it.
    pub async fn accept_call(&self, callee: &ParticipantId, caller: &ParticipantId) -> ParleyResult<Uuid> {
        let pair = CallPair::new(caller.clone(), callee.clone());
        let call_id = {
            let mut invitations = self.inner.invitations.lock().await;
            let invitation = invitations
                .get_mut(&pair)
                .ok_or(ParleyError::InvitationNotFound)?;
            if &invitation.callee != callee {
                return Err(ParleyError::Forbidden);
            }
            if invitation.state != InvitationState::Ringing {
                return Err(ParleyError::InvalidInvitationState {
                    state: invitation.state.as_str().to_string(),
                });
            }
            invitation.state = InvitationState::Active;
            invitation.call_id
        };

        // A participant is in at most one call.
        for party in [callee, caller] {
            self.end_active_except(party, &pair, CallEndReason::HungUp).await;
        }

        self.enter_call(&pair, call_id, callee, caller).await?;

        tracing::info!(caller = %caller, callee = %callee, %call_id, "Call accepted");
        Ok(call_id)
    }

    /// Join both parties of an accepted call into its direct context and
    /// send `call_accepted`, callee first.
    ///
    /// The invitation may end (hang-up, disconnect) while the joins run. In
    /// that case the joins are undone and nobody hears `call_accepted`.
    async fn enter_call(
        &self,
        pair: &CallPair,
        call_id: Uuid,
        callee: &ParticipantId,
        caller: &ParticipantId,
    ) -> ParleyResult<()> {
        let context = ContextId::Direct(pair.clone());
        for party in [callee, caller] {
            if let Err(e) = self.inner.registry.join(party, context.clone()).await {
                self.end(pair, call_id, CallEndReason::Disconnected).await;
                return Err(e);
            }
        }

        // Held until both `call_accepted` are queued, so a `call_ended` for
        // this call can only come after them.
        let invitations = self.inner.invitations.lock().await;
        if !invitations.get(pair).is_some_and(|inv| inv.call_id == call_id) {
            drop(invitations);
            tracing::debug!(%call_id, "Call ended before its parties joined");
            self.leave_direct(&context, [caller, callee]).await;
            return Err(ParleyError::InvitationNotFound);
        }

        let _ = self
            .inner
            .hub
            .send(
                callee,
                ServerSignal::CallAccepted {
                    peer: caller.clone(),
                    call_id,
                    initiator: false,
                },
            )
            .await;
        let _ = self
            .inner
            .hub
            .send(
                caller,
                ServerSignal::CallAccepted {
                    peer: callee.clone(),
                    call_id,
                    initiator: true,
                },
            )
            .await;
        Ok(())
    }

    /// Take `parties` out of `context` if they are still in it.
    async fn leave_direct(&self, context: &ContextId, parties: [&ParticipantId; 2]) {
        for party in parties {
            if self.inner.registry.context_of(party).await.as_ref() == Some(context) {
                self.inner.registry.leave(party).await;
            }
        }
    }

    /// `callee` declines the ringing invitation from `caller`.
    pub async fn reject_call(&self, callee: &ParticipantId, caller: &ParticipantId) -> ParleyResult<()> {
        let pair = CallPair::new(caller.clone(), callee.clone());
        let invitation = {
            let mut invitations = self.inner.invitations.lock().await;
            let invitation = invitations
                .get(&pair)
                .ok_or(ParleyError::InvitationNotFound)?;
            if &invitation.callee != callee {
                return Err(ParleyError::Forbidden);
            }
            if invitation.state != InvitationState::Ringing {
                return Err(ParleyError::InvalidInvitationState {
                    state: invitation.state.as_str().to_string(),
                });
            }
            invitations.remove(&pair)
        };

        if let Some(invitation) = invitation {
            self.finish(invitation, CallEndReason::Rejected).await;
        }
        Ok(())
    }

    /// End `participant`'s active call, or cancel the call they are placing.
    pub async fn hang_up(&self, participant: &ParticipantId) -> ParleyResult<()> {
        let ended = {
            let mut invitations = self.inner.invitations.lock().await;
            let active = invitations
                .iter()
                .find(|(pair, inv)| pair.contains(participant) && inv.state == InvitationState::Active)
                .map(|(pair, _)| (pair.clone(), CallEndReason::HungUp));
            let target = active.or_else(|| {
                invitations
                    .iter()
                    .find(|(_, inv)| &inv.caller == participant && inv.state == InvitationState::Ringing)
                    .map(|(pair, _)| (pair.clone(), CallEndReason::Cancelled))
            });
            target.and_then(|(pair, reason)| invitations.remove(&pair).map(|inv| (inv, reason)))
        };

        match ended {
            Some((invitation, reason)) => {
                self.finish(invitation, reason).await;
                Ok(())
            }
            None => Err(ParleyError::NotInCall),
        }
    }

    /// End `participant`'s active call, if any. Returns whether one ended.
    pub async fn hang_up_active(&self, participant: &ParticipantId) -> bool {
        let ended = {
            let mut invitations = self.inner.invitations.lock().await;
            let pair = invitations
                .iter()
                .find(|(pair, inv)| pair.contains(participant) && inv.state == InvitationState::Active)
                .map(|(pair, _)| pair.clone());
            pair.and_then(|pair| invitations.remove(&pair))
        };

        match ended {
            Some(invitation) => {
                self.finish(invitation, CallEndReason::HungUp).await;
                true
            }
            None => false,
        }
    }

    /// `participant`'s connection is gone: end every invitation involving them.
    pub async fn on_disconnect(&self, participant: &ParticipantId) {
        let ended: Vec<Invitation> = {
            let mut invitations = self.inner.invitations.lock().await;
            let pairs: Vec<CallPair> = invitations
                .keys()
                .filter(|pair| pair.contains(participant))
                .cloned()
                .collect();
            pairs
                .iter()
                .filter_map(|pair| invitations.remove(pair))
                .collect()
        };

        for invitation in ended {
            self.finish(invitation, CallEndReason::Disconnected).await;
        }
    }

    /// Look up the invitation between two participants.
    pub async fn get(&self, a: &ParticipantId, b: &ParticipantId) -> Option<Invitation> {
        let pair = CallPair::new(a.clone(), b.clone());
        self.inner.invitations.lock().await.get(&pair).cloned()
    }

    /// Number of ringing and active invitations.
    pub async fn count(&self) -> usize {
        self.inner.invitations.lock().await.len()
    }

    async fn expire(&self, pair: &CallPair, call_id: Uuid) {
        let expired = {
            let mut invitations = self.inner.invitations.lock().await;
            match invitations.get(pair) {
                Some(inv) if inv.call_id == call_id && inv.state == InvitationState::Ringing => {
                    invitations.remove(pair)
                }
                _ => None,
            }
        };

        if let Some(invitation) = expired {
            self.finish(invitation, CallEndReason::Timeout).await;
        }
    }

    async fn end(&self, pair: &CallPair, call_id: Uuid, reason: CallEndReason) {
        let ended = {
            let mut invitations = self.inner.invitations.lock().await;
            match invitations.get(pair) {
                Some(inv) if inv.call_id == call_id => invitations.remove(pair),
                _ => None,
            }
        };
        if let Some(invitation) = ended {
            self.finish(invitation, reason).await;
        }
    }

    async fn end_active_except(&self, participant: &ParticipantId, keep: &CallPair, reason: CallEndReason) {
        let ended: Vec<Invitation> = {
            let mut invitations = self.inner.invitations.lock().await;
            let pairs: Vec<CallPair> = invitations
                .iter()
                .filter(|(pair, inv)| {
                    *pair != keep && pair.contains(participant) && inv.state == InvitationState::Active
                })
                .map(|(pair, _)| pair.clone())
                .collect();
            pairs
                .iter()
                .filter_map(|pair| invitations.remove(pair))
                .collect()
        };

        for invitation in ended {
            self.finish(invitation, reason).await;
        }
    }

    /// Tear down a removed invitation and tell both parties.
    async fn finish(&self, invitation: Invitation, reason: CallEndReason) {
        let pair = invitation.pair();

        if invitation.state == InvitationState::Active {
            self.leave_direct(&ContextId::Direct(pair), [&invitation.caller, &invitation.callee])
                .await;
        }

        for (me, peer) in [
            (&invitation.caller, &invitation.callee),
            (&invitation.callee, &invitation.caller),
        ] {
            let _ = self
                .inner
                .hub
                .send(
                    me,
                    ServerSignal::CallEnded {
                        peer: peer.clone(),
                        call_id: invitation.call_id,
                        reason,
                    },
                )
                .await;
        }

        tracing::info!(
            caller = %invitation.caller,
            callee = %invitation.callee,
            call_id = %invitation.call_id,
            ?reason,
            "Call ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::VoiceContext;
    use tokio::sync::mpsc;

    struct Harness {
        hub: ConnectionHub,
        registry: VoiceSessionRegistry,
        calls: CallInvitations,
    }

    impl Harness {
        fn new(ring_timeout: Duration) -> Self {
            let hub = ConnectionHub::new();
            let registry = VoiceSessionRegistry::new(hub.clone(), 12);
            let calls = CallInvitations::new(hub.clone(), registry.clone(), ring_timeout);
            Self { hub, registry, calls }
        }

        async fn connect(&self, who: &str) -> (ParticipantId, mpsc::UnboundedReceiver<ServerSignal>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = ParticipantId::from(who);
            self.hub.register(id.clone(), format!("session-{who}"), tx).await;
            (id, rx)
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerSignal>) -> Vec<ServerSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[tokio::test]
    async fn accepted_call_puts_both_parties_in_direct_context() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, mut a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;

        let call_id = h.calls.start_call(&a, &b).await.unwrap();
        assert!(matches!(drain(&mut b_rx)[..], [ServerSignal::IncomingCall { .. }]));
        assert!(matches!(drain(&mut a_rx)[..], [ServerSignal::CallRinging { .. }]));
        // Ringing never creates a voice context.
        assert_eq!(h.registry.context_of(&a).await, None);

        assert_eq!(h.calls.accept_call(&b, &a).await.unwrap(), call_id);

        let context = ContextId::Direct(CallPair::new(a.clone(), b.clone()));
        assert_eq!(h.registry.context_of(&a).await, Some(context.clone()));
        assert_eq!(h.registry.context_of(&b).await, Some(context));

        let b_signals = drain(&mut b_rx);
        assert!(b_signals.contains(&ServerSignal::CallAccepted {
            peer: a.clone(),
            call_id,
            initiator: false,
        }));
        let a_signals = drain(&mut a_rx);
        assert!(a_signals.contains(&ServerSignal::CallAccepted {
            peer: b.clone(),
            call_id,
            initiator: true,
        }));
    }

    #[tokio::test]
    async fn second_invitation_for_same_pair_is_refused() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, _b_rx) = h.connect("b").await;

        h.calls.start_call(&a, &b).await.unwrap();
        assert!(matches!(
            h.calls.start_call(&b, &a).await,
            Err(ParleyError::AlreadyRinging)
        ));
    }

    #[tokio::test]
    async fn only_the_callee_can_accept() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, _b_rx) = h.connect("b").await;

        h.calls.start_call(&a, &b).await.unwrap();
        assert!(matches!(
            h.calls.accept_call(&a, &b).await,
            Err(ParleyError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn rejecting_removes_the_invitation() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, mut a_rx) = h.connect("a").await;
        let (b, _b_rx) = h.connect("b").await;

        let call_id = h.calls.start_call(&a, &b).await.unwrap();
        drain(&mut a_rx);
        h.calls.reject_call(&b, &a).await.unwrap();

        assert_eq!(
            drain(&mut a_rx),
            vec![ServerSignal::CallEnded {
                peer: b.clone(),
                call_id,
                reason: CallEndReason::Rejected,
            }]
        );
        assert!(h.calls.get(&a, &b).await.is_none());
        // The pair may ring again straight away.
        h.calls.start_call(&a, &b).await.unwrap();
    }

    #[tokio::test]
    async fn caller_can_cancel_a_ringing_call() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;

        h.calls.start_call(&a, &b).await.unwrap();
        drain(&mut b_rx);
        h.calls.hang_up(&a).await.unwrap();

        assert!(matches!(
            drain(&mut b_rx)[..],
            [ServerSignal::CallEnded { reason: CallEndReason::Cancelled, .. }]
        ));
        // The callee has nothing to hang up.
        assert!(matches!(h.calls.hang_up(&b).await, Err(ParleyError::NotInCall)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, mut a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;

        h.calls.start_call(&a, &b).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(matches!(
            drain(&mut a_rx)[..],
            [ServerSignal::CallEnded { reason: CallEndReason::Timeout, .. }]
        ));
        assert!(matches!(
            drain(&mut b_rx)[..],
            [ServerSignal::CallEnded { reason: CallEndReason::Timeout, .. }]
        ));
        assert_eq!(h.calls.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_call_does_not_time_out() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, _b_rx) = h.connect("b").await;

        h.calls.start_call(&a, &b).await.unwrap();
        h.calls.accept_call(&b, &a).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(
            h.calls.get(&a, &b).await.map(|inv| inv.state),
            Some(InvitationState::Active)
        );
    }

    #[tokio::test]
    async fn hang_up_leaves_the_direct_context() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;

        h.calls.start_call(&a, &b).await.unwrap();
        h.calls.accept_call(&b, &a).await.unwrap();
        drain(&mut b_rx);

        h.calls.hang_up(&a).await.unwrap();

        assert_eq!(h.registry.context_of(&a).await, None);
        assert_eq!(h.registry.context_of(&b).await, None);
        let signals = drain(&mut b_rx);
        assert!(signals.iter().any(|s| matches!(
            s,
            ServerSignal::CallEnded { reason: CallEndReason::HungUp, .. }
        )));
    }

    #[tokio::test]
    async fn disconnect_ends_every_invitation() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;
        let (c, mut c_rx) = h.connect("c").await;

        h.calls.start_call(&a, &b).await.unwrap();
        h.calls.accept_call(&b, &a).await.unwrap();
        h.calls.start_call(&c, &a).await.unwrap();
        drain(&mut b_rx);
        drain(&mut c_rx);

        h.calls.on_disconnect(&a).await;

        assert_eq!(h.calls.count().await, 0);
        assert_eq!(h.registry.context_of(&b).await, None);
        for signals in [drain(&mut b_rx), drain(&mut c_rx)] {
            assert!(signals.iter().any(|s| matches!(
                s,
                ServerSignal::CallEnded { reason: CallEndReason::Disconnected, .. }
            )));
        }
    }

    #[tokio::test]
    async fn accepting_moves_callee_out_of_a_channel() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        let (b, _b_rx) = h.connect("b").await;
        let lobby = VoiceContext::channel("s", "lobby").id_for(&b);
        h.registry.join(&b, lobby.clone()).await.unwrap();

        h.calls.start_call(&a, &b).await.unwrap();
        // Ringing leaves the callee where they are.
        assert_eq!(h.registry.context_of(&b).await, Some(lobby.clone()));

        h.calls.accept_call(&b, &a).await.unwrap();
        assert!(h.registry.get_roster(&lobby).await.is_empty());
    }

    #[tokio::test]
    async fn calling_an_offline_participant_fails() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, _a_rx) = h.connect("a").await;
        assert!(matches!(
            h.calls.start_call(&a, &"ghost".into()).await,
            Err(ParleyError::NotConnected { .. })
        ));
        assert!(matches!(
            h.calls.start_call(&a, &a).await,
            Err(ParleyError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn call_ended_while_joining_leaves_nobody_in_the_call() {
        let h = Harness::new(Duration::from_secs(60));
        let (a, mut a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;

        let call_id = h.calls.start_call(&a, &b).await.unwrap();
        let pair = CallPair::new(a.clone(), b.clone());
        // The callee has claimed the invitation; the caller hangs up before
        // either party is in the direct context.
        h.calls
            .inner
            .invitations
            .lock()
            .await
            .get_mut(&pair)
            .unwrap()
            .state = InvitationState::Active;
        h.calls.hang_up(&a).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        assert!(matches!(
            h.calls.enter_call(&pair, call_id, &b, &a).await,
            Err(ParleyError::InvitationNotFound)
        ));

        assert_eq!(h.registry.context_of(&a).await, None);
        assert_eq!(h.registry.context_of(&b).await, None);
        for signals in [drain(&mut a_rx), drain(&mut b_rx)] {
            assert!(!signals.iter().any(|s| matches!(s, ServerSignal::CallAccepted { .. })));
        }
        assert!(matches!(h.calls.hang_up(&b).await, Err(ParleyError::NotInCall)));
    }
}
