//! Voice session registry — tracks who's in which voice context.
//!
//! This is the authoritative source of truth for voice membership:
//! - which participant is in which channel or direct call
//! - the ordered roster of every active context
//! - the replicated mute/video/screen-share state of every member
//!
//! Locking: each roster has its own async mutex, and each participant has one
//! too so that a participant's own join/leave never interleave. Locks are
//! always taken participant first, then roster, and no two roster locks are
//! ever held at once. Roster broadcasts are queued while the roster lock is
//! held, so a member never receives a delta computed from a stale roster.

use chrono::Utc;
use parley_common::signal::{RosterState, ServerSignal};
use parley_common::{
    ContextId, MediaNotice, ParleyError, ParleyResult, ParticipantId, RosterMember,
    TrackToggleState,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, RwLock};

use crate::hub::ConnectionHub;

#[derive(Default)]
struct Roster {
    members: Vec<RosterMember>,
    /// Set once the roster emptied and was dropped from the index. A joiner
    /// that raced with the removal must fetch a fresh roster.
    closed: bool,
}

impl Roster {
    fn others<'a>(&'a self, me: &'a ParticipantId) -> impl Iterator<Item = &'a ParticipantId> {
        self.members
            .iter()
            .map(|m| &m.participant)
            .filter(move |p| *p != me)
    }
}

struct RegistryInner {
    hub: ConnectionHub,
    max_roster_size: usize,
    by_participant: RwLock<HashMap<ParticipantId, ContextId>>,
    rosters: RwLock<HashMap<ContextId, Arc<Mutex<Roster>>>>,
    participant_locks: std::sync::Mutex<HashMap<ParticipantId, Arc<Mutex<()>>>>,
}

/// Manages voice membership across all contexts.
#[derive(Clone)]
pub struct VoiceSessionRegistry {
    inner: Arc<RegistryInner>,
}

impl VoiceSessionRegistry {
    pub fn new(hub: ConnectionHub, max_roster_size: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hub,
                max_roster_size,
                by_participant: RwLock::new(HashMap::new()),
                rosters: RwLock::new(HashMap::new()),
                participant_locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Participant joins `context`. If already in a context, leaves it first.
    ///
    /// Returns the roster as it was before the join (who the joiner must
    /// expect offers from) and notifies those members with `joined`.
    pub async fn join(
        &self,
        participant: &ParticipantId,
        context: ContextId,
    ) -> ParleyResult<Vec<RosterMember>> {
        let lock = self.participant_lock(participant);
        let _guard = lock.lock().await;

        if !context.is_direct() && self.is_full(&context, participant).await {
            return Err(self.roster_full());
        }

        self.leave_locked(participant).await;

        loop {
            let roster_lock = self.roster_entry(&context).await;
            let mut roster = roster_lock.lock().await;
            if roster.closed {
                continue;
            }

            // Re-check under the lock; the pre-check above raced with other joiners.
            if !context.is_direct() && roster.members.len() >= self.inner.max_roster_size {
                drop(roster);
                self.drop_if_empty(&context, &roster_lock).await;
                return Err(self.roster_full());
            }

            let prior = roster.members.clone();
            roster.members.push(RosterMember {
                participant: participant.clone(),
                joined_at: Utc::now(),
                media: TrackToggleState::default(),
            });
            self.inner
                .by_participant
                .write()
                .await
                .insert(participant.clone(), context.clone());

            for member in &prior {
                let Some(view) = context.view_for(&member.participant) else {
                    continue;
                };
                let delta = ServerSignal::RosterChanged {
                    context: view,
                    state: RosterState::Joined,
                    participant: participant.clone(),
                };
                let _ = self.inner.hub.send(&member.participant, delta).await;
            }

            tracing::info!(
                participant = %participant,
                context = %context,
                members = roster.members.len(),
                "Participant joined voice context"
            );

            return Ok(prior);
        }
    }

    /// Participant leaves their current context. Returns the context they left.
    ///
    /// A participant that is not in any context is a no-op: nothing is
    /// broadcast.
    pub async fn leave(&self, participant: &ParticipantId) -> Option<ContextId> {
        let lock = self.participant_lock(participant);
        let _guard = lock.lock().await;
        self.leave_locked(participant).await
    }

    async fn leave_locked(&self, participant: &ParticipantId) -> Option<ContextId> {
        let context = self
            .inner
            .by_participant
            .read()
            .await
            .get(participant)
            .cloned()?;

        let roster_lock = self.inner.rosters.read().await.get(&context).cloned();
        if let Some(roster_lock) = roster_lock {
            let mut roster = roster_lock.lock().await;
            roster.members.retain(|m| &m.participant != participant);

            for member in &roster.members {
                let Some(view) = context.view_for(&member.participant) else {
                    continue;
                };
                let delta = ServerSignal::RosterChanged {
                    context: view,
                    state: RosterState::Left,
                    participant: participant.clone(),
                };
                let _ = self.inner.hub.send(&member.participant, delta).await;
            }

            if roster.members.is_empty() {
                roster.closed = true;
                self.inner.rosters.write().await.remove(&context);
            }
        }

        self.inner.by_participant.write().await.remove(participant);

        tracing::info!(
            participant = %participant,
            context = %context,
            "Participant left voice context"
        );

        Some(context)
    }

    /// Apply a track-state notice to the sender's replicated state and
    /// broadcast it to the rest of the sender's context.
    ///
    /// Returns `None` (and broadcasts nothing) if the sender is not in voice.
    pub async fn publish_media_state(
        &self,
        participant: &ParticipantId,
        notice: MediaNotice,
    ) -> Option<TrackToggleState> {
        let context = self.context_of(participant).await?;
        let roster_lock = self.inner.rosters.read().await.get(&context).cloned()?;
        let mut roster = roster_lock.lock().await;

        let member = roster
            .members
            .iter_mut()
            .find(|m| &m.participant == participant)?;
        member.media.apply(notice);
        let state = member.media;

        let signal = ServerSignal::MediaState {
            participant: participant.clone(),
            notice,
            state,
        };
        self.inner
            .hub
            .send_many(roster.others(participant), &signal)
            .await;

        tracing::debug!(participant = %participant, ?notice, "Media state updated");
        Some(state)
    }

    /// Get a participant's current context.
    pub async fn context_of(&self, participant: &ParticipantId) -> Option<ContextId> {
        self.inner.by_participant.read().await.get(participant).cloned()
    }

    /// Get the members of a context, in join order.
    pub async fn get_roster(&self, context: &ContextId) -> Vec<RosterMember> {
        let roster_lock = self.inner.rosters.read().await.get(context).cloned();
        match roster_lock {
            Some(roster_lock) => roster_lock.lock().await.members.clone(),
            None => Vec::new(),
        }
    }

    /// Drop per-participant bookkeeping once their connection is gone.
    pub fn forget(&self, participant: &ParticipantId) {
        self.inner
            .participant_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(participant);
    }

    /// Get global voice stats.
    pub async fn stats(&self) -> VoiceStats {
        let rosters: Vec<(ContextId, Arc<Mutex<Roster>>)> = self
            .inner
            .rosters
            .read()
            .await
            .iter()
            .map(|(id, roster)| (id.clone(), roster.clone()))
            .collect();

        let mut stats = VoiceStats::default();
        for (id, roster) in rosters {
            let roster = roster.lock().await;
            if id.is_direct() {
                stats.active_calls += 1;
            } else {
                stats.active_channels += 1;
            }
            stats.participants_in_voice += roster.members.len();
            stats.video_count += roster.members.iter().filter(|m| m.media.video_enabled).count();
            stats.streaming_count += roster.members.iter().filter(|m| m.media.screen_sharing).count();
        }
        stats.connected = self.inner.hub.connected_count().await;
        stats
    }

    fn participant_lock(&self, participant: &ParticipantId) -> Arc<Mutex<()>> {
        self.inner
            .participant_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(participant.clone())
            .or_default()
            .clone()
    }

    async fn roster_entry(&self, context: &ContextId) -> Arc<Mutex<Roster>> {
        self.inner
            .rosters
            .write()
            .await
            .entry(context.clone())
            .or_default()
            .clone()
    }

    async fn drop_if_empty(&self, context: &ContextId, roster_lock: &Arc<Mutex<Roster>>) {
        let mut roster = roster_lock.lock().await;
        if roster.members.is_empty() && !roster.closed {
            roster.closed = true;
            self.inner.rosters.write().await.remove(context);
        }
    }

    async fn is_full(&self, context: &ContextId, joiner: &ParticipantId) -> bool {
        let roster = self.get_roster(context).await;
        roster.len() >= self.inner.max_roster_size
            && !roster.iter().any(|m| &m.participant == joiner)
    }

    fn roster_full(&self) -> ParleyError {
        ParleyError::LimitReached {
            message: format!(
                "voice channel is full ({} participants)",
                self.inner.max_roster_size
            ),
        }
    }
}

/// Global voice statistics.
#[derive(Debug, Default, Serialize)]
pub struct VoiceStats {
    pub connected: usize,
    pub active_channels: usize,
    pub active_calls: usize,
    pub participants_in_voice: usize,
    pub video_count: usize,
    pub streaming_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::VoiceContext;
    use tokio::sync::mpsc;

    fn channel(name: &str) -> ContextId {
        VoiceContext::channel("general", name).id_for(&"nobody".into())
    }

    async fn connect(
        hub: &ConnectionHub,
        who: &str,
    ) -> (ParticipantId, mpsc::UnboundedReceiver<ServerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ParticipantId::from(who);
        hub.register(id.clone(), format!("session-{who}"), tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn join_returns_prior_roster_and_notifies_members() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 12);
        let (a, mut a_rx) = connect(&hub, "a").await;
        let (b, _b_rx) = connect(&hub, "b").await;

        assert!(registry.join(&a, channel("voice-1")).await.unwrap().is_empty());
        let prior = registry.join(&b, channel("voice-1")).await.unwrap();
        assert_eq!(prior.len(), 1);
        assert_eq!(prior[0].participant, a);

        match a_rx.recv().await {
            Some(ServerSignal::RosterChanged { state, participant, .. }) => {
                assert_eq!(state, RosterState::Joined);
                assert_eq!(participant, b);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn joining_second_context_leaves_the_first() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 12);
        let (a, _a_rx) = connect(&hub, "a").await;
        let (b, mut b_rx) = connect(&hub, "b").await;

        registry.join(&b, channel("voice-1")).await.unwrap();
        registry.join(&a, channel("voice-1")).await.unwrap();
        let _joined = b_rx.recv().await;

        registry.join(&a, channel("voice-2")).await.unwrap();

        assert_eq!(registry.context_of(&a).await, Some(channel("voice-2")));
        let roster_1 = registry.get_roster(&channel("voice-1")).await;
        assert_eq!(roster_1.len(), 1);
        assert!(matches!(
            b_rx.recv().await,
            Some(ServerSignal::RosterChanged { state: RosterState::Left, .. })
        ));
    }

    #[tokio::test]
    async fn leave_when_not_in_voice_is_silent() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 12);
        let (a, mut a_rx) = connect(&hub, "a").await;
        let (b, _b_rx) = connect(&hub, "b").await;
        registry.join(&a, channel("voice-1")).await.unwrap();

        assert_eq!(registry.leave(&b).await, None);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_rosters_are_dropped() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 12);
        let (a, _a_rx) = connect(&hub, "a").await;

        registry.join(&a, channel("voice-1")).await.unwrap();
        registry.leave(&a).await;

        let stats = registry.stats().await;
        assert_eq!(stats.active_channels, 0);
        assert_eq!(stats.participants_in_voice, 0);
    }

    #[tokio::test]
    async fn full_channel_rejects_without_state_change() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 2);
        let (a, _) = connect(&hub, "a").await;
        let (b, _) = connect(&hub, "b").await;
        let (c, _) = connect(&hub, "c").await;

        registry.join(&c, channel("lobby")).await.unwrap();
        registry.join(&a, channel("voice-1")).await.unwrap();
        registry.join(&b, channel("voice-1")).await.unwrap();

        let err = registry.join(&c, channel("voice-1")).await.unwrap_err();
        assert!(matches!(err, ParleyError::LimitReached { .. }));
        assert_eq!(registry.context_of(&c).await, Some(channel("lobby")));
    }

    #[tokio::test]
    async fn media_state_is_replicated_to_other_members() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 12);
        let (a, mut a_rx) = connect(&hub, "a").await;
        let (b, mut b_rx) = connect(&hub, "b").await;
        registry.join(&a, channel("voice-1")).await.unwrap();
        registry.join(&b, channel("voice-1")).await.unwrap();
        let _joined = a_rx.recv().await;

        let state = registry
            .publish_media_state(&b, MediaNotice::Mute { value: true })
            .await
            .unwrap();
        assert!(state.muted);

        match a_rx.recv().await {
            Some(ServerSignal::MediaState { participant, state, .. }) => {
                assert_eq!(participant, b);
                assert!(state.muted);
            }
            other => panic!("unexpected {other:?}"),
        }
        // The sender does not hear its own notice.
        assert!(b_rx.try_recv().is_err());

        let roster = registry.get_roster(&channel("voice-1")).await;
        assert!(roster.iter().find(|m| m.participant == b).unwrap().media.muted);
    }

    #[tokio::test]
    async fn media_state_outside_voice_is_dropped() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 12);
        let (a, _) = connect(&hub, "a").await;

        assert_eq!(
            registry.publish_media_state(&a, MediaNotice::Video { value: true }).await,
            None
        );
    }

    #[tokio::test]
    async fn concurrent_joins_keep_one_context_per_participant() {
        let hub = ConnectionHub::new();
        let registry = VoiceSessionRegistry::new(hub.clone(), 64);
        let (a, _a_rx) = connect(&hub, "a").await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let a = a.clone();
            tasks.push(tokio::spawn(async move {
                registry.join(&a, channel(&format!("voice-{}", i % 4))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = registry.stats().await;
        assert_eq!(stats.participants_in_voice, 1);
        assert_eq!(stats.active_channels, 1);
    }
}
