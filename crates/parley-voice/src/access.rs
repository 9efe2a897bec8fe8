//! Seams to the rest of the platform: who a token belongs to, and who may
//! join which channel. Identity and membership live elsewhere; the voice
//! server only asks.

use async_trait::async_trait;
use parley_common::auth::validate_token;
use parley_common::permissions::Permissions;
use parley_common::{ChannelId, ParleyError, ParleyResult, ParticipantId, ServerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves an `identify` token to a participant.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> ParleyResult<ParticipantId>;
}

/// Validates HS256 access tokens issued by the identity service.
pub struct JwtAuthenticator {
    secret: String,
}

impl JwtAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> ParleyResult<ParticipantId> {
        let claims = validate_token(token, &self.secret).map_err(|e| {
            tracing::debug!("Rejected voice token: {e}");
            ParleyError::InvalidToken
        })?;
        if claims.token_type != "access" {
            return Err(ParleyError::InvalidToken);
        }
        Ok(ParticipantId::new(claims.sub))
    }
}

/// Membership check for voice channels.
#[async_trait]
pub trait VoiceAccess: Send + Sync {
    async fn can_join_voice(
        &self,
        participant: &ParticipantId,
        server_id: &ServerId,
        channel_id: &ChannelId,
    ) -> bool;
}

/// Lets everyone into every channel.
pub struct AllowAll;

#[async_trait]
impl VoiceAccess for AllowAll {
    async fn can_join_voice(&self, _: &ParticipantId, _: &ServerId, _: &ChannelId) -> bool {
        true
    }
}

/// In-memory per-server permission grants on top of a default set.
#[derive(Clone)]
pub struct PermissionTable {
    default: Permissions,
    grants: Arc<RwLock<HashMap<(ServerId, ParticipantId), Permissions>>>,
}

impl PermissionTable {
    pub fn new(default: Permissions) -> Self {
        Self {
            default,
            grants: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the permissions of `participant` in `server_id`.
    pub async fn set(&self, server_id: ServerId, participant: ParticipantId, perms: Permissions) {
        self.grants.write().await.insert((server_id, participant), perms);
    }

    pub async fn get(&self, server_id: &ServerId, participant: &ParticipantId) -> Permissions {
        self.grants
            .read()
            .await
            .get(&(server_id.clone(), participant.clone()))
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for PermissionTable {
    fn default() -> Self {
        Self::new(Permissions::default_everyone())
    }
}

#[async_trait]
impl VoiceAccess for PermissionTable {
    async fn can_join_voice(
        &self,
        participant: &ParticipantId,
        server_id: &ServerId,
        _channel_id: &ChannelId,
    ) -> bool {
        self.get(server_id, participant).await.can_join_voice()
    }
}
