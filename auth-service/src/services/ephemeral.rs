//! Typed short-lived records over an [`EphemeralStore`].
//!
//! Each record kind lives in its own key namespace. Records carry their own
//! `expires_at`; the store TTL only bounds how long the bytes survive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::StoreResult;
use super::redis::EphemeralStore;

const MFA_CHALLENGE_PREFIX: &str = "mfa-challenge:";
const OIDC_STATE_PREFIX: &str = "oidc-state:";
const COMPLETION_PREFIX: &str = "oidc-complete:";
const REVOKED_SESSION_PREFIX: &str = "revoked-session:";
const IDEMPOTENCY_PREFIX: &str = "idempotency:register:";
const PASSWORD_RESET_PREFIX: &str = "password-reset:";

/// Extra store lifetime for MFA challenges so an expired challenge can still be
/// told apart from one that never existed.
pub const CHALLENGE_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub method: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcAuthState {
    pub provider: String,
    pub redirect_uri: String,
    pub nonce: String,
    pub login_hint: String,
    pub code_verifier: String,
    pub client_context: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordResetRecord {
    pub user_id: Uuid,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdempotencyRecord {
    fingerprint: String,
    user_id: Option<Uuid>,
}

/// Result of reserving an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// First use; the caller owns the key until it completes or releases it.
    Reserved,
    /// Same request already completed with this user id.
    Replay(Uuid),
    /// Different request under the same key, or the first is still in flight.
    Conflict,
}

/// SHA-256 over the normalised request fields, hex encoded.
pub fn request_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct EphemeralState {
    store: Arc<dyn EphemeralStore>,
}

impl EphemeralState {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> StoreResult<()> {
        let raw = serde_json::to_string(value)?;
        self.store.put(key, &raw, ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn take_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.take(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // MFA challenges

    pub async fn put_mfa_challenge(
        &self,
        temp_token: &str,
        challenge: &MfaChallenge,
        ttl: Duration,
    ) -> StoreResult<()> {
        let key = format!("{}{}", MFA_CHALLENGE_PREFIX, temp_token);
        self.put_json(&key, challenge, ttl + CHALLENGE_GRACE).await
    }

    pub async fn get_mfa_challenge(&self, temp_token: &str) -> StoreResult<Option<MfaChallenge>> {
        self.get_json(&format!("{}{}", MFA_CHALLENGE_PREFIX, temp_token))
            .await
    }

    /// Read and delete; only one caller gets the challenge.
    pub async fn take_mfa_challenge(&self, temp_token: &str) -> StoreResult<Option<MfaChallenge>> {
        self.take_json(&format!("{}{}", MFA_CHALLENGE_PREFIX, temp_token))
            .await
    }

    pub async fn delete_mfa_challenge(&self, temp_token: &str) -> StoreResult<()> {
        self.store
            .delete(&format!("{}{}", MFA_CHALLENGE_PREFIX, temp_token))
            .await
    }

    // OIDC authorize state

    pub async fn put_oidc_state(
        &self,
        state: &str,
        record: &OidcAuthState,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.put_json(&format!("{}{}", OIDC_STATE_PREFIX, state), record, ttl)
            .await
    }

    /// Read and delete in one step; a state value is good for one callback.
    pub async fn take_oidc_state(&self, state: &str) -> StoreResult<Option<OidcAuthState>> {
        self.take_json(&format!("{}{}", OIDC_STATE_PREFIX, state))
            .await
    }

    // Registration completion

    pub async fn put_completion(
        &self,
        token: &str,
        record: &CompletionRecord,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.put_json(&format!("{}{}", COMPLETION_PREFIX, token), record, ttl)
            .await
    }

    pub async fn take_completion(&self, token: &str) -> StoreResult<Option<CompletionRecord>> {
        self.take_json(&format!("{}{}", COMPLETION_PREFIX, token))
            .await
    }

    // Session revocation flags

    pub async fn flag_revoked(&self, session_id: Uuid, ttl: Duration) -> StoreResult<()> {
        self.store
            .put(&format!("{}{}", REVOKED_SESSION_PREFIX, session_id), "1", ttl)
            .await
    }

    pub async fn is_revoked(&self, session_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .store
            .get(&format!("{}{}", REVOKED_SESSION_PREFIX, session_id))
            .await?
            .is_some())
    }

    // Registration idempotency

    pub async fn reserve_idempotency(
        &self,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> StoreResult<IdempotencyOutcome> {
        let store_key = format!("{}{}", IDEMPOTENCY_PREFIX, key);
        let pending = IdempotencyRecord {
            fingerprint: fingerprint.to_string(),
            user_id: None,
        };
        let raw = serde_json::to_string(&pending)?;
        if self.store.put_if_absent(&store_key, &raw, ttl).await? {
            return Ok(IdempotencyOutcome::Reserved);
        }

        let existing: Option<IdempotencyRecord> = self.get_json(&store_key).await?;
        Ok(match existing {
            Some(record) if record.fingerprint == fingerprint => match record.user_id {
                Some(user_id) => IdempotencyOutcome::Replay(user_id),
                None => IdempotencyOutcome::Conflict,
            },
            Some(_) => IdempotencyOutcome::Conflict,
            // Expired between the two calls; the next attempt can reserve it.
            None => IdempotencyOutcome::Conflict,
        })
    }

    pub async fn complete_idempotency(
        &self,
        key: &str,
        fingerprint: &str,
        user_id: Uuid,
        ttl: Duration,
    ) -> StoreResult<()> {
        let record = IdempotencyRecord {
            fingerprint: fingerprint.to_string(),
            user_id: Some(user_id),
        };
        self.put_json(&format!("{}{}", IDEMPOTENCY_PREFIX, key), &record, ttl)
            .await
    }

    pub async fn release_idempotency(&self, key: &str) -> StoreResult<()> {
        self.store
            .delete(&format!("{}{}", IDEMPOTENCY_PREFIX, key))
            .await
    }

    // Password reset. Keyed by a digest so the store never holds a usable token.

    pub async fn put_password_reset(
        &self,
        token: &str,
        record: &PasswordResetRecord,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.put_json(&password_reset_key(token), record, ttl).await
    }

    pub async fn take_password_reset(&self, token: &str) -> StoreResult<Option<PasswordResetRecord>> {
        self.take_json(&password_reset_key(token)).await
    }
}

fn password_reset_key(token: &str) -> String {
    format!(
        "{}{}",
        PASSWORD_RESET_PREFIX,
        hex::encode(Sha256::digest(token.as_bytes()))
    )
}
