//! Persistence seams for the authentication core.
//!
//! The PostgreSQL implementation lives in `database.rs`; `memory.rs` provides
//! an in-process implementation with the same semantics for tests and local
//! development. All timestamps are passed in by the caller so the orchestrator's
//! clock is the only source of time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::StoreResult;
use crate::models::{
    ConnectionStatus, LoginAttempt, MfaMethod, MfaMethodKind, NewOutboxEvent, NewUser,
    OAuthConnection, OAuthToken, OutboxRecord, RevokeOutcome, Role, Session, TotpSecretRecord,
    User,
};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up a role by (case-insensitive) name.
    async fn resolve_role(&self, name: &str) -> StoreResult<Option<Role>>;

    /// Insert the user and, when given, its announcing event in one transaction.
    /// A live user with the same email yields `StoreError::Conflict`.
    async fn create_with_outbox(
        &self,
        user: NewUser,
        event: Option<NewOutboxEvent>,
    ) -> StoreResult<User>;

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    /// Live (not soft-deleted) user with this normalised email.
    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Deactivate and soft-delete the user together with its event.
    async fn deactivate_with_outbox(
        &self,
        id: Uuid,
        event: NewOutboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> StoreResult<()>;

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Session>>;

    /// Idempotent; distinguishes a missing session from one already revoked.
    async fn revoke_by_id(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<RevokeOutcome>;

    /// Revoke every live session of the user, returning the ids revoked now.
    async fn revoke_all_by_user(&self, user_id: Uuid, now: DateTime<Utc>)
    -> StoreResult<Vec<Uuid>>;

    async fn touch_activity(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn list_by_user(&self, user_id: Uuid) -> StoreResult<Vec<Session>>;
}

#[async_trait]
pub trait MfaStore: Send + Sync {
    /// Enabled methods, primary first then by method name.
    async fn list_enabled_methods(&self, user_id: Uuid) -> StoreResult<Vec<MfaMethod>>;

    /// Marking a method primary demotes the user's other methods.
    async fn upsert_method(
        &self,
        user_id: Uuid,
        kind: MfaMethodKind,
        enabled: bool,
        is_primary: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Stores a new encrypted secret and clears the deactivated flag.
    async fn upsert_totp_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn get_totp_secret(&self, user_id: Uuid) -> StoreResult<Option<TotpSecretRecord>>;

    /// Replace the whole set of backup code hashes.
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Mark an unused code as used. Returns `true` for exactly one caller.
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait OAuthStore: Send + Sync {
    async fn get_connection(
        &self,
        issuer: &str,
        subject: &str,
    ) -> StoreResult<Option<OAuthConnection>>;

    /// Insert, or reactivate and refresh an existing `(issuer, subject)` row.
    /// `is_primary` and `user_id` only apply on insert.
    async fn upsert_connection(&self, connection: &OAuthConnection)
    -> StoreResult<OAuthConnection>;

    async fn list_active_connections(&self, user_id: Uuid) -> StoreResult<Vec<OAuthConnection>>;

    async fn set_connection_status(
        &self,
        issuer: &str,
        subject: &str,
        status: ConnectionStatus,
    ) -> StoreResult<bool>;

    /// Update every connection of the user through `provider`. Revoked
    /// connections are left alone.
    async fn set_provider_status(
        &self,
        user_id: Uuid,
        provider: &str,
        status: ConnectionStatus,
    ) -> StoreResult<()>;

    async fn upsert_token(&self, token: &OAuthToken) -> StoreResult<()>;

    async fn get_token(&self, user_id: Uuid, provider: &str) -> StoreResult<Option<OAuthToken>>;

    async fn delete_token(&self, user_id: Uuid, provider: &str) -> StoreResult<()>;

    /// Tokens with a refresh token whose access token expires at or before `before`,
    /// limited to users still holding a non-revoked connection through that provider.
    async fn list_expiring_tokens(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OAuthToken>>;
}

#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    async fn record(&self, attempt: &LoginAttempt) -> StoreResult<()>;
}

/// A batch of rows claimed under one token.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub claim_token: Uuid,
    pub records: Vec<OutboxRecord>,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Enqueue an event that is not tied to a row change.
    async fn enqueue(&self, event: NewOutboxEvent) -> StoreResult<()>;

    /// Claim up to `batch_size` claimable rows, oldest first, skipping rows
    /// locked by other workers.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        claim_ttl: Duration,
    ) -> StoreResult<ClaimedBatch>;

    // The three updates below only apply while `claim_token` still owns the row.

    async fn mark_published(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn mark_dead_lettered(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Bump `retry_count`, record the error and release the claim.
    async fn record_failure(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get(&self, event_id: Uuid) -> StoreResult<Option<OutboxRecord>>;
}
