//! In-process store with the same semantics as the PostgreSQL one.
//!
//! Every operation that is a transaction in SQL runs inside a single mutex
//! section here, so "user row + outbox row" is still all-or-nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::store::{
    ClaimedBatch, LoginAttemptStore, MfaStore, OAuthStore, OutboxStore, SessionStore, UserStore,
};
use crate::models::mfa::challenge_order;
use crate::models::{
    ConnectionStatus, LoginAttempt, MfaMethod, MfaMethodKind, NewOutboxEvent, NewUser,
    OAuthConnection, OAuthToken, OutboxRecord, RevokeOutcome, Role, Session, TotpSecretRecord,
    User,
};

#[derive(Debug, Clone)]
struct BackupCode {
    used_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    roles: Vec<Role>,
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    mfa_methods: HashMap<(Uuid, MfaMethodKind), MfaMethod>,
    totp_secrets: HashMap<Uuid, TotpSecretRecord>,
    backup_codes: HashMap<(Uuid, String), BackupCode>,
    connections: HashMap<(String, String), OAuthConnection>,
    tokens: HashMap<(Uuid, String), OAuthToken>,
    login_attempts: Vec<LoginAttempt>,
    outbox: Vec<OutboxRecord>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                roles: Role::seeded(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    /// Snapshot of every outbox row, oldest first.
    pub fn outbox_records(&self) -> StoreResult<Vec<OutboxRecord>> {
        Ok(self.lock()?.outbox.clone())
    }

    pub fn login_attempts(&self) -> StoreResult<Vec<LoginAttempt>> {
        Ok(self.lock()?.login_attempts.clone())
    }

    pub fn user_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.users.len())
    }
}

fn email_taken(inner: &Inner, email: &str) -> bool {
    inner
        .users
        .values()
        .any(|u| u.deleted_at.is_none() && u.email.eq_ignore_ascii_case(email))
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn resolve_role(&self, name: &str) -> StoreResult<Option<Role>> {
        let inner = self.lock()?;
        Ok(inner
            .roles
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn create_with_outbox(
        &self,
        user: NewUser,
        event: Option<NewOutboxEvent>,
    ) -> StoreResult<User> {
        let mut inner = self.lock()?;
        if email_taken(&inner, &user.email) {
            return Err(StoreError::Conflict(format!(
                "email already registered: {}",
                user.email
            )));
        }
        if inner.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("duplicate user id: {}", user.id)));
        }

        let user = user.into_user();
        inner.users.insert(user.id, user.clone());
        if let Some(event) = event {
            inner.outbox.push(event.into_record());
        }
        Ok(user)
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let inner = self.lock()?;
        Ok(inner
            .users
            .values()
            .find(|u| u.deleted_at.is_none() && u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))?;
        user.password_hash = Some(password_hash.to_string());
        user.updated_at = now;
        Ok(())
    }

    async fn deactivate_with_outbox(
        &self,
        id: Uuid,
        event: NewOutboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))?;
        user.active = false;
        user.deleted_at.get_or_insert(now);
        user.updated_at = now;
        inner.outbox.push(event.into_record());
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {}", session.id)));
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn revoke_by_id(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<RevokeOutcome> {
        let mut inner = self.lock()?;
        match inner.sessions.get_mut(&id) {
            None => Ok(RevokeOutcome::NotFound),
            Some(s) if s.revoked_at.is_some() => Ok(RevokeOutcome::AlreadyRevoked),
            Some(s) => {
                s.revoked_at = Some(now);
                Ok(RevokeOutcome::Revoked)
            }
        }
    }

    async fn revoke_all_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut inner = self.lock()?;
        let mut revoked = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(now);
                revoked.push(session.id);
            }
        }
        Ok(revoked)
    }

    async fn touch_activity(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;
        session.last_activity_at = now.max(session.last_activity_at);
        session.expires_at = expires_at.max(session.last_activity_at);
        Ok(())
    }

    async fn list_by_user(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let inner = self.lock()?;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

#[async_trait]
impl MfaStore for MemoryStore {
    async fn list_enabled_methods(&self, user_id: Uuid) -> StoreResult<Vec<MfaMethod>> {
        let inner = self.lock()?;
        let mut methods: Vec<MfaMethod> = inner
            .mfa_methods
            .values()
            .filter(|m| m.user_id == user_id && m.enabled)
            .cloned()
            .collect();
        methods.sort_by(challenge_order);
        Ok(methods)
    }

    async fn upsert_method(
        &self,
        user_id: Uuid,
        kind: MfaMethodKind,
        enabled: bool,
        is_primary: bool,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if is_primary {
            for method in inner.mfa_methods.values_mut() {
                if method.user_id == user_id {
                    method.is_primary = false;
                }
            }
        }
        inner.mfa_methods.insert(
            (user_id, kind),
            MfaMethod {
                user_id,
                kind,
                enabled,
                is_primary,
            },
        );
        Ok(())
    }

    async fn upsert_totp_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.lock()?.totp_secrets.insert(
            user_id,
            TotpSecretRecord {
                user_id,
                secret_encrypted: secret_encrypted.to_vec(),
                deactivated: false,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_totp_secret(&self, user_id: Uuid) -> StoreResult<Option<TotpSecretRecord>> {
        Ok(self.lock()?.totp_secrets.get(&user_id).cloned())
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.backup_codes.retain(|(owner, _), _| *owner != user_id);
        for hash in code_hashes {
            inner
                .backup_codes
                .insert((user_id, hash.clone()), BackupCode { used_at: None });
        }
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.backup_codes.get_mut(&(user_id, code_hash.to_string())) {
            Some(code) if code.used_at.is_none() => {
                code.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OAuthStore for MemoryStore {
    async fn get_connection(
        &self,
        issuer: &str,
        subject: &str,
    ) -> StoreResult<Option<OAuthConnection>> {
        let inner = self.lock()?;
        Ok(inner
            .connections
            .get(&(issuer.to_string(), subject.to_string()))
            .cloned())
    }

    async fn upsert_connection(
        &self,
        connection: &OAuthConnection,
    ) -> StoreResult<OAuthConnection> {
        let mut inner = self.lock()?;
        let key = (connection.issuer.clone(), connection.subject.clone());
        let stored = match inner.connections.get_mut(&key) {
            Some(existing) => {
                existing.provider = connection.provider.clone();
                existing.email = connection.email.clone();
                existing.status = ConnectionStatus::Active.as_str().to_string();
                existing.last_login_at = connection.last_login_at.or(existing.last_login_at);
                existing.clone()
            }
            None => {
                inner.connections.insert(key, connection.clone());
                connection.clone()
            }
        };
        Ok(stored)
    }

    async fn list_active_connections(&self, user_id: Uuid) -> StoreResult<Vec<OAuthConnection>> {
        let inner = self.lock()?;
        let mut connections: Vec<OAuthConnection> = inner
            .connections
            .values()
            .filter(|c| c.user_id == user_id && c.is_active())
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.linked_at.cmp(&b.linked_at));
        Ok(connections)
    }

    async fn set_connection_status(
        &self,
        issuer: &str,
        subject: &str,
        status: ConnectionStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner
            .connections
            .get_mut(&(issuer.to_string(), subject.to_string()))
        {
            Some(c) => {
                c.status = status.as_str().to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_provider_status(
        &self,
        user_id: Uuid,
        provider: &str,
        status: ConnectionStatus,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        for c in inner.connections.values_mut() {
            if c.user_id == user_id
                && c.provider == provider
                && c.status != ConnectionStatus::Revoked.as_str()
            {
                c.status = status.as_str().to_string();
            }
        }
        Ok(())
    }

    async fn upsert_token(&self, token: &OAuthToken) -> StoreResult<()> {
        self.lock()?
            .tokens
            .insert((token.user_id, token.provider.clone()), token.clone());
        Ok(())
    }

    async fn get_token(&self, user_id: Uuid, provider: &str) -> StoreResult<Option<OAuthToken>> {
        Ok(self
            .lock()?
            .tokens
            .get(&(user_id, provider.to_string()))
            .cloned())
    }

    async fn delete_token(&self, user_id: Uuid, provider: &str) -> StoreResult<()> {
        self.lock()?.tokens.remove(&(user_id, provider.to_string()));
        Ok(())
    }

    async fn list_expiring_tokens(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OAuthToken>> {
        let inner = self.lock()?;
        let linked = |t: &OAuthToken| {
            inner.connections.values().any(|c| {
                c.user_id == t.user_id
                    && c.provider == t.provider
                    && c.status != ConnectionStatus::Revoked.as_str()
            })
        };
        let mut tokens: Vec<OAuthToken> = inner
            .tokens
            .values()
            .filter(|t| t.refresh_token_encrypted.is_some())
            .filter(|t| t.expires_at.map(|exp| exp <= before).unwrap_or(false))
            .filter(|t| linked(t))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        tokens.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(tokens)
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryStore {
    async fn record(&self, attempt: &LoginAttempt) -> StoreResult<()> {
        self.lock()?.login_attempts.push(attempt.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> StoreResult<()> {
        self.lock()?.outbox.push(event.into_record());
        Ok(())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        claim_ttl: Duration,
    ) -> StoreResult<ClaimedBatch> {
        let mut inner = self.lock()?;
        let claim_token = Uuid::new_v4();
        let limit = usize::try_from(batch_size.max(0)).unwrap_or(0);

        let mut indices: Vec<usize> = inner
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_claimable(now))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| inner.outbox[i].created_at);
        indices.truncate(limit);

        let mut records = Vec::with_capacity(indices.len());
        for i in indices {
            let record = &mut inner.outbox[i];
            record.claim_token = Some(claim_token);
            record.claim_until = Some(now + claim_ttl);
            record.first_seen_at.get_or_insert(now);
            records.push(record.clone());
        }

        Ok(ClaimedBatch {
            claim_token,
            records,
        })
    }

    async fn mark_published(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(match claimed_row(&mut inner, event_id, claim_token) {
            Some(record) => {
                record.published_at = Some(now);
                record.claim_token = None;
                record.claim_until = None;
                true
            }
            None => false,
        })
    }

    async fn mark_dead_lettered(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(match claimed_row(&mut inner, event_id, claim_token) {
            Some(record) => {
                record.dead_lettered_at = Some(now);
                if let Some(error) = error {
                    record.last_error = Some(error.to_string());
                    record.last_error_at = Some(now);
                }
                record.claim_token = None;
                record.claim_until = None;
                true
            }
            None => false,
        })
    }

    async fn record_failure(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(match claimed_row(&mut inner, event_id, claim_token) {
            Some(record) => {
                record.retry_count += 1;
                record.last_error = Some(error.to_string());
                record.last_error_at = Some(now);
                record.claim_token = None;
                record.claim_until = None;
                true
            }
            None => false,
        })
    }

    async fn get(&self, event_id: Uuid) -> StoreResult<Option<OutboxRecord>> {
        Ok(self
            .lock()?
            .outbox
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned())
    }
}

/// Row still owned by `claim_token` and not yet terminal.
fn claimed_row(inner: &mut Inner, event_id: Uuid, claim_token: Uuid) -> Option<&mut OutboxRecord> {
    inner.outbox.iter_mut().find(|r| {
        r.event_id == event_id
            && r.claim_token == Some(claim_token)
            && r.published_at.is_none()
            && r.dead_lettered_at.is_none()
    })
}
