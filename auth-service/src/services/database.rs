//! PostgreSQL implementation of the store traits.
//!
//! Queries are plain parameterised SQL. Each statement runs inside a
//! `db.query` span carrying the statement text.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::store::{
    ClaimedBatch, LoginAttemptStore, MfaStore, OAuthStore, OutboxStore, SessionStore, UserStore,
};
use crate::models::{
    ConnectionStatus, LoginAttempt, MfaMethod, MfaMethodKind, MfaMethodRow, NewOutboxEvent,
    NewUser, OAuthConnection, OAuthToken, OutboxRecord, RevokeOutcome, Role, Session,
    TotpSecretRecord, User,
};

const USER_COLUMNS: &str = r"
    SELECT u.id, u.email, u.password_hash, u.role_id, r.name AS role_name,
           u.email_verified, u.active, u.deleted_at, u.created_at, u.updated_at
    FROM users u
    JOIN roles r ON r.id = u.role_id
";

fn db_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Relational store backed by a `PgPool`.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_outbox(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &NewOutboxEvent,
) -> StoreResult<()> {
    let query = r"
        INSERT INTO outbox_events (event_id, event_type, partition_key, payload, created_at)
        VALUES ($1, $2, $3, $4, $5)
    ";
    sqlx::query(query)
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.partition_key)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .instrument(db_span("INSERT", query))
        .await?;
    Ok(())
}

#[async_trait]
impl UserStore for Database {
    async fn resolve_role(&self, name: &str) -> StoreResult<Option<Role>> {
        let query = "SELECT id, name, self_assignable FROM roles WHERE upper(name) = upper($1)";
        let role = sqlx::query_as::<_, Role>(query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(role)
    }

    async fn create_with_outbox(
        &self,
        user: NewUser,
        event: Option<NewOutboxEvent>,
    ) -> StoreResult<User> {
        let mut tx = self.pool.begin().await?;

        let query = r"
            INSERT INTO users (id, email, password_hash, role_id, email_verified, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.role.id)
            .bind(user.email_verified)
            .bind(user.created_at)
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await?;

        if let Some(event) = &event {
            insert_outbox(&mut tx, event).await?;
        }

        // Dropping the transaction on any error above rolls both inserts back.
        tx.commit().await?;
        Ok(user.into_user())
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let query = format!("{USER_COLUMNS} WHERE u.id = $1");
        let user = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        Ok(user)
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let query = format!("{USER_COLUMNS} WHERE lower(u.email) = lower($1) AND u.deleted_at IS NULL");
        let user = sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        Ok(user)
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = "UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    async fn deactivate_with_outbox(
        &self,
        id: Uuid,
        event: NewOutboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let query = r"
            UPDATE users
            SET active = FALSE, deleted_at = COALESCE(deleted_at, $2), updated_at = $2
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", id)));
        }

        insert_outbox(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        let query = r"
            INSERT INTO sessions (id, user_id, device_name, device_os, ip_address, user_agent,
                                  created_at, last_activity_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.device_name)
            .bind(&session.device_os)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .bind(session.expires_at)
            .bind(session.revoked_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let query = "SELECT * FROM sessions WHERE id = $1";
        let session = sqlx::query_as::<_, Session>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(session)
    }

    async fn revoke_by_id(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<RevokeOutcome> {
        let mut tx = self.pool.begin().await?;

        let query = "SELECT revoked_at FROM sessions WHERE id = $1 FOR UPDATE";
        let existing: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await?;

        let outcome = match existing {
            None => RevokeOutcome::NotFound,
            Some((Some(_),)) => RevokeOutcome::AlreadyRevoked,
            Some((None,)) => {
                let query = "UPDATE sessions SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL";
                sqlx::query(query)
                    .bind(id)
                    .bind(now)
                    .execute(&mut *tx)
                    .instrument(db_span("UPDATE", query))
                    .await?;
                RevokeOutcome::Revoked
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn revoke_all_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let query = r"
            UPDATE sessions SET revoked_at = $2
            WHERE user_id = $1 AND revoked_at IS NULL
            RETURNING id
        ";
        let ids: Vec<(Uuid,)> = sqlx::query_as(query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn touch_activity(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = r"
            UPDATE sessions
            SET last_activity_at = GREATEST(last_activity_at, $2),
                expires_at = GREATEST($3, GREATEST(last_activity_at, $2))
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    async fn list_by_user(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let query = "SELECT * FROM sessions WHERE user_id = $1 ORDER BY created_at DESC";
        let sessions = sqlx::query_as::<_, Session>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(sessions)
    }
}

#[async_trait]
impl MfaStore for Database {
    async fn list_enabled_methods(&self, user_id: Uuid) -> StoreResult<Vec<MfaMethod>> {
        let query = r"
            SELECT user_id, method_type, enabled, is_primary, updated_at
            FROM mfa_methods
            WHERE user_id = $1 AND enabled
            ORDER BY is_primary DESC, method_type ASC
        ";
        let rows = sqlx::query_as::<_, MfaMethodRow>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;

        rows.into_iter()
            .map(|row| MfaMethod::try_from(row).map_err(|e| StoreError::Backend(anyhow::anyhow!(e))))
            .collect()
    }

    async fn upsert_method(
        &self,
        user_id: Uuid,
        kind: MfaMethodKind,
        enabled: bool,
        is_primary: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        if is_primary {
            let query = "UPDATE mfa_methods SET is_primary = FALSE WHERE user_id = $1 AND method_type <> $2";
            sqlx::query(query)
                .bind(user_id)
                .bind(kind.as_str())
                .execute(&mut *tx)
                .instrument(db_span("UPDATE", query))
                .await?;
        }

        let query = r"
            INSERT INTO mfa_methods (user_id, method_type, enabled, is_primary, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, method_type)
            DO UPDATE SET enabled = EXCLUDED.enabled,
                          is_primary = EXCLUDED.is_primary,
                          updated_at = EXCLUDED.updated_at
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(kind.as_str())
            .bind(enabled)
            .bind(is_primary)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_totp_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = r"
            INSERT INTO mfa_totp_secrets (user_id, secret_encrypted, deactivated, updated_at)
            VALUES ($1, $2, FALSE, $3)
            ON CONFLICT (user_id)
            DO UPDATE SET secret_encrypted = EXCLUDED.secret_encrypted,
                          deactivated = FALSE,
                          updated_at = EXCLUDED.updated_at
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(secret_encrypted)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn get_totp_secret(&self, user_id: Uuid) -> StoreResult<Option<TotpSecretRecord>> {
        let query = "SELECT * FROM mfa_totp_secrets WHERE user_id = $1";
        let record = sqlx::query_as::<_, TotpSecretRecord>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(record)
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let query = "DELETE FROM mfa_backup_codes WHERE user_id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(db_span("DELETE", query))
            .await?;

        let query = r"
            INSERT INTO mfa_backup_codes (user_id, code_hash, created_at)
            SELECT $1, hash, $3 FROM UNNEST($2::text[]) AS hash
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(code_hashes)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = r"
            UPDATE mfa_backup_codes SET used_at = $3
            WHERE user_id = $1 AND code_hash = $2 AND used_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(code_hash)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl OAuthStore for Database {
    async fn get_connection(
        &self,
        issuer: &str,
        subject: &str,
    ) -> StoreResult<Option<OAuthConnection>> {
        let query = "SELECT * FROM oauth_connections WHERE issuer = $1 AND subject = $2";
        let connection = sqlx::query_as::<_, OAuthConnection>(query)
            .bind(issuer)
            .bind(subject)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(connection)
    }

    async fn upsert_connection(
        &self,
        connection: &OAuthConnection,
    ) -> StoreResult<OAuthConnection> {
        let query = r"
            INSERT INTO oauth_connections (issuer, subject, user_id, provider, email, status,
                                           is_primary, linked_at, last_login_at)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8)
            ON CONFLICT (issuer, subject)
            DO UPDATE SET provider = EXCLUDED.provider,
                          email = EXCLUDED.email,
                          status = 'active',
                          last_login_at = COALESCE(EXCLUDED.last_login_at, oauth_connections.last_login_at)
            RETURNING *
        ";
        let stored = sqlx::query_as::<_, OAuthConnection>(query)
            .bind(&connection.issuer)
            .bind(&connection.subject)
            .bind(connection.user_id)
            .bind(&connection.provider)
            .bind(&connection.email)
            .bind(connection.is_primary)
            .bind(connection.linked_at)
            .bind(connection.last_login_at)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(stored)
    }

    async fn list_active_connections(&self, user_id: Uuid) -> StoreResult<Vec<OAuthConnection>> {
        let query = r"
            SELECT * FROM oauth_connections
            WHERE user_id = $1 AND status = 'active'
            ORDER BY linked_at ASC
        ";
        let connections = sqlx::query_as::<_, OAuthConnection>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(connections)
    }

    async fn set_connection_status(
        &self,
        issuer: &str,
        subject: &str,
        status: ConnectionStatus,
    ) -> StoreResult<bool> {
        let query = "UPDATE oauth_connections SET status = $3 WHERE issuer = $1 AND subject = $2";
        let result = sqlx::query(query)
            .bind(issuer)
            .bind(subject)
            .bind(status.as_str())
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_provider_status(
        &self,
        user_id: Uuid,
        provider: &str,
        status: ConnectionStatus,
    ) -> StoreResult<()> {
        let query = r"
            UPDATE oauth_connections SET status = $3
            WHERE user_id = $1 AND provider = $2 AND status <> 'revoked'
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(provider)
            .bind(status.as_str())
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn upsert_token(&self, token: &OAuthToken) -> StoreResult<()> {
        let query = r"
            INSERT INTO oauth_tokens (user_id, provider, access_token_encrypted,
                                      refresh_token_encrypted, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, provider)
            DO UPDATE SET access_token_encrypted = EXCLUDED.access_token_encrypted,
                          refresh_token_encrypted = COALESCE(EXCLUDED.refresh_token_encrypted,
                                                             oauth_tokens.refresh_token_encrypted),
                          expires_at = EXCLUDED.expires_at,
                          updated_at = EXCLUDED.updated_at
        ";
        sqlx::query(query)
            .bind(token.user_id)
            .bind(&token.provider)
            .bind(&token.access_token_encrypted)
            .bind(&token.refresh_token_encrypted)
            .bind(token.expires_at)
            .bind(token.updated_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn get_token(&self, user_id: Uuid, provider: &str) -> StoreResult<Option<OAuthToken>> {
        let query = "SELECT * FROM oauth_tokens WHERE user_id = $1 AND provider = $2";
        let token = sqlx::query_as::<_, OAuthToken>(query)
            .bind(user_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(token)
    }

    async fn delete_token(&self, user_id: Uuid, provider: &str) -> StoreResult<()> {
        let query = "DELETE FROM oauth_tokens WHERE user_id = $1 AND provider = $2";
        sqlx::query(query)
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(())
    }

    async fn list_expiring_tokens(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OAuthToken>> {
        let query = r"
            SELECT t.* FROM oauth_tokens t
            WHERE t.refresh_token_encrypted IS NOT NULL AND t.expires_at <= $1
              AND EXISTS (
                  SELECT 1 FROM oauth_connections c
                  WHERE c.user_id = t.user_id AND c.provider = t.provider
                    AND c.status <> 'revoked'
              )
            ORDER BY t.expires_at ASC
            LIMIT $2
        ";
        let tokens = sqlx::query_as::<_, OAuthToken>(query)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(tokens)
    }
}

#[async_trait]
impl LoginAttemptStore for Database {
    async fn record(&self, attempt: &LoginAttempt) -> StoreResult<()> {
        let query = r"
            INSERT INTO login_attempts (id, user_id, attempted_at, ip_address, status,
                                        failure_reason, device_name, device_os, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        sqlx::query(query)
            .bind(attempt.id)
            .bind(attempt.user_id)
            .bind(attempt.attempted_at)
            .bind(&attempt.device.ip_address)
            .bind(attempt.status.as_str())
            .bind(&attempt.failure_reason)
            .bind(&attempt.device.device_name)
            .bind(&attempt.device.device_os)
            .bind(&attempt.device.user_agent)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for Database {
    async fn enqueue(&self, event: NewOutboxEvent) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_outbox(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        claim_ttl: Duration,
    ) -> StoreResult<ClaimedBatch> {
        let claim_token = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        // Row locks make concurrent workers skip each other's candidates.
        let query = r"
            SELECT event_id
            FROM outbox_events
            WHERE published_at IS NULL
              AND dead_lettered_at IS NULL
              AND (claim_until IS NULL OR claim_until < $1)
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        ";
        let ids: Vec<(Uuid,)> = sqlx::query_as(query)
            .bind(now)
            .bind(batch_size)
            .fetch_all(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(ClaimedBatch {
                claim_token,
                records: Vec::new(),
            });
        }

        let ids: Vec<Uuid> = ids.into_iter().map(|(id,)| id).collect();
        let query = r"
            UPDATE outbox_events
            SET claim_token = $2,
                claim_until = $3,
                first_seen_at = COALESCE(first_seen_at, $4)
            WHERE event_id = ANY($1)
            RETURNING *
        ";
        let mut records = sqlx::query_as::<_, OutboxRecord>(query)
            .bind(&ids)
            .bind(claim_token)
            .bind(now + claim_ttl)
            .bind(now)
            .fetch_all(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;

        tx.commit().await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

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
        let query = r"
            UPDATE outbox_events
            SET published_at = $3, claim_token = NULL, claim_until = NULL
            WHERE event_id = $1 AND claim_token = $2
              AND published_at IS NULL AND dead_lettered_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(event_id)
            .bind(claim_token)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead_lettered(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = r"
            UPDATE outbox_events
            SET dead_lettered_at = $3,
                last_error = COALESCE($4, last_error),
                last_error_at = CASE WHEN $4 IS NULL THEN last_error_at ELSE $3 END,
                claim_token = NULL,
                claim_until = NULL
            WHERE event_id = $1 AND claim_token = $2
              AND published_at IS NULL AND dead_lettered_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(event_id)
            .bind(claim_token)
            .bind(now)
            .bind(error)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        event_id: Uuid,
        claim_token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = r"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                last_error = $3,
                last_error_at = $4,
                claim_token = NULL,
                claim_until = NULL
            WHERE event_id = $1 AND claim_token = $2
              AND published_at IS NULL AND dead_lettered_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(event_id)
            .bind(claim_token)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, event_id: Uuid) -> StoreResult<Option<OutboxRecord>> {
        let query = "SELECT * FROM outbox_events WHERE event_id = $1";
        let record = sqlx::query_as::<_, OutboxRecord>(query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(record)
    }
}
