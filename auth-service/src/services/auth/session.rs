use chrono::{DateTime, Duration, TimeZone, Utc};
use service_core::auth::{Jwks, SessionClaims};
use service_core::context::RequestContext;
use uuid::Uuid;

use super::{parse_uuid, to_chrono, AuthService, RefreshedToken};
use crate::models::outbox::{rfc3339, UserDeletedData, USER_DELETED};
use crate::models::{NewOutboxEvent, RevokeOutcome, Session, User};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::lockout::login_key;

impl AuthService {
    /// Check signature, expiry, revocation and the backing session.
    #[tracing::instrument(skip_all)]
    pub async fn validate_token(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> ServiceResult<SessionClaims> {
        self.observe(ctx, "validate_token", async {
            let (claims, _) = self.authenticate(token).await?;
            Ok(claims)
        })
        .await
    }

    /// Verified claims plus the live session behind them.
    pub(super) async fn authenticate(&self, token: &str) -> ServiceResult<(SessionClaims, Session)> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServiceError::invalid_input("token is required"));
        }
        let now = self.now();
        let claims = self.jwt.verify(token, now)?;
        let session = self.live_session(&claims, now).await?;
        Ok((claims, session))
    }

    /// Revocation flag first, then the stored session, most specific failure wins.
    async fn live_session(&self, claims: &SessionClaims, now: DateTime<Utc>) -> ServiceResult<Session> {
        let session_id = parse_uuid(&claims.session_id)?;
        let user_id = parse_uuid(&claims.user_id)?;

        if self.ephemeral.is_revoked(session_id).await? {
            return Err(ServiceError::SessionRevoked);
        }

        let session = self
            .sessions
            .get_by_id(session_id)
            .await?
            .ok_or(ServiceError::Unauthorized)?;
        if session.user_id != user_id {
            tracing::warn!(session_id = %session_id, "Token user does not own the session");
            return Err(ServiceError::Unauthorized);
        }
        if session.is_revoked() {
            return Err(ServiceError::SessionRevoked);
        }
        if session.is_expired(now)
            || session.past_absolute_ttl(now, to_chrono(self.settings.session_absolute_ttl))
        {
            return Err(ServiceError::SessionExpired);
        }
        Ok(session)
    }

    /// Re-sign a valid token with a later expiry and slide the session.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, ctx: &RequestContext, token: &str) -> ServiceResult<RefreshedToken> {
        self.observe(ctx, "refresh", async {
            let now = self.now();
            let (claims, session) = self.authenticate(token).await?;
            let user = self.load_active_user(session.user_id).await?;

            let expires_at = session.slid_expiry(
                now,
                to_chrono(self.settings.session_ttl),
                to_chrono(self.settings.session_absolute_ttl),
            );
            self.sessions
                .touch_activity(session.id, now, expires_at)
                .await?;

            // Strictly later than the token being replaced
            let exp = (now + to_chrono(self.settings.token_ttl))
                .max(timestamp(claims.exp) + Duration::seconds(1));
            let token = self.sign(&user, session.id, now, exp)?;

            tracing::debug!(session_id = %session.id, "Token refreshed");
            Ok(RefreshedToken {
                token,
                expires_in: (exp - now).num_seconds(),
            })
        })
        .await
    }

    /// Revoke the session behind `token`. Repeating it is harmless.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, ctx: &RequestContext, token: &str) -> ServiceResult<u32> {
        self.observe(ctx, "logout", async {
            let token = token.trim();
            if token.is_empty() {
                return Err(ServiceError::invalid_input("token is required"));
            }
            let now = self.now();
            // An expired token may still end its session
            let claims = self.jwt.verify_signature(token)?;
            let session_id = parse_uuid(&claims.session_id)?;
            let user_id = parse_uuid(&claims.user_id)?;

            if let Some(session) = self.sessions.get_by_id(session_id).await? {
                if session.user_id != user_id {
                    return Err(ServiceError::Unauthorized);
                }
            }

            let outcome = self.sessions.revoke_by_id(session_id, now).await?;
            self.flag_sessions_revoked(&[session_id]).await?;

            tracing::info!(user_id = %user_id, session_id = %session_id, outcome = ?outcome, "Session logged out");
            Ok(match outcome {
                RevokeOutcome::Revoked => 1,
                RevokeOutcome::AlreadyRevoked | RevokeOutcome::NotFound => 0,
            })
        })
        .await
    }

    /// Revoke every session of the token's user.
    #[tracing::instrument(skip_all)]
    pub async fn logout_all(&self, ctx: &RequestContext, token: &str) -> ServiceResult<u32> {
        self.observe(ctx, "logout_all", async {
            let (_, session) = self.authenticate(token).await?;
            let revoked = self.revoke_user_sessions(session.user_id).await?;
            Ok(revoked.len() as u32)
        })
        .await
    }

    /// Revoke the user's sessions in the store and flag each one.
    async fn revoke_user_sessions(&self, user_id: Uuid) -> ServiceResult<Vec<Uuid>> {
        let now = self.now();
        let revoked = self.sessions.revoke_all_by_user(user_id, now).await?;
        self.flag_sessions_revoked(&revoked).await?;
        tracing::info!(user_id = %user_id, count = revoked.len(), "Sessions revoked");
        Ok(revoked)
    }

    /// Revoke all sessions, deactivate the account and announce `user.deleted`.
    #[tracing::instrument(skip_all)]
    pub async fn delete_account(&self, ctx: &RequestContext, token: &str) -> ServiceResult<()> {
        self.observe(ctx, "delete_account", async {
            let now = self.now();
            let (_, session) = self.authenticate(token).await?;
            let user = self.load_active_user(session.user_id).await?;

            self.revoke_user_sessions(user.id).await?;

            let event = NewOutboxEvent::envelope(
                USER_DELETED,
                "data.user_id",
                &user.id.to_string(),
                &UserDeletedData {
                    user_id: user.id,
                    email: user.email.clone(),
                    deleted_at: rfc3339(now),
                },
                now,
            )
            .map_err(|e| ServiceError::Internal(e.into()))?;
            self.users.deactivate_with_outbox(user.id, event, now).await?;

            if let Err(e) = self.lockout.clear(&login_key(&user.email)).await {
                tracing::warn!(error = %e, "Failed to clear lockout counter");
            }

            tracing::info!(user_id = %user.id, "Account deleted");
            Ok(())
        })
        .await
    }

    /// Identity lookup for peer services; works for disabled and deleted users too.
    pub async fn get_user_identity(&self, ctx: &RequestContext, user_id: &str) -> ServiceResult<User> {
        self.observe(ctx, "get_user_identity", async {
            let id = Uuid::parse_str(user_id.trim())
                .map_err(|_| ServiceError::invalid_input("user_id must be a UUID"))?;
            self.users
                .get_by_id(id)
                .await?
                .ok_or_else(|| ServiceError::NotFound("user not found".to_string()))
        })
        .await
    }

    pub fn public_keys(&self) -> Jwks {
        self.jwt.jwks()
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
