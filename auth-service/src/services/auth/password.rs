use service_core::context::RequestContext;

use super::{to_chrono, AuthService};
use crate::models::outbox::{rfc3339, PasswordResetRequestedData, PASSWORD_RESET_REQUESTED};
use crate::models::NewOutboxEvent;
use crate::services::crypto::random_token;
use crate::services::ephemeral::PasswordResetRecord;
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::lockout::login_key;
use crate::utils::{normalize_email, validate_password, Password};

impl AuthService {
    /// Start a password reset. Succeeds outwardly whether or not the account exists.
    #[tracing::instrument(skip_all)]
    pub async fn request_password_reset(&self, ctx: &RequestContext, email: &str) -> ServiceResult<()> {
        self.observe(ctx, "request_password_reset", async {
            let Ok(email) = normalize_email(email) else {
                return Ok(());
            };
            let user = match self.users.get_by_email(&email).await? {
                Some(user) if user.can_authenticate() && user.has_password() => user,
                _ => {
                    tracing::info!("Password reset requested for unknown account");
                    return Ok(());
                }
            };

            let now = self.now();
            let reset_token = random_token();
            self.ephemeral
                .put_password_reset(
                    &reset_token,
                    &PasswordResetRecord {
                        user_id: user.id,
                        email: user.email.clone(),
                        expires_at: now + to_chrono(self.settings.password_reset_ttl),
                    },
                    self.settings.password_reset_ttl,
                )
                .await?;

            let event = NewOutboxEvent::envelope(
                PASSWORD_RESET_REQUESTED,
                "data.email",
                &user.email,
                &PasswordResetRequestedData {
                    user_id: user.id,
                    email: user.email.clone(),
                    reset_token,
                    requested_at: rfc3339(now),
                },
                now,
            )
            .map_err(|e| ServiceError::Internal(e.into()))?;
            self.outbox.enqueue(event).await?;

            tracing::info!(user_id = %user.id, "Password reset requested");
            Ok(())
        })
        .await
    }

    /// Set a new password with a reset token, then sign the user out everywhere.
    #[tracing::instrument(skip_all)]
    pub async fn confirm_password_reset(
        &self,
        ctx: &RequestContext,
        reset_token: &str,
        new_password: Password,
    ) -> ServiceResult<()> {
        self.observe(ctx, "confirm_password_reset", async {
            let reset_token = reset_token.trim();
            if reset_token.is_empty() {
                return Err(ServiceError::invalid_input("reset token is required"));
            }
            // Validate first so a weak password does not burn the token
            validate_password(new_password.as_str()).map_err(ServiceError::InvalidInput)?;

            let now = self.now();
            let record = self
                .ephemeral
                .take_password_reset(reset_token)
                .await?
                .ok_or(ServiceError::Unauthorized)?;
            if record.expires_at <= now {
                return Err(ServiceError::TokenExpired);
            }
            let user = self.load_active_user(record.user_id).await?;

            let password_hash = self.hasher.hash(&new_password).map_err(|e| {
                ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e))
            })?;
            self.users
                .update_password(user.id, password_hash.as_str(), now)
                .await?;

            let revoked = self.sessions.revoke_all_by_user(user.id, now).await?;
            self.flag_sessions_revoked(&revoked).await?;

            if let Err(e) = self.lockout.clear(&login_key(&user.email)).await {
                tracing::warn!(error = %e, "Failed to clear lockout counter");
            }

            tracing::info!(user_id = %user.id, revoked = revoked.len(), "Password reset completed");
            Ok(())
        })
        .await
    }
}
