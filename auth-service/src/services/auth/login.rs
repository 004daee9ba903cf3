use service_core::context::RequestContext;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, TOTP};
use uuid::Uuid;

use super::{to_chrono, AuthService, SessionToken};
use crate::models::mfa::{challenge_order, hash_backup_code};
use crate::models::outbox::{rfc3339, TwoFactorRequiredData, TWO_FACTOR_REQUIRED};
use crate::models::{DeviceContext, LoginAttempt, MfaMethodKind, NewOutboxEvent, User};
use crate::services::crypto::{numeric_code, random_token, totp_secret_aad};
use crate::services::ephemeral::MfaChallenge;
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::lockout::{login_key, mfa_key, LimitPolicy};
use crate::utils::{normalize_email, Password, PasswordHashString};

const MFA_CODE_DIGITS: u32 = 6;

#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub email: String,
    pub password: Password,
    pub device: DeviceContext,
}

/// A password login either finishes or hands back a second-factor challenge.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    TwoFactorRequired { temp_token: String },
    Authenticated(SessionToken),
}

#[derive(Debug, Clone, Default)]
pub struct VerifyTwoFactorRequest {
    pub temp_token: String,
    pub code: String,
    /// Optional; must match the challenged method when set.
    pub method: String,
    pub device: DeviceContext,
}

impl AuthService {
    #[tracing::instrument(skip_all)]
    pub async fn login(&self, ctx: &RequestContext, req: LoginRequest) -> ServiceResult<LoginOutcome> {
        self.observe(ctx, "login", self.login_inner(req)).await
    }

    async fn login_inner(&self, req: LoginRequest) -> ServiceResult<LoginOutcome> {
        let now = self.now();
        let email = normalize_email(&req.email).map_err(ServiceError::InvalidInput)?;
        let key = login_key(&email);

        // Locked accounts pay for a hash too, so timing matches the unknown-user path
        match self.lockout.state(&key).await {
            Ok(state) if state.is_locked(now) => {
                self.hasher.verify_dummy(&req.password);
                self.record_attempt(LoginAttempt::failed(None, "account_locked", &req.device, now))
                    .await;
                return Err(ServiceError::AccountLocked {
                    retry_after: state.retry_after(now),
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Lockout check failed, continuing"),
        }

        let user = match self.users.get_by_email(&email).await? {
            Some(user) if user.can_authenticate() && user.has_password() => user,
            other => {
                self.hasher.verify_dummy(&req.password);
                let reason = match &other {
                    None => "unknown_user",
                    Some(u) if !u.can_authenticate() => "inactive_user",
                    Some(_) => "no_password",
                };
                self.record_attempt(LoginAttempt::failed(
                    other.map(|u| u.id),
                    reason,
                    &req.device,
                    now,
                ))
                .await;
                return Err(ServiceError::InvalidCredentials);
            }
        };

        let stored = PasswordHashString::new(user.password_hash.clone().unwrap_or_default());
        if self.hasher.verify(&req.password, &stored).is_err() {
            self.record_attempt(LoginAttempt::failed(
                Some(user.id),
                "invalid_password",
                &req.device,
                now,
            ))
            .await;

            return match self
                .lockout
                .record_failure(&key, self.settings.login_lockout, now)
                .await
            {
                Ok(state) if state.is_locked(now) => Err(ServiceError::AccountLocked {
                    retry_after: state.retry_after(now),
                }),
                Ok(_) => Err(ServiceError::InvalidCredentials),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to count login failure");
                    Err(ServiceError::InvalidCredentials)
                }
            };
        }

        if let Err(e) = self.lockout.clear(&key).await {
            tracing::warn!(error = %e, "Failed to clear lockout counter");
        }

        let mut methods = self.mfa.list_enabled_methods(user.id).await?;
        methods.sort_by(challenge_order);
        if let Some(method) = methods.first() {
            let temp_token = self.start_challenge(&user, method.kind).await?;
            return Ok(LoginOutcome::TwoFactorRequired { temp_token });
        }

        let session = self.issue_session(&user, &req.device, now).await?;
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Store a challenge under a fresh temp token and announce it.
    async fn start_challenge(&self, user: &User, kind: MfaMethodKind) -> ServiceResult<String> {
        let now = self.now();
        let temp_token = random_token();
        let challenge = MfaChallenge {
            user_id: user.id,
            email: user.email.clone(),
            role: user.role_name.clone(),
            method: kind.as_str().to_string(),
            code: numeric_code(MFA_CODE_DIGITS),
            expires_at: now + to_chrono(self.settings.mfa_challenge_ttl),
        };
        self.ephemeral
            .put_mfa_challenge(&temp_token, &challenge, self.settings.mfa_challenge_ttl)
            .await?;

        let event = NewOutboxEvent::envelope(
            TWO_FACTOR_REQUIRED,
            "data.user_id",
            &user.id.to_string(),
            &TwoFactorRequiredData {
                user_id: user.id,
                method: kind.as_str().to_string(),
                requested_at: rfc3339(now),
            },
            now,
        )
        .map_err(|e| ServiceError::Internal(e.into()))?;
        self.outbox.enqueue(event).await?;

        tracing::info!(user_id = %user.id, method = %kind, "Second factor required");
        Ok(temp_token)
    }

    #[tracing::instrument(skip_all)]
    pub async fn verify_two_factor(
        &self,
        ctx: &RequestContext,
        req: VerifyTwoFactorRequest,
    ) -> ServiceResult<SessionToken> {
        self.observe(ctx, "verify_2fa", self.verify_two_factor_inner(req))
            .await
    }

    async fn verify_two_factor_inner(
        &self,
        req: VerifyTwoFactorRequest,
    ) -> ServiceResult<SessionToken> {
        let now = self.now();
        let temp_token = req.temp_token.trim();
        let code = req.code.trim();
        if temp_token.is_empty() || code.is_empty() {
            return Err(ServiceError::invalid_input("temp_token and code are required"));
        }

        let challenge = self
            .ephemeral
            .get_mfa_challenge(temp_token)
            .await?
            .ok_or(ServiceError::Unauthorized)?;
        if challenge.expires_at <= now {
            self.ephemeral.delete_mfa_challenge(temp_token).await?;
            return Err(ServiceError::TokenExpired);
        }

        let challenged: MfaMethodKind = challenge
            .method
            .parse()
            .map_err(|e: String| ServiceError::Internal(anyhow::anyhow!(e)))?;
        if !req.method.trim().is_empty() {
            let requested: MfaMethodKind =
                req.method.parse().map_err(ServiceError::InvalidInput)?;
            if requested != challenged {
                return Err(ServiceError::invalid_input(
                    "method does not match the challenge",
                ));
            }
        }

        let guard_key = mfa_key(temp_token);
        let guard = LimitPolicy::new(
            self.settings.mfa_max_verify_attempts,
            self.settings.mfa_challenge_ttl,
        );

        if !self.second_factor_matches(&challenge, challenged, code).await? {
            let locked = match self.lockout.record_failure(&guard_key, guard, now).await {
                Ok(state) => state.is_locked(now),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to count second-factor failure");
                    false
                }
            };
            if locked {
                tracing::warn!(user_id = %challenge.user_id, "Too many second-factor attempts, challenge dropped");
                self.ephemeral.delete_mfa_challenge(temp_token).await?;
                return Err(ServiceError::Unauthorized);
            }
            return Err(ServiceError::InvalidCredentials);
        }

        // Whoever takes the challenge first owns it
        if self.ephemeral.take_mfa_challenge(temp_token).await?.is_none() {
            return Err(ServiceError::Unauthorized);
        }
        if let Err(e) = self.lockout.clear(&guard_key).await {
            tracing::warn!(error = %e, "Failed to clear second-factor counter");
        }

        let user = self.load_active_user(challenge.user_id).await?;
        self.issue_session(&user, &req.device, now).await
    }

    /// Challenge code, then authenticator code, then a one-shot backup code.
    async fn second_factor_matches(
        &self,
        challenge: &MfaChallenge,
        method: MfaMethodKind,
        code: &str,
    ) -> ServiceResult<bool> {
        if bool::from(code.as_bytes().ct_eq(challenge.code.as_bytes())) {
            return Ok(true);
        }

        if method == MfaMethodKind::AuthenticatorApp
            && self.authenticator_code_matches(challenge.user_id, code).await?
        {
            return Ok(true);
        }

        let consumed = self
            .mfa
            .consume_backup_code(challenge.user_id, &hash_backup_code(code), self.now())
            .await?;
        if consumed {
            tracing::info!(user_id = %challenge.user_id, "Backup code consumed");
        }
        Ok(consumed)
    }

    async fn authenticator_code_matches(&self, user_id: Uuid, code: &str) -> ServiceResult<bool> {
        let Some(record) = self.mfa.get_totp_secret(user_id).await? else {
            return Ok(false);
        };
        if record.deactivated {
            return Ok(false);
        }

        let secret = self
            .cipher
            .open(&record.secret_encrypted, &totp_secret_aad(user_id))
            .map_err(ServiceError::Internal)?;
        let totp = authenticator(secret, None, user_id.to_string())?;
        let now = self.now().timestamp().max(0) as u64;
        Ok(totp.check(code, now))
    }
}

/// RFC 6238 parameters shared by enrolment and verification.
pub(super) fn authenticator(
    secret: Vec<u8>,
    issuer: Option<String>,
    account_name: String,
) -> ServiceResult<TOTP> {
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, issuer, account_name)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Invalid authenticator secret: {}", e)))
}
