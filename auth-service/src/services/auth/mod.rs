//! The authentication orchestrator.
//!
//! `AuthService` composes the stores, the signer, the OIDC verifier, the
//! lockout engine and the ephemeral state into the user-facing operations.
//! Every public operation takes a [`RequestContext`]; the whole operation runs
//! under it, so a deadline or cancellation drops all in-flight downstream calls.

mod login;
mod mfa;
mod oidc_flow;
mod password;
mod register;
mod session;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use service_core::auth::SessionClaims;
use service_core::context::RequestContext;
use uuid::Uuid;

use super::clock::Clock;
use super::crypto::SecretCipher;
use super::ephemeral::EphemeralState;
use super::error::{ServiceError, ServiceResult};
use super::jwt::JwtService;
use super::lockout::{LimitPolicy, LockoutEngine, RateDecision};
use super::metrics;
use super::oidc::OidcVerifier;
use super::store::{
    LoginAttemptStore, MfaStore, OAuthStore, OutboxStore, SessionStore, UserStore,
};
use crate::config::AuthConfig;
use crate::models::{DeviceContext, LoginAttempt, Session, User};
use crate::utils::CredentialHasher;

pub use login::{LoginOutcome, LoginRequest, VerifyTwoFactorRequest};
pub use mfa::EnrolledAuthenticator;
pub use oidc_flow::{
    CallbackOutcome, LinkedConnection, OidcAuthorizeRequest, OidcAuthorizeResponse,
};
pub use register::{LegacyOidcFields, RegisterRequest};

/// Every collaborator the orchestrator needs, listed explicitly.
pub struct AuthDeps {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub mfa: Arc<dyn MfaStore>,
    pub oauth: Arc<dyn OAuthStore>,
    pub login_attempts: Arc<dyn LoginAttemptStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub ephemeral: EphemeralState,
    pub lockout: LockoutEngine,
    pub jwt: JwtService,
    pub hasher: CredentialHasher,
    pub oidc: OidcVerifier,
    pub cipher: SecretCipher,
    pub clock: Clock,
}

/// Policy knobs, resolved once from [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub token_ttl: Duration,
    pub session_ttl: Duration,
    pub session_absolute_ttl: Duration,
    pub login_lockout: LimitPolicy,
    pub register_limit: LimitPolicy,
    pub oidc_authorize_limit: LimitPolicy,
    pub mfa_max_verify_attempts: u32,
    pub mfa_challenge_ttl: Duration,
    pub oidc_state_ttl: Duration,
    pub completion_token_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub password_reset_ttl: Duration,
    pub allow_email_linking: bool,
    pub allowed_redirect_uris: Vec<String>,
    pub default_role: String,
    pub default_provider: String,
    pub reject_legacy_oidc_register: bool,
    /// Issuer label shown by authenticator apps.
    pub totp_issuer: String,
}

impl AuthSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            token_ttl: config.tokens.token_ttl,
            session_ttl: config.tokens.session_ttl,
            session_absolute_ttl: config.tokens.session_absolute_ttl,
            login_lockout: LimitPolicy::new(
                config.lockout.failed_login_threshold,
                config.lockout.lockout_duration,
            ),
            register_limit: LimitPolicy::new(
                config.lockout.register_rate_limit_max,
                config.lockout.register_rate_limit_window,
            ),
            oidc_authorize_limit: LimitPolicy::new(
                config.lockout.oidc_authorize_rate_limit_max,
                config.lockout.oidc_authorize_rate_limit_window,
            ),
            mfa_max_verify_attempts: config.lockout.mfa_max_verify_attempts,
            completion_token_ttl: config.oidc.completion_token_ttl,
            password_reset_ttl: config.security.password_reset_ttl,
            allow_email_linking: config.oidc.allow_email_linking,
            allowed_redirect_uris: config.oidc.allowed_redirect_uris.clone(),
            default_role: config.security.default_role.clone(),
            reject_legacy_oidc_register: config.security.reject_legacy_oidc_register,
            ..Self::default()
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(24 * 3600),
            session_ttl: Duration::from_secs(30 * 24 * 3600),
            session_absolute_ttl: Duration::from_secs(90 * 24 * 3600),
            login_lockout: LimitPolicy::new(5, Duration::from_secs(30 * 60)),
            register_limit: LimitPolicy::new(10, Duration::from_secs(3600)),
            oidc_authorize_limit: LimitPolicy::new(20, Duration::from_secs(600)),
            mfa_max_verify_attempts: 5,
            mfa_challenge_ttl: Duration::from_secs(5 * 60),
            oidc_state_ttl: Duration::from_secs(10 * 60),
            completion_token_ttl: Duration::from_secs(10 * 60),
            idempotency_ttl: Duration::from_secs(7 * 24 * 3600),
            password_reset_ttl: Duration::from_secs(30 * 60),
            allow_email_linking: true,
            allowed_redirect_uris: Vec::new(),
            default_role: "USER".to_string(),
            default_provider: "google".to_string(),
            reject_legacy_oidc_register: true,
            totp_issuer: "micros".to_string(),
        }
    }
}

/// A freshly issued session and its signed token.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub session_id: Uuid,
    pub user_id: Uuid,
    /// Token lifetime in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub token: String,
    pub expires_in: i64,
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    mfa: Arc<dyn MfaStore>,
    oauth: Arc<dyn OAuthStore>,
    login_attempts: Arc<dyn LoginAttemptStore>,
    outbox: Arc<dyn OutboxStore>,
    ephemeral: EphemeralState,
    lockout: LockoutEngine,
    jwt: JwtService,
    hasher: CredentialHasher,
    oidc: OidcVerifier,
    cipher: SecretCipher,
    clock: Clock,
    settings: AuthSettings,
}

impl AuthService {
    pub fn new(deps: AuthDeps, settings: AuthSettings) -> Self {
        Self {
            users: deps.users,
            sessions: deps.sessions,
            mfa: deps.mfa,
            oauth: deps.oauth,
            login_attempts: deps.login_attempts,
            outbox: deps.outbox,
            ephemeral: deps.ephemeral,
            lockout: deps.lockout,
            jwt: deps.jwt,
            hasher: deps.hasher,
            oidc: deps.oidc,
            cipher: deps.cipher,
            clock: deps.clock,
            settings,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Run one operation under the request context and record its outcome.
    async fn observe<T, F>(
        &self,
        ctx: &RequestContext,
        operation: &'static str,
        fut: F,
    ) -> ServiceResult<T>
    where
        F: Future<Output = ServiceResult<T>>,
    {
        let result = match ctx.run(fut).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok(_) => metrics::record_operation(operation, "success"),
            Err(e) => {
                metrics::record_operation(operation, e.kind());
                match e {
                    ServiceError::Internal(inner) => {
                        tracing::error!(operation, error = ?inner, "Operation failed")
                    }
                    ServiceError::Upstream(msg) => {
                        tracing::warn!(operation, error = %msg, "Upstream failure")
                    }
                    _ => tracing::info!(operation, outcome = e.kind(), "Operation rejected"),
                }
            }
        }
        result
    }

    /// Apply a rate limit, mapping a hit over the threshold to `rate_limited`.
    async fn enforce_rate_limit(
        &self,
        key: &str,
        policy: LimitPolicy,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        match self.lockout.hit(key, policy, now).await {
            RateDecision::Allowed => Ok(()),
            RateDecision::Limited { retry_after } => {
                tracing::warn!(key = %key, "Rate limit exceeded");
                Err(ServiceError::RateLimited { retry_after })
            }
        }
    }

    /// Create a session for `user` and sign its first token.
    async fn issue_session(
        &self,
        user: &User,
        device: &DeviceContext,
        now: DateTime<Utc>,
    ) -> ServiceResult<SessionToken> {
        let session = Session::new(user.id, device, now, to_chrono(self.settings.session_ttl));
        self.sessions.create(&session).await?;

        let exp = now + to_chrono(self.settings.token_ttl);
        let token = self.sign(user, session.id, now, exp)?;

        self.record_attempt(LoginAttempt::succeeded(user.id, device, now))
            .await;

        tracing::info!(user_id = %user.id, session_id = %session.id, "Session issued");

        Ok(SessionToken {
            token,
            session_id: session.id,
            user_id: user.id,
            expires_in: (exp - now).num_seconds(),
        })
    }

    fn sign(
        &self,
        user: &User,
        session_id: Uuid,
        iat: DateTime<Utc>,
        exp: DateTime<Utc>,
    ) -> ServiceResult<String> {
        let claims = SessionClaims {
            user_id: user.id.to_string(),
            email: user.email.clone(),
            role: user.role_name.clone(),
            session_id: session_id.to_string(),
            iat: iat.timestamp(),
            exp: exp.timestamp(),
        };
        self.jwt.sign(&claims).map_err(ServiceError::Internal)
    }

    /// Login attempts are an audit trail; a failed write never fails the login.
    async fn record_attempt(&self, attempt: LoginAttempt) {
        if let Err(e) = self.login_attempts.record(&attempt).await {
            tracing::warn!(error = %e, status = attempt.status.as_str(), "Failed to record login attempt");
        }
    }

    /// Revoke the given sessions' tokens in the ephemeral store.
    async fn flag_sessions_revoked(&self, session_ids: &[Uuid]) -> ServiceResult<()> {
        for session_id in session_ids {
            self.ephemeral
                .flag_revoked(*session_id, self.settings.token_ttl)
                .await?;
        }
        Ok(())
    }

    async fn load_active_user(&self, user_id: Uuid) -> ServiceResult<User> {
        match self.users.get_by_id(user_id).await? {
            Some(user) if user.can_authenticate() => Ok(user),
            _ => Err(ServiceError::Unauthorized),
        }
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub(crate) fn parse_uuid(raw: &str) -> ServiceResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ServiceError::Unauthorized)
}
