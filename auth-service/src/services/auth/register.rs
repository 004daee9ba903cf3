use service_core::context::RequestContext;
use uuid::Uuid;

use super::AuthService;
use crate::models::outbox::{rfc3339, UserRegisteredData, USER_REGISTERED};
use crate::models::{NewOutboxEvent, NewUser, Role};
use crate::services::ephemeral::{request_fingerprint, IdempotencyOutcome};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::lockout::{register_identifier_key, register_ip_key};
use crate::utils::{normalize_email, validate_password, Password};

/// Provider sign-in fields older clients still send to Register.
#[derive(Debug, Clone, Default)]
pub struct LegacyOidcFields {
    pub provider: String,
    pub code: String,
    pub redirect_uri: String,
    pub nonce: String,
    pub code_verifier: String,
}

impl LegacyOidcFields {
    pub fn is_present(&self) -> bool {
        [
            &self.provider,
            &self.code,
            &self.redirect_uri,
            &self.nonce,
            &self.code_verifier,
        ]
        .iter()
        .any(|f| !f.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub email: String,
    pub password: Password,
    pub role: String,
    pub terms_accepted: bool,
    pub idempotency_key: Option<String>,
    pub ip_address: String,
    pub legacy_oidc: LegacyOidcFields,
}

impl AuthService {
    /// Create a password account and announce it with `user.registered`.
    #[tracing::instrument(skip_all, fields(ip = %req.ip_address))]
    pub async fn register(&self, ctx: &RequestContext, req: RegisterRequest) -> ServiceResult<Uuid> {
        self.observe(ctx, "register", self.register_inner(req))
            .await
    }

    async fn register_inner(&self, req: RegisterRequest) -> ServiceResult<Uuid> {
        let now = self.now();

        if req.legacy_oidc.is_present() {
            tracing::warn!(
                provider = %req.legacy_oidc.provider,
                "Register called with provider sign-in fields"
            );
            if self.settings.reject_legacy_oidc_register {
                return Err(ServiceError::OidcFlowRequired);
            }
        }

        let email = normalize_email(&req.email).map_err(ServiceError::InvalidInput)?;

        if !req.ip_address.trim().is_empty() {
            self.enforce_rate_limit(
                &register_ip_key(req.ip_address.trim()),
                self.settings.register_limit,
                now,
            )
            .await?;
        }
        self.enforce_rate_limit(
            &register_identifier_key(&email),
            self.settings.register_limit,
            now,
        )
        .await?;

        if !req.terms_accepted {
            return Err(ServiceError::invalid_input("terms must be accepted"));
        }
        validate_password(req.password.as_str()).map_err(ServiceError::InvalidInput)?;

        let role = self.resolve_registration_role(&req.role).await?;

        // Reserve the idempotency key before doing any work
        let idempotency_key = req
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        // The password only enters the digest salted with the key, never in clear
        let fingerprint = request_fingerprint(&[
            idempotency_key.unwrap_or_default(),
            &email,
            &role.name,
            "terms",
            req.password.as_str(),
        ]);
        if let Some(key) = idempotency_key {
            match self
                .ephemeral
                .reserve_idempotency(key, &fingerprint, self.settings.idempotency_ttl)
                .await?
            {
                IdempotencyOutcome::Reserved => {}
                IdempotencyOutcome::Replay(user_id) => {
                    tracing::info!(user_id = %user_id, "Replayed idempotent registration");
                    return Ok(user_id);
                }
                IdempotencyOutcome::Conflict => return Err(ServiceError::IdempotencyConflict),
            }
        }

        let created = self.create_password_user(&email, &req.password, role).await;

        match (idempotency_key, &created) {
            (Some(key), Ok(user_id)) => {
                self.ephemeral
                    .complete_idempotency(key, &fingerprint, *user_id, self.settings.idempotency_ttl)
                    .await?;
            }
            (Some(key), Err(_)) => {
                if let Err(e) = self.ephemeral.release_idempotency(key).await {
                    tracing::warn!(error = %e, "Failed to release idempotency key");
                }
            }
            (None, _) => {}
        }

        created
    }

    async fn create_password_user(
        &self,
        email: &str,
        password: &Password,
        role: Role,
    ) -> ServiceResult<Uuid> {
        let now = self.now();

        let password_hash = self.hasher.hash(password).map_err(|e| {
            ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e))
        })?;

        // The id is known before insert so the event can carry it
        let user_id = Uuid::new_v4();
        let event = NewOutboxEvent::envelope(
            USER_REGISTERED,
            "data.email",
            email,
            &UserRegisteredData {
                user_id,
                email: email.to_string(),
                registered_at: rfc3339(now),
            },
            now,
        )
        .map_err(|e| ServiceError::Internal(e.into()))?;

        let user = self
            .users
            .create_with_outbox(
                NewUser {
                    id: user_id,
                    email: email.to_string(),
                    password_hash: Some(password_hash.into_string()),
                    role,
                    email_verified: false,
                    created_at: now,
                },
                Some(event),
            )
            .await
            .map_err(|e| match ServiceError::from(e) {
                ServiceError::Conflict(_) => {
                    ServiceError::Conflict("email already registered".to_string())
                }
                other => other,
            })?;

        tracing::info!(user_id = %user.id, role = %user.role_name, "User registered");
        Ok(user.id)
    }

    /// Empty picks the default role; anything else must be self-assignable.
    async fn resolve_registration_role(&self, requested: &str) -> ServiceResult<Role> {
        let requested = requested.trim();
        let name = if requested.is_empty() {
            self.settings.default_role.as_str()
        } else {
            requested
        };

        let role = self
            .users
            .resolve_role(name)
            .await?
            .ok_or_else(|| ServiceError::invalid_input(format!("unknown role: {}", name)))?;

        let is_default = role.name.eq_ignore_ascii_case(&self.settings.default_role);
        if !role.self_assignable && !is_default {
            return Err(ServiceError::invalid_input(format!(
                "role {} cannot be chosen at registration",
                role.name
            )));
        }
        Ok(role)
    }
}
