//! Provider sign-in: authorize, callback, registration completion, link and unlink.

use service_core::context::RequestContext;
use url::Url;
use uuid::Uuid;

use super::{to_chrono, AuthService, SessionToken};
use crate::models::outbox::{rfc3339, UserRegisteredData, USER_REGISTERED};
use crate::models::{
    ConnectionStatus, DeviceContext, NewOutboxEvent, NewUser, OAuthConnection, OAuthToken, User,
};
use crate::services::crypto::{provider_token_aad, random_token};
use crate::services::ephemeral::{CompletionRecord, OidcAuthState};
use crate::services::error::{ServiceError, ServiceResult, StoreError};
use crate::services::lockout::{oidc_authorize_identifier_key, oidc_authorize_ip_key};
use crate::services::oidc::{CodeExchange, OidcIdentity, Pkce, ProviderTokens};
use crate::utils::normalize_email;

const PLACEHOLDER_EMAIL_DOMAIN: &str = "example.invalid";

#[derive(Debug, Clone, Default)]
pub struct OidcAuthorizeRequest {
    pub provider: String,
    pub redirect_uri: String,
    /// Opaque value handed back to the client in the final redirect.
    pub client_context: String,
    pub login_hint: String,
    pub ip_address: String,
}

#[derive(Debug, Clone)]
pub struct OidcAuthorizeResponse {
    pub authorize_url: String,
    pub state: String,
}

/// Where the browser goes after the provider callback.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    SignedIn {
        redirect_url: String,
        session: SessionToken,
    },
    /// The provider gave no usable email; the client must finish registration.
    RegistrationIncomplete {
        redirect_url: String,
        user_id: Uuid,
        completion_token: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedConnection {
    pub provider: String,
    pub issuer: String,
    pub subject: String,
}

/// How the callback found its user.
struct ResolvedUser {
    user: User,
    fallback_email: bool,
}

impl AuthService {
    #[tracing::instrument(skip_all, fields(provider = %req.provider))]
    pub async fn oidc_authorize(
        &self,
        ctx: &RequestContext,
        req: OidcAuthorizeRequest,
    ) -> ServiceResult<OidcAuthorizeResponse> {
        self.observe(ctx, "oidc_authorize", self.oidc_authorize_inner(ctx, req))
            .await
    }

    async fn oidc_authorize_inner(
        &self,
        ctx: &RequestContext,
        req: OidcAuthorizeRequest,
    ) -> ServiceResult<OidcAuthorizeResponse> {
        let now = self.now();
        let provider = match req.provider.trim() {
            "" => self.settings.default_provider.clone(),
            p => p.to_lowercase(),
        };
        let login_hint = req.login_hint.trim().to_lowercase();

        if !req.ip_address.trim().is_empty() {
            self.enforce_rate_limit(
                &oidc_authorize_ip_key(req.ip_address.trim()),
                self.settings.oidc_authorize_limit,
                now,
            )
            .await?;
        }
        let identifier = if login_hint.is_empty() {
            provider.as_str()
        } else {
            login_hint.as_str()
        };
        self.enforce_rate_limit(
            &oidc_authorize_identifier_key(identifier),
            self.settings.oidc_authorize_limit,
            now,
        )
        .await?;

        self.check_redirect_uri(&req.redirect_uri)?;
        if !self.oidc.has_provider(&provider) {
            return Err(ServiceError::invalid_input(format!(
                "unknown provider: {}",
                provider
            )));
        }

        let state = random_token();
        let nonce = random_token();
        let pkce = Pkce::generate();

        let authorize_url = self
            .oidc
            .authorize_url(
                ctx,
                &provider,
                &req.redirect_uri,
                &state,
                &nonce,
                &login_hint,
                &pkce.challenge,
            )
            .await?;

        let record = OidcAuthState {
            provider: provider.clone(),
            redirect_uri: req.redirect_uri.clone(),
            nonce,
            login_hint,
            code_verifier: pkce.verifier,
            client_context: req.client_context,
            expires_at: now + to_chrono(self.settings.oidc_state_ttl),
        };
        self.ephemeral
            .put_oidc_state(&state, &record, self.settings.oidc_state_ttl)
            .await?;

        tracing::info!(provider = %provider, "OIDC authorize started");
        Ok(OidcAuthorizeResponse {
            authorize_url,
            state,
        })
    }

    /// Well-formed http(s) URI, and a member of the allow-list when one is set.
    fn check_redirect_uri(&self, redirect_uri: &str) -> ServiceResult<()> {
        let parsed = Url::parse(redirect_uri.trim())
            .map_err(|_| ServiceError::invalid_input("redirect_uri is not a valid URI"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::invalid_input(
                "redirect_uri must use http or https",
            ));
        }
        let allowed = &self.settings.allowed_redirect_uris;
        if !allowed.is_empty() && !allowed.iter().any(|u| u == redirect_uri.trim()) {
            return Err(ServiceError::invalid_input("redirect_uri is not allowed"));
        }
        Ok(())
    }

    /// Consume a state entry. Missing, replayed and expired states all fail the same way.
    async fn take_state(&self, state: &str) -> ServiceResult<OidcAuthState> {
        let record = match self.ephemeral.take_oidc_state(state).await? {
            Some(record) => record,
            None => {
                tracing::warn!("OIDC callback with unknown or replayed state");
                return Err(ServiceError::Unauthorized);
            }
        };
        if record.expires_at <= self.now() {
            tracing::warn!(provider = %record.provider, "OIDC callback with expired state");
            return Err(ServiceError::Unauthorized);
        }
        Ok(record)
    }

    async fn exchange(
        &self,
        ctx: &RequestContext,
        state: &OidcAuthState,
        code: &str,
    ) -> ServiceResult<CodeExchange> {
        let exchange = self
            .oidc
            .exchange_code(
                ctx,
                &state.provider,
                code,
                &state.redirect_uri,
                &state.code_verifier,
                &state.nonce,
                self.now(),
            )
            .await?;
        if exchange.identity.subject.trim().is_empty() {
            return Err(ServiceError::Unauthorized);
        }
        Ok(exchange)
    }

    #[tracing::instrument(skip_all)]
    pub async fn oidc_callback(
        &self,
        ctx: &RequestContext,
        code: &str,
        state: &str,
        device: DeviceContext,
    ) -> ServiceResult<CallbackOutcome> {
        self.observe(
            ctx,
            "oidc_callback",
            self.oidc_callback_inner(ctx, code, state, device),
        )
        .await
    }

    async fn oidc_callback_inner(
        &self,
        ctx: &RequestContext,
        code: &str,
        state: &str,
        device: DeviceContext,
    ) -> ServiceResult<CallbackOutcome> {
        let (code, state) = (code.trim(), state.trim());
        if code.is_empty() || state.is_empty() {
            return Err(ServiceError::invalid_input("code and state are required"));
        }

        let auth_state = self.take_state(state).await?;
        let CodeExchange { identity, tokens } = self.exchange(ctx, &auth_state, code).await?;

        let resolved = self.resolve_oidc_user(&identity).await?;
        let user = resolved.user;
        if !user.can_authenticate() {
            tracing::warn!(user_id = %user.id, "OIDC sign-in for inactive user");
            return Err(ServiceError::Unauthorized);
        }

        let now = self.now();
        let is_first_link = self.oauth.list_active_connections(user.id).await?.is_empty();
        self.oauth
            .upsert_connection(&OAuthConnection {
                issuer: identity.issuer.clone(),
                subject: identity.subject.clone(),
                user_id: user.id,
                provider: identity.provider.clone(),
                email: identity.email.clone(),
                status: ConnectionStatus::Active.as_str().to_string(),
                is_primary: is_first_link,
                linked_at: now,
                last_login_at: Some(now),
            })
            .await?;
        tracing::info!(
            user_id = %user.id,
            issuer = %identity.issuer,
            subject = %identity.subject,
            primary = is_first_link,
            "OIDC connection linked"
        );

        self.store_provider_tokens(user.id, &identity.provider, &tokens)
            .await?;

        let mut fragment: Vec<(&str, String)> = Vec::new();
        let outcome = if resolved.fallback_email {
            let completion_token = random_token();
            self.ephemeral
                .put_completion(
                    &completion_token,
                    &CompletionRecord {
                        user_id: user.id,
                        email: user.email.clone(),
                        role: user.role_name.clone(),
                        expires_at: now + to_chrono(self.settings.completion_token_ttl),
                    },
                    self.settings.completion_token_ttl,
                )
                .await?;

            fragment.push(("registration_incomplete", "true".to_string()));
            fragment.push(("completion_token", completion_token.clone()));
            append_client_context(&mut fragment, &auth_state.client_context);
            CallbackOutcome::RegistrationIncomplete {
                redirect_url: with_fragment(&auth_state.redirect_uri, &fragment)?,
                user_id: user.id,
                completion_token,
            }
        } else {
            let session = self.issue_session(&user, &device, now).await?;
            fragment.push(("token", session.token.clone()));
            fragment.push(("session_id", session.session_id.to_string()));
            fragment.push(("user_id", user.id.to_string()));
            append_client_context(&mut fragment, &auth_state.client_context);
            CallbackOutcome::SignedIn {
                redirect_url: with_fragment(&auth_state.redirect_uri, &fragment)?,
                session,
            }
        };
        Ok(outcome)
    }

    /// Connection first, then a verified email, then a new account.
    async fn resolve_oidc_user(&self, identity: &OidcIdentity) -> ServiceResult<ResolvedUser> {
        if let Some(connection) = self
            .oauth
            .get_connection(&identity.issuer, &identity.subject)
            .await?
        {
            if connection.status() == ConnectionStatus::Revoked {
                tracing::warn!(
                    issuer = %identity.issuer,
                    subject = %identity.subject,
                    "OIDC sign-in through an unlinked connection"
                );
                return Err(ServiceError::Unauthorized);
            }
            let user = self
                .users
                .get_by_id(connection.user_id)
                .await?
                .ok_or(ServiceError::Unauthorized)?;
            return Ok(ResolvedUser {
                user,
                fallback_email: false,
            });
        }

        let may_link_by_email = self.settings.allow_email_linking
            && identity.email_verified
            && !identity.email.is_empty();
        if may_link_by_email {
            if let Some(user) = self.users.get_by_email(&identity.email).await? {
                tracing::info!(user_id = %user.id, issuer = %identity.issuer, "OIDC identity matched by verified email");
                return Ok(ResolvedUser {
                    user,
                    fallback_email: false,
                });
            }
        }

        let verified_email = identity
            .email_verified
            .then(|| normalize_email(&identity.email).ok())
            .flatten();
        let fallback_email = verified_email.is_none();
        let email = verified_email.unwrap_or_else(|| placeholder_email(&identity.subject));

        match self.create_oidc_user(&email, !fallback_email).await {
            Ok(user) => Ok(ResolvedUser {
                user,
                fallback_email,
            }),
            Err(ServiceError::Conflict(_)) if may_link_by_email && !fallback_email => {
                // Lost a race with another sign-in for the same email
                let user = self
                    .users
                    .get_by_email(&email)
                    .await?
                    .ok_or(ServiceError::Unauthorized)?;
                Ok(ResolvedUser {
                    user,
                    fallback_email: false,
                })
            }
            Err(ServiceError::Conflict(_)) => Err(ServiceError::Conflict(
                "an account with this email already exists".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn create_oidc_user(&self, email: &str, email_verified: bool) -> ServiceResult<User> {
        let now = self.now();
        let role = self
            .users
            .resolve_role(&self.settings.default_role)
            .await?
            .ok_or_else(|| ServiceError::internal("default role is missing"))?;

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
                    password_hash: None,
                    role,
                    email_verified,
                    created_at: now,
                },
                Some(event),
            )
            .await
            .map_err(|e| match e {
                StoreError::Conflict(msg) => ServiceError::Conflict(msg),
                other => other.into(),
            })?;

        tracing::info!(user_id = %user.id, placeholder = !email_verified, "User registered through OIDC");
        Ok(user)
    }

    /// Tokens are sealed with an AAD naming the user, provider and token kind.
    async fn store_provider_tokens(
        &self,
        user_id: Uuid,
        provider: &str,
        tokens: &ProviderTokens,
    ) -> ServiceResult<()> {
        let access = self
            .cipher
            .seal_str(
                &tokens.access_token,
                &provider_token_aad(user_id, provider, "access"),
            )
            .map_err(ServiceError::Internal)?;
        let refresh = match tokens.refresh_token.as_deref() {
            Some(rt) if !rt.is_empty() => Some(
                self.cipher
                    .seal_str(rt, &provider_token_aad(user_id, provider, "refresh"))
                    .map_err(ServiceError::Internal)?,
            ),
            _ => None,
        };

        self.oauth
            .upsert_token(&OAuthToken {
                user_id,
                provider: provider.to_string(),
                access_token_encrypted: access,
                refresh_token_encrypted: refresh,
                expires_at: tokens.expires_at,
                updated_at: self.now(),
            })
            .await?;
        Ok(())
    }

    /// Trade a single-use completion token for a session.
    #[tracing::instrument(skip_all)]
    pub async fn register_complete(
        &self,
        ctx: &RequestContext,
        completion_token: &str,
        device: DeviceContext,
    ) -> ServiceResult<SessionToken> {
        self.observe(ctx, "register_complete", async {
            let completion_token = completion_token.trim();
            if completion_token.is_empty() {
                return Err(ServiceError::invalid_input("completion_token is required"));
            }
            let now = self.now();
            let record = self
                .ephemeral
                .take_completion(completion_token)
                .await?
                .ok_or(ServiceError::Unauthorized)?;
            if record.expires_at <= now {
                return Err(ServiceError::Unauthorized);
            }

            let user = self.load_active_user(record.user_id).await?;
            self.issue_session(&user, &device, now).await
        })
        .await
    }

    /// Attach another provider identity to a signed-in user.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn link_oidc(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        code: &str,
        state: &str,
    ) -> ServiceResult<LinkedConnection> {
        self.observe(ctx, "link_oidc", async {
            let (code, state) = (code.trim(), state.trim());
            if code.is_empty() || state.is_empty() {
                return Err(ServiceError::invalid_input("code and state are required"));
            }
            let user = self.load_active_user(user_id).await?;
            let auth_state = self.take_state(state).await?;
            let CodeExchange { identity, tokens } = self.exchange(ctx, &auth_state, code).await?;

            if let Some(existing) = self
                .oauth
                .get_connection(&identity.issuer, &identity.subject)
                .await?
            {
                if existing.user_id != user.id {
                    return Err(ServiceError::Conflict(
                        "identity is linked to another account".to_string(),
                    ));
                }
            }

            let now = self.now();
            self.oauth
                .upsert_connection(&OAuthConnection {
                    issuer: identity.issuer.clone(),
                    subject: identity.subject.clone(),
                    user_id: user.id,
                    provider: identity.provider.clone(),
                    email: identity.email.clone(),
                    status: ConnectionStatus::Active.as_str().to_string(),
                    is_primary: false,
                    linked_at: now,
                    last_login_at: None,
                })
                .await?;
            self.store_provider_tokens(user.id, &identity.provider, &tokens)
                .await?;

            tracing::info!(
                user_id = %user.id,
                issuer = %identity.issuer,
                subject = %identity.subject,
                "OIDC connection linked"
            );
            Ok(LinkedConnection {
                provider: identity.provider,
                issuer: identity.issuer,
                subject: identity.subject,
            })
        })
        .await
    }

    /// Detach a provider identity, keeping at least one way to sign in.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn unlink_oidc(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        issuer: &str,
        subject: &str,
    ) -> ServiceResult<()> {
        self.observe(ctx, "unlink_oidc", async {
            let user = self.load_active_user(user_id).await?;
            let connection = self
                .oauth
                .get_connection(issuer, subject)
                .await?
                .filter(|c| c.user_id == user.id && c.is_active())
                .ok_or_else(|| ServiceError::NotFound("connection not found".to_string()))?;

            let active = self.oauth.list_active_connections(user.id).await?;
            if !user.has_password() && active.len() <= 1 {
                return Err(ServiceError::CannotUnlinkLastMethod);
            }

            self.oauth
                .set_connection_status(
                    &connection.issuer,
                    &connection.subject,
                    ConnectionStatus::Revoked,
                )
                .await?;
            let provider_still_linked = active.iter().any(|c| {
                c.provider == connection.provider
                    && (c.issuer != connection.issuer || c.subject != connection.subject)
            });
            if !provider_still_linked {
                self.oauth.delete_token(user.id, &connection.provider).await?;
            }
            tracing::info!(
                user_id = %user.id,
                issuer = %connection.issuer,
                subject = %connection.subject,
                "OIDC connection unlinked"
            );
            Ok(())
        })
        .await
    }
}

/// `oidc-<first 12 chars of subject>@example.invalid`
fn placeholder_email(subject: &str) -> String {
    let prefix: String = subject
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(12)
        .collect::<String>()
        .to_lowercase();
    format!("oidc-{}@{}", prefix, PLACEHOLDER_EMAIL_DOMAIN)
}

fn append_client_context(fragment: &mut Vec<(&str, String)>, client_context: &str) {
    if !client_context.is_empty() {
        fragment.push(("client_context", client_context.to_string()));
    }
}

/// Tokens go in the fragment so they never reach server access logs.
fn with_fragment(redirect_uri: &str, pairs: &[(&str, String)]) -> ServiceResult<String> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| ServiceError::internal(format!("stored redirect_uri is invalid: {}", e)))?;
    let encoded = serde_urlencoded::to_string(pairs)
        .map_err(|e| ServiceError::internal(format!("fragment encoding failed: {}", e)))?;
    url.set_fragment(Some(&encoded));
    Ok(url.into())
}
