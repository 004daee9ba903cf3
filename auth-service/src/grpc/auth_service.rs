//! gRPC implementation of `micros.auth.v1.AuthService`.
//!
//! Each call derives its [`RequestContext`] from the `grpc-timeout` header,
//! converts the message into orchestrator types and maps the result back.

use std::sync::Arc;

use service_core::context::RequestContext;
use tonic::{Request, Response, Status};

use super::caller::{authenticated_user, bearer_token, device_context, peer_ip, status};
use super::proto::auth::{self as pb, auth_service_server::AuthService as AuthRpc};
use crate::services::auth::{
    CallbackOutcome, LegacyOidcFields, LoginOutcome, LoginRequest, OidcAuthorizeRequest,
    RegisterRequest, VerifyTwoFactorRequest,
};
use crate::services::{AuthService, SessionToken};
use crate::utils::Password;

pub struct AuthServiceImpl {
    auth: Arc<AuthService>,
}

impl AuthServiceImpl {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }
}

fn session_response(session: SessionToken) -> pb::SessionTokenResponse {
    pb::SessionTokenResponse {
        token: session.token,
        session_id: session.session_id.to_string(),
        user_id: session.user_id.to_string(),
        expires_in: session.expires_in,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[tonic::async_trait]
impl AuthRpc for AuthServiceImpl {
    async fn register(
        &self,
        request: Request<pb::RegisterRequest>,
    ) -> Result<Response<pb::RegisterResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let fallback_ip = peer_ip(&request);
        let idempotency_header = request
            .metadata()
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let req = request.into_inner();

        let user_id = self
            .auth
            .register(
                &ctx,
                RegisterRequest {
                    email: req.email,
                    password: Password::new(req.password),
                    role: req.role,
                    terms_accepted: req.terms_accepted,
                    idempotency_key: non_empty(req.idempotency_key)
                        .or_else(|| idempotency_header.and_then(non_empty)),
                    ip_address: non_empty(req.ip_address).unwrap_or(fallback_ip),
                    legacy_oidc: LegacyOidcFields {
                        provider: req.provider,
                        code: req.code,
                        redirect_uri: req.redirect_uri,
                        nonce: req.nonce,
                        code_verifier: req.code_verifier,
                    },
                },
            )
            .await
            .map_err(status)?;

        Ok(Response::new(pb::RegisterResponse {
            user_id: user_id.to_string(),
        }))
    }

    async fn login(
        &self,
        request: Request<pb::LoginRequest>,
    ) -> Result<Response<pb::LoginResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let device = device_context(&request, request.get_ref().device.as_ref());
        let req = request.into_inner();

        let outcome = self
            .auth
            .login(
                &ctx,
                LoginRequest {
                    email: req.email,
                    password: Password::new(req.password),
                    device,
                },
            )
            .await
            .map_err(status)?;

        let response = match outcome {
            LoginOutcome::TwoFactorRequired { temp_token } => pb::LoginResponse {
                requires_2fa: true,
                temp_token,
                ..Default::default()
            },
            LoginOutcome::Authenticated(session) => pb::LoginResponse {
                requires_2fa: false,
                temp_token: String::new(),
                token: session.token,
                session_id: session.session_id.to_string(),
                expires_in: session.expires_in,
            },
        };
        Ok(Response::new(response))
    }

    async fn verify_two_factor(
        &self,
        request: Request<pb::VerifyTwoFactorRequest>,
    ) -> Result<Response<pb::SessionTokenResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let device = device_context(&request, request.get_ref().device.as_ref());
        let req = request.into_inner();

        let session = self
            .auth
            .verify_two_factor(
                &ctx,
                VerifyTwoFactorRequest {
                    temp_token: req.temp_token,
                    code: req.code,
                    method: req.method,
                    device,
                },
            )
            .await
            .map_err(status)?;
        Ok(Response::new(session_response(session)))
    }

    async fn request_password_reset(
        &self,
        request: Request<pb::RequestPasswordResetRequest>,
    ) -> Result<Response<pb::RequestPasswordResetResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let req = request.into_inner();
        self.auth
            .request_password_reset(&ctx, &req.email)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::RequestPasswordResetResponse {}))
    }

    async fn confirm_password_reset(
        &self,
        request: Request<pb::ConfirmPasswordResetRequest>,
    ) -> Result<Response<pb::ConfirmPasswordResetResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let req = request.into_inner();
        self.auth
            .confirm_password_reset(&ctx, &req.reset_token, Password::new(req.new_password))
            .await
            .map_err(status)?;
        Ok(Response::new(pb::ConfirmPasswordResetResponse {}))
    }

    async fn refresh(
        &self,
        request: Request<pb::RefreshRequest>,
    ) -> Result<Response<pb::RefreshResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        // The body token wins; the bearer header is accepted for symmetry with Logout
        let token = match non_empty(request.get_ref().token.clone()) {
            Some(token) => token,
            None => bearer_token(&request)?,
        };

        let refreshed = self.auth.refresh(&ctx, &token).await.map_err(status)?;
        Ok(Response::new(pb::RefreshResponse {
            token: refreshed.token,
            expires_in: refreshed.expires_in,
        }))
    }

    async fn logout(
        &self,
        request: Request<pb::LogoutRequest>,
    ) -> Result<Response<pb::LogoutResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let token = bearer_token(&request)?;
        let revoked = self.auth.logout(&ctx, &token).await.map_err(status)?;
        Ok(Response::new(pb::LogoutResponse {
            revoked_sessions: revoked as i32,
        }))
    }

    async fn logout_all(
        &self,
        request: Request<pb::LogoutAllRequest>,
    ) -> Result<Response<pb::LogoutResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let token = bearer_token(&request)?;
        let revoked = self.auth.logout_all(&ctx, &token).await.map_err(status)?;
        Ok(Response::new(pb::LogoutResponse {
            revoked_sessions: revoked as i32,
        }))
    }

    async fn delete_account(
        &self,
        request: Request<pb::DeleteAccountRequest>,
    ) -> Result<Response<pb::DeleteAccountResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let token = bearer_token(&request)?;
        self.auth.delete_account(&ctx, &token).await.map_err(status)?;
        Ok(Response::new(pb::DeleteAccountResponse {}))
    }

    async fn validate_token(
        &self,
        request: Request<pb::ValidateTokenRequest>,
    ) -> Result<Response<pb::ValidateTokenResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let req = request.into_inner();

        let claims = self
            .auth
            .validate_token(&ctx, &req.token)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::ValidateTokenResponse {
            valid: true,
            user_id: claims.user_id,
            email: claims.email,
            role: claims.role,
            expires_at: claims.exp,
            session_id: claims.session_id,
        }))
    }

    async fn get_public_keys(
        &self,
        _request: Request<pb::GetPublicKeysRequest>,
    ) -> Result<Response<pb::GetPublicKeysResponse>, Status> {
        let keys = self
            .auth
            .public_keys()
            .keys
            .into_iter()
            .map(|key| pb::PublicKey {
                kid: key.kid,
                kty: key.kty,
                alg: key.alg,
                r#use: key.use_,
                n: key.n,
                e: key.e,
            })
            .collect();
        Ok(Response::new(pb::GetPublicKeysResponse { keys }))
    }

    async fn get_user_identity(
        &self,
        request: Request<pb::GetUserIdentityRequest>,
    ) -> Result<Response<pb::GetUserIdentityResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let req = request.into_inner();

        let user = self
            .auth
            .get_user_identity(&ctx, &req.user_id)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::GetUserIdentityResponse {
            user_id: user.id.to_string(),
            status: user.status().as_str().to_string(),
            email: user.email,
            role: user.role_name,
        }))
    }

    async fn oidc_authorize(
        &self,
        request: Request<pb::OidcAuthorizeRequest>,
    ) -> Result<Response<pb::OidcAuthorizeResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let fallback_ip = peer_ip(&request);
        let req = request.into_inner();

        let response = self
            .auth
            .oidc_authorize(
                &ctx,
                OidcAuthorizeRequest {
                    provider: req.provider,
                    redirect_uri: req.redirect_uri,
                    client_context: req.client_context,
                    login_hint: req.login_hint,
                    ip_address: non_empty(req.ip_address).unwrap_or(fallback_ip),
                },
            )
            .await
            .map_err(status)?;
        Ok(Response::new(pb::OidcAuthorizeResponse {
            authorize_url: response.authorize_url,
            state: response.state,
        }))
    }

    async fn oidc_callback(
        &self,
        request: Request<pb::OidcCallbackRequest>,
    ) -> Result<Response<pb::OidcCallbackResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let device = device_context(&request, request.get_ref().device.as_ref());
        let req = request.into_inner();

        let outcome = self
            .auth
            .oidc_callback(&ctx, &req.code, &req.state, device)
            .await
            .map_err(status)?;

        let response = match outcome {
            CallbackOutcome::SignedIn {
                redirect_url,
                session,
            } => pb::OidcCallbackResponse {
                redirect_url,
                token: session.token,
                session_id: session.session_id.to_string(),
                user_id: session.user_id.to_string(),
                ..Default::default()
            },
            CallbackOutcome::RegistrationIncomplete {
                redirect_url,
                user_id,
                completion_token,
            } => pb::OidcCallbackResponse {
                redirect_url,
                user_id: user_id.to_string(),
                registration_incomplete: true,
                completion_token,
                ..Default::default()
            },
        };
        Ok(Response::new(response))
    }

    async fn register_complete(
        &self,
        request: Request<pb::RegisterCompleteRequest>,
    ) -> Result<Response<pb::SessionTokenResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let device = device_context(&request, request.get_ref().device.as_ref());
        let req = request.into_inner();

        let session = self
            .auth
            .register_complete(&ctx, &req.completion_token, device)
            .await
            .map_err(status)?;
        Ok(Response::new(session_response(session)))
    }

    async fn link_oidc(
        &self,
        request: Request<pb::LinkOidcRequest>,
    ) -> Result<Response<pb::LinkOidcResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let user_id = authenticated_user(&self.auth, &ctx, &request).await?;
        let req = request.into_inner();

        let linked = self
            .auth
            .link_oidc(&ctx, user_id, &req.code, &req.state)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::LinkOidcResponse {
            provider: linked.provider,
            issuer: linked.issuer,
            subject: linked.subject,
        }))
    }

    async fn unlink_oidc(
        &self,
        request: Request<pb::UnlinkOidcRequest>,
    ) -> Result<Response<pb::UnlinkOidcResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let user_id = authenticated_user(&self.auth, &ctx, &request).await?;
        let req = request.into_inner();

        self.auth
            .unlink_oidc(&ctx, user_id, &req.issuer, &req.subject)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::UnlinkOidcResponse {}))
    }

    async fn set_mfa_method(
        &self,
        request: Request<pb::SetMfaMethodRequest>,
    ) -> Result<Response<pb::SetMfaMethodResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let user_id = authenticated_user(&self.auth, &ctx, &request).await?;
        let req = request.into_inner();

        self.auth
            .set_mfa_method(&ctx, user_id, &req.method, req.enabled, req.primary)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::SetMfaMethodResponse {}))
    }

    async fn enroll_authenticator(
        &self,
        request: Request<pb::EnrollAuthenticatorRequest>,
    ) -> Result<Response<pb::EnrollAuthenticatorResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let user_id = authenticated_user(&self.auth, &ctx, &request).await?;

        let enrolled = self
            .auth
            .enroll_authenticator(&ctx, user_id)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::EnrollAuthenticatorResponse {
            secret_base32: enrolled.secret_base32,
            otpauth_url: enrolled.otpauth_url,
        }))
    }

    async fn regenerate_backup_codes(
        &self,
        request: Request<pb::RegenerateBackupCodesRequest>,
    ) -> Result<Response<pb::RegenerateBackupCodesResponse>, Status> {
        let ctx = RequestContext::from_grpc_metadata(request.metadata());
        let user_id = authenticated_user(&self.auth, &ctx, &request).await?;

        let codes = self
            .auth
            .regenerate_backup_codes(&ctx, user_id)
            .await
            .map_err(status)?;
        Ok(Response::new(pb::RegenerateBackupCodesResponse { codes }))
    }
}
