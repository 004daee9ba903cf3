//! Client for the peer-facing part of the auth service.

use std::time::Duration;
use tonic::Request;
use tonic::transport::{Channel, Endpoint};

use super::proto::auth::auth_service_client::AuthServiceClient;
use super::proto::auth::{
    GetPublicKeysRequest, GetPublicKeysResponse, GetUserIdentityRequest, GetUserIdentityResponse,
    ValidateTokenRequest, ValidateTokenResponse,
};
use super::retry::{RetryConfig, retry_grpc_call};
use crate::context::RequestContext;

#[derive(Clone, Debug)]
pub struct AuthClientConfig {
    /// The gRPC endpoint of the auth service (e.g., "http://auth-service:50051").
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for AuthClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:50051".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct AuthClient {
    client: AuthServiceClient<Channel>,
    retry: RetryConfig,
}

impl AuthClient {
    /// Build a lazily-connected client; the first call establishes the channel.
    pub fn new(config: AuthClientConfig) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(config.endpoint)?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .connect_lazy();

        Ok(Self {
            client: AuthServiceClient::new(channel),
            retry: config.retry,
        })
    }

    /// Synchronously validate a session token, including its revocation state.
    pub async fn validate_token(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<ValidateTokenResponse, tonic::Status> {
        retry_grpc_call(ctx, &self.retry, "validate_token", || {
            let mut client = self.client.clone();
            let request = Request::new(ValidateTokenRequest {
                token: token.to_string(),
            });
            async move { client.validate_token(request).await.map(|r| r.into_inner()) }
        })
        .await
    }

    /// Fetch the signing keys for local verification.
    pub async fn get_public_keys(
        &self,
        ctx: &RequestContext,
    ) -> Result<GetPublicKeysResponse, tonic::Status> {
        retry_grpc_call(ctx, &self.retry, "get_public_keys", || {
            let mut client = self.client.clone();
            async move {
                client
                    .get_public_keys(Request::new(GetPublicKeysRequest {}))
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await
    }

    pub async fn get_user_identity(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<GetUserIdentityResponse, tonic::Status> {
        retry_grpc_call(ctx, &self.retry, "get_user_identity", || {
            let mut client = self.client.clone();
            let request = Request::new(GetUserIdentityRequest {
                user_id: user_id.to_string(),
            });
            async move { client.get_user_identity(request).await.map(|r| r.into_inner()) }
        })
        .await
    }
}
