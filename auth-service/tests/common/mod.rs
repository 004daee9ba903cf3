//! Shared setup for auth-service integration tests.
//!
//! Everything runs in process: the in-memory stores stand in for PostgreSQL and
//! Redis, a `ManualClock` drives expiry, and a wiremock server plays the
//! identity provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use auth_service::config::{OidcConfig, OidcProviderConfig};
use auth_service::grpc::proto::auth::auth_service_client::AuthServiceClient;
use auth_service::models::{DeviceContext, EventEnvelope};
use auth_service::services::auth::{
    LoginOutcome, LoginRequest, OidcAuthorizeRequest, RegisterRequest,
};
use auth_service::services::{
    AuthDeps, AuthService, AuthSettings, EphemeralState, JwtService, LockoutEngine, ManualClock,
    MemoryAttemptCounter, MemoryEphemeralStore, MemoryStore, OidcVerifier, SecretCipher,
    SessionToken,
};
use auth_service::startup::serve_grpc;
use auth_service::utils::{CredentialHasher, HashCost, Password};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use secrecy::SecretString;
use serde_json::{json, Value};
use service_core::context::RequestContext;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SIGNER_PRIVATE_PEM: &str = include_str!("../fixtures/signer_private.pem");
pub const IDP_PRIVATE_PEM: &str = include_str!("../fixtures/idp_private.pem");

pub const SIGNER_KID: &str = "test-signer";
pub const IDP_KID: &str = "idp-key-1";
pub const IDP_CLIENT_ID: &str = "micros-web";
pub const STRONG_PASSWORD: &str = "StrongPass123!";
pub const REDIRECT_URI: &str = "https://app.example.com/auth/callback";

pub fn ctx() -> RequestContext {
    RequestContext::background()
}

pub fn device(ip: &str) -> DeviceContext {
    DeviceContext {
        device_name: "laptop".into(),
        device_os: "linux".into(),
        ip_address: ip.into(),
        user_agent: "integration-test".into(),
    }
}

pub fn register_request(email: &str, role: &str) -> RegisterRequest {
    RegisterRequest {
        email: email.into(),
        password: Password::new(STRONG_PASSWORD.into()),
        role: role.into(),
        terms_accepted: true,
        ..Default::default()
    }
}

pub fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.into(),
        password: Password::new(password.into()),
        device: device("203.0.113.10"),
    }
}

/// An authentication core on in-memory backends.
pub struct TestHarness {
    pub auth: Arc<AuthService>,
    pub store: Arc<MemoryStore>,
    pub ephemeral: EphemeralState,
    pub cipher: SecretCipher,
    pub clock: ManualClock,
    pub idp: Option<FakeIdp>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(AuthSettings::default(), None).await
    }

    pub async fn with_settings(settings: AuthSettings) -> Self {
        Self::build(settings, None).await
    }

    /// Harness whose `google` provider is a wiremock identity provider.
    pub async fn with_idp() -> Self {
        let idp = FakeIdp::start().await;
        Self::build(AuthSettings::default(), Some(idp)).await
    }

    pub async fn with_idp_and_settings(settings: AuthSettings) -> Self {
        let idp = FakeIdp::start().await;
        Self::build(settings, Some(idp)).await
    }

    async fn build(settings: AuthSettings, idp: Option<FakeIdp>) -> Self {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(MemoryStore::new());
        let ephemeral = EphemeralState::new(Arc::new(MemoryEphemeralStore::new(clock.clock())));
        let cipher = SecretCipher::random();

        let oidc_config = match &idp {
            Some(idp) => idp.oidc_config(),
            None => OidcConfig::default(),
        };

        let deps = AuthDeps {
            users: store.clone(),
            sessions: store.clone(),
            mfa: store.clone(),
            oauth: store.clone(),
            login_attempts: store.clone(),
            outbox: store.clone(),
            ephemeral: ephemeral.clone(),
            lockout: LockoutEngine::new(Arc::new(MemoryAttemptCounter::new(clock.clock()))),
            jwt: JwtService::from_private_pem(SIGNER_PRIVATE_PEM, Some(SIGNER_KID))
                .expect("fixture signer key"),
            hasher: fast_hasher(),
            oidc: OidcVerifier::new(&oidc_config).expect("OIDC verifier"),
            cipher: cipher.clone(),
            clock: clock.clock(),
        };

        Self {
            auth: Arc::new(AuthService::new(deps, settings)),
            store,
            ephemeral,
            cipher,
            clock,
            idp,
        }
    }

    pub fn idp(&self) -> &FakeIdp {
        self.idp.as_ref().expect("harness was built without an identity provider")
    }

    pub async fn register(&self, email: &str, role: &str) -> Uuid {
        self.auth
            .register(&ctx(), register_request(email, role))
            .await
            .expect("registration succeeds")
    }

    /// Password login that must complete without a second factor.
    pub async fn login(&self, email: &str) -> SessionToken {
        match self
            .auth
            .login(&ctx(), login_request(email, STRONG_PASSWORD))
            .await
            .expect("login succeeds")
        {
            LoginOutcome::Authenticated(session) => session,
            LoginOutcome::TwoFactorRequired { .. } => panic!("unexpected second factor"),
        }
    }

    /// The code behind a pending challenge, as the notification service would deliver it.
    pub async fn challenge_code(&self, temp_token: &str) -> String {
        self.ephemeral
            .get_mfa_challenge(temp_token)
            .await
            .expect("challenge lookup")
            .expect("challenge exists")
            .code
    }

    pub fn outbox_envelopes(&self) -> Vec<EventEnvelope> {
        self.store
            .outbox_records()
            .expect("outbox snapshot")
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).expect("outbox payload is an envelope"))
            .collect()
    }

    pub fn outbox_events_of(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.outbox_envelopes()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Start a provider sign-in and return `(state, nonce)`.
    pub async fn begin_oidc(&self, login_hint: &str) -> (String, String) {
        let started = self
            .auth
            .oidc_authorize(
                &ctx(),
                OidcAuthorizeRequest {
                    provider: "google".into(),
                    redirect_uri: REDIRECT_URI.into(),
                    login_hint: login_hint.into(),
                    ..Default::default()
                },
            )
            .await
            .expect("authorize succeeds");
        let nonce = query_param(&started.authorize_url, "nonce").expect("authorize URL has a nonce");
        (started.state, nonce)
    }
}

/// Cheap Argon2 parameters so tests do not spend seconds hashing.
pub fn fast_hasher_cost() -> HashCost {
    HashCost {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

pub fn fast_hasher() -> CredentialHasher {
    CredentialHasher::new(fast_hasher_cost()).expect("hasher")
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// `#a=b&c=d` fragment of a redirect URL as a map.
pub fn fragment_params(url: &str) -> HashMap<String, String> {
    let fragment = Url::parse(url)
        .ok()
        .and_then(|u| u.fragment().map(str::to_string))
        .unwrap_or_default();
    serde_urlencoded::from_str(&fragment).unwrap_or_default()
}

/// What the provider asserts about the user in its id_token.
#[derive(Debug, Clone)]
pub struct IdpIdentity {
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
}

impl IdpIdentity {
    pub fn verified(subject: &str, email: &str) -> Self {
        Self {
            subject: subject.into(),
            email: email.into(),
            email_verified: true,
        }
    }
}

/// A wiremock OpenID provider signing id_tokens with the fixture IdP key.
pub struct FakeIdp {
    pub server: MockServer,
    encoding_key: EncodingKey,
}

impl FakeIdp {
    pub async fn start() -> Self {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": server.uri(),
                "authorization_endpoint": format!("{}/authorize", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
                "jwks_uri": format!("{}/jwks", server.uri()),
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(idp_jwks()))
            .mount(&server)
            .await;

        Self {
            server,
            encoding_key: EncodingKey::from_rsa_pem(IDP_PRIVATE_PEM.as_bytes())
                .expect("fixture IdP key"),
        }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn oidc_config(&self) -> OidcConfig {
        OidcConfig {
            providers: vec![OidcProviderConfig {
                alias: "google".into(),
                issuer: self.issuer(),
                discovery_url: format!("{}/.well-known/openid-configuration", self.server.uri()),
                client_id: IDP_CLIENT_ID.into(),
                client_secret: SecretString::new("idp-secret".into()),
                scopes: vec!["openid".into(), "email".into(), "profile".into()],
            }],
            ..OidcConfig::default()
        }
    }

    pub fn id_token(&self, identity: &IdpIdentity, nonce: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = json!({
            "iss": self.issuer(),
            "aud": IDP_CLIENT_ID,
            "sub": identity.subject,
            "email": identity.email,
            "email_verified": identity.email_verified,
            "nonce": nonce,
            "iat": now,
            "exp": now + 600,
        });
        let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(IDP_KID.into());
        encode(&header, &claims, &self.encoding_key).expect("sign id_token")
    }

    /// Answer the token exchange for `code` with a signed id_token.
    pub async fn expect_code(&self, code: &str, identity: &IdpIdentity, nonce: &str) {
        let body = json!({
            "access_token": format!("access-{}", code),
            "refresh_token": format!("refresh-{}", code),
            "id_token": self.id_token(identity, nonce),
            "token_type": "Bearer",
            "expires_in": 3600,
        });
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(format!("code={}", code)))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Answer refresh-token grants with a new access token.
    pub async fn expect_refresh(&self, access_token: &str) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": access_token,
                "token_type": "Bearer",
                "expires_in": 3600,
            })))
            .mount(&self.server)
            .await;
    }
}

fn idp_jwks() -> Value {
    let private = RsaPrivateKey::from_pkcs8_pem(IDP_PRIVATE_PEM).expect("fixture IdP key");
    let public = private.to_public_key();
    json!({
        "keys": [{
            "kty": "RSA",
            "kid": IDP_KID,
            "use": "sig",
            "alg": "RS256",
            "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        }]
    })
}

/// A running gRPC server for `auth`, stopped when the token is cancelled.
pub struct TestGrpcServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl TestGrpcServer {
    pub async fn spawn(auth: Arc<AuthService>) -> Self {
        // Find an available port for gRPC
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_grpc(auth, "auth-service-test", addr, token).await {
                eprintln!("test gRPC server stopped: {}", e);
            }
        });

        // Give the server time to start
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        Self { addr, shutdown }
    }

    pub async fn client(&self) -> AuthServiceClient<Channel> {
        AuthServiceClient::connect(format!("http://{}", self.addr))
            .await
            .expect("Failed to connect to gRPC server")
    }
}

impl Drop for TestGrpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
