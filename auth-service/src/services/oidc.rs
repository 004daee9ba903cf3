//! OpenID Connect client: discovery, JWKS, PKCE, code and refresh grants, and
//! ID token validation.
//!
//! Discovery documents and key sets are cached per provider for
//! `discovery_cache_ttl`. An ID token signed with an unknown `kid` forces one
//! key set refetch before it is rejected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use rand::{rngs::OsRng, RngCore};
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::context::RequestContext;
use service_core::observability::TracedClientExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use super::error::ServiceError;
use crate::config::{OidcConfig, OidcProviderConfig};

const ID_TOKEN_LEEWAY_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    /// The provider or its tokens failed validation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("provider unreachable: {0}")]
    Network(String),
    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl From<OidcError> for ServiceError {
    fn from(err: OidcError) -> Self {
        match err {
            OidcError::UnknownProvider(alias) => {
                ServiceError::InvalidInput(format!("unknown provider: {}", alias))
            }
            OidcError::Unauthorized(reason) => {
                tracing::warn!(reason = %reason, "OIDC validation failed");
                ServiceError::Unauthorized
            }
            OidcError::Network(msg) | OidcError::Discovery(msg) => ServiceError::Upstream(msg),
        }
    }
}

/// Who the provider says signed in. `subject` is the provider's `sub`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcIdentity {
    pub provider: String,
    pub issuer: String,
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CodeExchange {
    pub identity: OidcIdentity,
    pub tokens: ProviderTokens,
}

/// PKCE verifier (base32 of 32 random bytes) and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let verifier = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes);
        let challenge = pkce_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct RawJwks {
    keys: Vec<RawJwk>,
}

#[derive(Debug, Deserialize)]
struct RawJwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default, rename = "use")]
    use_: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    iss: String,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
}

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

#[derive(Clone)]
struct ProviderKey {
    kid: Option<String>,
    key: Arc<DecodingKey>,
}

#[derive(Clone)]
pub struct OidcVerifier {
    providers: Arc<HashMap<String, OidcProviderConfig>>,
    http: reqwest::Client,
    cache_ttl: Duration,
    discovery: Arc<DashMap<String, Cached<DiscoveryDocument>>>,
    keys: Arc<DashMap<String, Cached<Vec<ProviderKey>>>>,
}

impl OidcVerifier {
    pub fn new(config: &OidcConfig) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build OIDC HTTP client: {}", e))?;

        let providers = config
            .providers
            .iter()
            .map(|p| (p.alias.clone(), p.clone()))
            .collect();

        Ok(Self {
            providers: Arc::new(providers),
            http,
            cache_ttl: config.discovery_cache_ttl,
            discovery: Arc::new(DashMap::new()),
            keys: Arc::new(DashMap::new()),
        })
    }

    pub fn has_provider(&self, alias: &str) -> bool {
        self.providers.contains_key(alias)
    }

    fn provider(&self, alias: &str) -> Result<&OidcProviderConfig, OidcError> {
        self.providers
            .get(alias)
            .ok_or_else(|| OidcError::UnknownProvider(alias.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn authorize_url(
        &self,
        ctx: &RequestContext,
        alias: &str,
        redirect_uri: &str,
        state: &str,
        nonce: &str,
        login_hint: &str,
        code_challenge: &str,
    ) -> Result<String, OidcError> {
        let provider = self.provider(alias)?;
        let doc = self.discover(ctx, provider).await?;

        let mut url = Url::parse(&doc.authorization_endpoint)
            .map_err(|e| OidcError::Discovery(format!("bad authorization_endpoint: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &provider.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &provider.scopes.join(" "))
                .append_pair("state", state)
                .append_pair("nonce", nonce);
            if !login_hint.is_empty() {
                query.append_pair("login_hint", login_hint);
            }
            query
                .append_pair("code_challenge", code_challenge)
                .append_pair("code_challenge_method", "S256");
        }
        Ok(url.into())
    }

    /// Redeem an authorization code and validate the returned ID token.
    #[tracing::instrument(skip_all, fields(provider = %alias))]
    pub async fn exchange_code(
        &self,
        ctx: &RequestContext,
        alias: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        expected_nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<CodeExchange, OidcError> {
        let provider = self.provider(alias)?;
        let doc = self.discover(ctx, provider).await?;

        let secret = provider.client_secret.expose_secret();
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", provider.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if !secret.is_empty() {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.post_token(ctx, &doc.token_endpoint, &form).await?;
        let id_token = response
            .id_token
            .as_deref()
            .ok_or_else(|| OidcError::Unauthorized("token response has no id_token".into()))?;

        let claims = self
            .validate_id_token(ctx, provider, &doc, id_token, expected_nonce)
            .await?;

        let issuer = if claims.iss.is_empty() {
            alias.to_string()
        } else {
            claims.iss
        };

        let identity = OidcIdentity {
            provider: alias.to_string(),
            issuer,
            subject: claims.sub,
            email: claims
                .email
                .map(|e| e.trim().to_lowercase())
                .unwrap_or_default(),
            email_verified: claims
                .email_verified
                .as_ref()
                .map(truthy)
                .unwrap_or(false),
            name: claims.name,
        };

        Ok(CodeExchange {
            identity,
            tokens: ProviderTokens {
                access_token: response.access_token,
                refresh_token: response.refresh_token,
                expires_at: response
                    .expires_in
                    .map(|secs| now + chrono::Duration::seconds(secs)),
            },
        })
    }

    /// Refresh-token grant. A missing refresh token in the reply means the old one stays valid.
    pub async fn refresh(
        &self,
        ctx: &RequestContext,
        alias: &str,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<ProviderTokens, OidcError> {
        let provider = self.provider(alias)?;
        let doc = self.discover(ctx, provider).await?;

        let secret = provider.client_secret.expose_secret();
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", provider.client_id.as_str()),
        ];
        if !secret.is_empty() {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.post_token(ctx, &doc.token_endpoint, &form).await?;
        Ok(ProviderTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: response
                .expires_in
                .map(|secs| now + chrono::Duration::seconds(secs)),
        })
    }

    async fn post_token(
        &self,
        ctx: &RequestContext,
        token_endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenEndpointResponse, OidcError> {
        let response = ctx
            .run(self.http.traced_post(token_endpoint).form(form).send())
            .await
            .map_err(|e| OidcError::Network(e.to_string()))?
            .map_err(|e| OidcError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = ctx
                .run(response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Token endpoint rejected the grant");
            return Err(OidcError::Unauthorized(format!(
                "token endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(OidcError::Network(format!(
                "token endpoint returned {}",
                status
            )));
        }

        ctx.run(response.json::<TokenEndpointResponse>())
            .await
            .map_err(|e| OidcError::Network(e.to_string()))?
            .map_err(|e| OidcError::Unauthorized(format!("unreadable token response: {}", e)))
    }

    async fn validate_id_token(
        &self,
        ctx: &RequestContext,
        provider: &OidcProviderConfig,
        doc: &DiscoveryDocument,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, OidcError> {
        let header = decode_header(id_token)
            .map_err(|e| OidcError::Unauthorized(format!("malformed id_token: {}", e)))?;
        if header.alg != Algorithm::RS256 {
            return Err(OidcError::Unauthorized(format!(
                "unexpected id_token algorithm {:?}",
                header.alg
            )));
        }

        let key = match self
            .select_key(ctx, provider, doc, header.kid.as_deref(), false)
            .await?
        {
            Some(key) => key,
            None => self
                .select_key(ctx, provider, doc, header.kid.as_deref(), true)
                .await?
                .ok_or_else(|| OidcError::Unauthorized("no matching signing key".into()))?,
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = ID_TOKEN_LEEWAY_SECONDS;
        validation.set_audience(&[provider.client_id.as_str()]);
        validation.set_issuer(&[doc.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud", "sub"]);

        let claims = decode::<IdTokenClaims>(id_token, &key, &validation)
            .map_err(|e| OidcError::Unauthorized(format!("id_token rejected: {}", e)))?
            .claims;

        if claims.sub.trim().is_empty() {
            return Err(OidcError::Unauthorized("id_token has an empty sub".into()));
        }

        let nonce = claims.nonce.as_deref().unwrap_or_default();
        if expected_nonce.is_empty() || !bool::from(nonce.as_bytes().ct_eq(expected_nonce.as_bytes()))
        {
            return Err(OidcError::Unauthorized("nonce mismatch".into()));
        }

        Ok(claims)
    }

    async fn select_key(
        &self,
        ctx: &RequestContext,
        provider: &OidcProviderConfig,
        doc: &DiscoveryDocument,
        kid: Option<&str>,
        force_refresh: bool,
    ) -> Result<Option<Arc<DecodingKey>>, OidcError> {
        let keys = self.provider_keys(ctx, provider, doc, force_refresh).await?;
        let selected = match kid {
            Some(kid) => keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None if keys.len() == 1 => keys.first(),
            None => None,
        };
        Ok(selected.map(|k| Arc::clone(&k.key)))
    }

    async fn discover(
        &self,
        ctx: &RequestContext,
        provider: &OidcProviderConfig,
    ) -> Result<DiscoveryDocument, OidcError> {
        if let Some(cached) = self.discovery.get(&provider.alias) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.value.clone());
            }
        }

        let response = ctx
            .run(self.http.traced_get(&provider.discovery_url).send())
            .await
            .map_err(|e| OidcError::Network(e.to_string()))?
            .map_err(|e| OidcError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OidcError::Discovery(format!(
                "discovery endpoint returned {}",
                response.status()
            )));
        }
        let doc = ctx
            .run(response.json::<DiscoveryDocument>())
            .await
            .map_err(|e| OidcError::Network(e.to_string()))?
            .map_err(|e| OidcError::Discovery(e.to_string()))?;

        if !provider.issuer.is_empty()
            && doc.issuer.trim_end_matches('/') != provider.issuer.trim_end_matches('/')
        {
            return Err(OidcError::Discovery(format!(
                "issuer mismatch: expected {}, got {}",
                provider.issuer, doc.issuer
            )));
        }

        tracing::debug!(provider = %provider.alias, issuer = %doc.issuer, "Fetched OIDC discovery document");
        self.discovery.insert(
            provider.alias.clone(),
            Cached {
                value: doc.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(doc)
    }

    async fn provider_keys(
        &self,
        ctx: &RequestContext,
        provider: &OidcProviderConfig,
        doc: &DiscoveryDocument,
        force_refresh: bool,
    ) -> Result<Vec<ProviderKey>, OidcError> {
        if !force_refresh {
            if let Some(cached) = self.keys.get(&provider.alias) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.value.clone());
                }
            }
        }

        let response = ctx
            .run(self.http.traced_get(&doc.jwks_uri).send())
            .await
            .map_err(|e| OidcError::Network(e.to_string()))?
            .map_err(|e| OidcError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OidcError::Discovery(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }
        let raw = ctx
            .run(response.json::<RawJwks>())
            .await
            .map_err(|e| OidcError::Network(e.to_string()))?
            .map_err(|e| OidcError::Discovery(e.to_string()))?;

        let keys = decode_key_set(&raw);
        tracing::debug!(provider = %provider.alias, keys = keys.len(), "Fetched OIDC signing keys");
        self.keys.insert(
            provider.alias.clone(),
            Cached {
                value: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }
}

fn decode_key_set(raw: &RawJwks) -> Vec<ProviderKey> {
    raw.keys
        .iter()
        .filter(|k| k.kty == "RSA" && k.use_.as_deref().unwrap_or("sig") == "sig")
        .filter_map(|k| {
            let (n, e) = (k.n.as_deref()?, k.e.as_deref()?);
            if !exponent_is_usable(e) {
                tracing::warn!(kid = ?k.kid, "Skipping JWK with exponent <= 1");
                return None;
            }
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => Some(ProviderKey {
                    kid: k.kid.clone(),
                    key: Arc::new(key),
                }),
                Err(err) => {
                    tracing::warn!(kid = ?k.kid, error = %err, "Skipping unusable JWK");
                    None
                }
            }
        })
        .collect()
}

/// RSA public exponent, big-endian base64url, must be greater than 1.
fn exponent_is_usable(e: &str) -> bool {
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(e.trim_end_matches('=')) else {
        return false;
    };
    let significant: Vec<u8> = bytes.into_iter().skip_while(|b| *b == 0).collect();
    match significant.as_slice() {
        [] => false,
        [single] => *single > 1,
        _ => true,
    }
}

/// `email_verified` arrives as a bool or, from some providers, a string.
fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => {
            matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes")
        }
        serde_json::Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_pkce_challenge_is_s256_of_verifier() {
        // RFC 7636 appendix B.
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );

        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 52);
        assert!(pkce.verifier.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(pkce.challenge, pkce_challenge(&pkce.verifier));
        assert!(!pkce.challenge.contains('='));
    }

    #[test]
    fn test_exponent_check() {
        assert!(exponent_is_usable("AQAB"));
        assert!(exponent_is_usable("Aw"));
        assert!(!exponent_is_usable("AQ"));
        assert!(!exponent_is_usable("AA"));
        assert!(!exponent_is_usable("AAE"));
        assert!(!exponent_is_usable("%%%"));
    }

    #[test]
    fn test_email_verified_forms() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("true")));
        assert!(truthy(&json!("YES")));
        assert!(truthy(&json!("1")));
        assert!(!truthy(&json!("false")));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(null)));
    }

    #[test]
    fn test_key_set_requires_rsa_signing_keys() {
        let raw: RawJwks = serde_json::from_value(json!({
            "keys": [
                {"kty": "EC", "kid": "ec", "crv": "P-256", "x": "a", "y": "b"},
                {"kty": "RSA", "kid": "enc", "use": "enc", "n": "sXch", "e": "AQAB"},
                {"kty": "RSA", "kid": "weak", "n": "sXch", "e": "AQ"},
                {"kty": "RSA", "kid": "good", "n": "sXch", "e": "AQAB"}
            ]
        }))
        .unwrap();
        let keys = decode_key_set(&raw);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid.as_deref(), Some("good"));
    }

    fn config_for(server: &MockServer, issuer: &str) -> OidcConfig {
        OidcConfig {
            providers: vec![OidcProviderConfig {
                alias: "google".into(),
                issuer: issuer.to_string(),
                discovery_url: format!("{}/.well-known/openid-configuration", server.uri()),
                client_id: "client-123".into(),
                client_secret: SecretString::new("shh".into()),
                scopes: vec!["openid".into(), "email".into()],
            }],
            ..OidcConfig::default()
        }
    }

    async fn mount_discovery(server: &MockServer, issuer: &str) {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{}/authorize", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
                "jwks_uri": format!("{}/jwks", server.uri()),
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_authorize_url_carries_pkce_and_hint() {
        let server = MockServer::start().await;
        mount_discovery(&server, &server.uri()).await;
        let verifier = OidcVerifier::new(&config_for(&server, &server.uri())).unwrap();
        let ctx = RequestContext::background();

        let url = verifier
            .authorize_url(
                &ctx,
                "google",
                "https://app.example.com/cb",
                "state-1",
                "nonce-1",
                "oidc@example.com",
                "challenge-1",
            )
            .await
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

        assert_eq!(parsed.path(), "/authorize");
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["redirect_uri"], "https://app.example.com/cb");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "openid email");
        assert_eq!(params["state"], "state-1");
        assert_eq!(params["nonce"], "nonce-1");
        assert_eq!(params["login_hint"], "oidc@example.com");
        assert_eq!(params["code_challenge"], "challenge-1");
        assert_eq!(params["code_challenge_method"], "S256");

        // Second call is served from the discovery cache (`expect(1)` above).
        verifier
            .authorize_url(&ctx, "google", "https://app.example.com/cb", "s", "n", "", "c")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_discovery_issuer_mismatch_is_distinct_error() {
        let server = MockServer::start().await;
        mount_discovery(&server, "https://evil.example.com").await;
        let verifier =
            OidcVerifier::new(&config_for(&server, "https://accounts.example.com")).unwrap();

        let err = verifier
            .authorize_url(
                &RequestContext::background(),
                "google",
                "https://app.example.com/cb",
                "s",
                "n",
                "",
                "c",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::Discovery(_)));
        assert!(matches!(ServiceError::from(err), ServiceError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let verifier = OidcVerifier::new(&OidcConfig::default()).unwrap();
        let err = verifier
            .refresh(&RequestContext::background(), "github", "rt", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::UnknownProvider(_)));
    }
}
