use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, DecodingKey, EncodingKey, Header};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use service_core::auth::{
    session_validation, Jwk, Jwks, SessionClaims, SESSION_TOKEN_ALGORITHM, TOKEN_LEEWAY_SECONDS,
};
use sha2::{Digest, Sha256};
use std::fs;
use thiserror::Error;

use super::error::ServiceError;
use crate::config::JwtConfig;

const MIN_KEY_BITS: usize = 2048;

/// Why a session token was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unexpected signing algorithm")]
    WrongAlgorithm,
    #[error("unknown signing key")]
    UnknownKey,
    #[error("token expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => ServiceError::TokenExpired,
            _ => ServiceError::Unauthorized,
        }
    }
}

/// RS256 signer and verifier for session tokens.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
}

impl JwtService {
    /// Load the key pair named in `config`, or generate one when ephemeral keys are allowed.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let Some(private_key_path) = config.private_key_path.as_deref() else {
            if config.ephemeral_keys {
                tracing::warn!("No JWT key configured, generating an ephemeral RS256 key pair");
                return Self::generate_ephemeral(config.key_id.as_deref());
            }
            anyhow::bail!("JWT_PRIVATE_KEY_PATH is not set and ephemeral keys are disabled");
        };

        let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                private_key_path,
                e
            )
        })?;
        let service = Self::from_private_pem(&private_key_pem, config.key_id.as_deref())?;

        if let Some(public_key_path) = config.public_key_path.as_deref() {
            let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
            })?;
            let public_key = parse_public_key(&public_key_pem)?;
            if jwk_components(&public_key) != (service.jwk.n.clone(), service.jwk.e.clone()) {
                anyhow::bail!("JWT public key does not match the private key");
            }
        }

        tracing::info!(kid = %service.jwk.kid, "JWT service initialized with RS256 keys");
        Ok(service)
    }

    /// Build from a PKCS#8 or PKCS#1 PEM private key.
    pub fn from_private_pem(pem: &str, key_id: Option<&str>) -> Result<Self, anyhow::Error> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        Self::from_private_key(private_key, key_id)
    }

    pub fn generate_ephemeral(key_id: Option<&str>) -> Result<Self, anyhow::Error> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), MIN_KEY_BITS)
            .map_err(|e| anyhow::anyhow!("Failed to generate RSA key: {}", e))?;
        Self::from_private_key(private_key, key_id)
    }

    fn from_private_key(private_key: RsaPrivateKey, key_id: Option<&str>) -> Result<Self, anyhow::Error> {
        let bits = private_key.size() * 8;
        if bits < MIN_KEY_BITS {
            anyhow::bail!("RSA key is {} bits, at least {} required", bits, MIN_KEY_BITS);
        }

        let public_key = RsaPublicKey::from(&private_key);
        let kid = match key_id {
            Some(kid) if !kid.trim().is_empty() => kid.trim().to_string(),
            _ => derive_key_id(&public_key)?,
        };

        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| anyhow::anyhow!("Failed to encode private key: {}", e))?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

        let (n, e) = jwk_components(&public_key);
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|e| anyhow::anyhow!("Failed to build verification key: {}", e))?;

        Ok(Self {
            encoding_key,
            decoding_key,
            jwk: Jwk {
                kid,
                kty: "RSA".to_string(),
                alg: "RS256".to_string(),
                use_: "sig".to_string(),
                n,
                e,
            },
        })
    }

    pub fn key_id(&self) -> &str {
        &self.jwk.kid
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, anyhow::Error> {
        let mut header = Header::new(SESSION_TOKEN_ALGORITHM);
        header.kid = Some(self.jwk.kid.clone());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode session token: {}", e))
    }

    /// Verify signature, algorithm and key id, then expiry against `now`.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, TokenError> {
        let claims = self.verify_signature(token)?;
        if claims.exp + TOKEN_LEEWAY_SECONDS as i64 <= now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Signature, algorithm and key id only. Expired tokens are accepted.
    pub fn verify_signature(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        if header.alg != SESSION_TOKEN_ALGORITHM {
            return Err(TokenError::WrongAlgorithm);
        }
        if header.kid.as_deref() != Some(self.jwk.kid.as_str()) {
            return Err(TokenError::UnknownKey);
        }

        // Expiry is left to the caller's clock
        let mut validation = session_validation();
        validation.validate_exp = false;

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                ErrorKind::InvalidAlgorithm => TokenError::WrongAlgorithm,
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Malformed,
            })?
            .claims;
        Ok(claims)
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, anyhow::Error> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))
}

fn jwk_components(public_key: &RsaPublicKey) -> (String, String) {
    (
        URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    )
}

/// First 16 hex chars of SHA-256 over the SubjectPublicKeyInfo DER.
fn derive_key_id(public_key: &RsaPublicKey) -> Result<String, anyhow::Error> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| anyhow::anyhow!("Failed to encode public key: {}", e))?;
    let digest = hex::encode(Sha256::digest(der.as_bytes()));
    Ok(digest[..16].to_string())
}
