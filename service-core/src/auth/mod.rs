//! Session token contract shared by the issuer and every verifying peer.

mod verifier;

use serde::{Deserialize, Serialize};

pub use verifier::{TokenVerifier, TokenVerifierConfig, VerifyError};

/// Only algorithm accepted for session tokens.
pub const SESSION_TOKEN_ALGORITHM: jsonwebtoken::Algorithm = jsonwebtoken::Algorithm::RS256;

/// Clock skew tolerated when checking `exp`/`iat`, in seconds.
pub const TOKEN_LEEWAY_SECONDS: u64 = 30;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    pub role: String,
    pub session_id: String,
    pub iat: i64,
    pub exp: i64,
}

/// One RSA signing key in JWKS form. `n` and `e` are unpadded base64url, big-endian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Validation settings every verifier of session tokens must use.
pub fn session_validation() -> jsonwebtoken::Validation {
    let mut validation = jsonwebtoken::Validation::new(SESSION_TOKEN_ALGORITHM);
    validation.leeway = TOKEN_LEEWAY_SECONDS;
    validation.set_required_spec_claims(&["exp", "iat"]);
    validation
}
