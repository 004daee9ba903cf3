//! Second-factor methods, authenticator secrets and backup codes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MfaMethodKind {
    AuthenticatorApp,
    Email,
    Sms,
}

impl MfaMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethodKind::Sms => "sms",
            MfaMethodKind::Email => "email",
            MfaMethodKind::AuthenticatorApp => "authenticator_app",
        }
    }
}

impl fmt::Display for MfaMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MfaMethodKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sms" => Ok(MfaMethodKind::Sms),
            "email" => Ok(MfaMethodKind::Email),
            "authenticator_app" | "totp" => Ok(MfaMethodKind::AuthenticatorApp),
            other => Err(format!("unknown MFA method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MfaMethodRow {
    pub user_id: Uuid,
    pub method_type: String,
    pub enabled: bool,
    pub is_primary: bool,
    pub updated_at: DateTime<Utc>,
}

/// Enabled-method view used by the login flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaMethod {
    pub user_id: Uuid,
    pub kind: MfaMethodKind,
    pub enabled: bool,
    pub is_primary: bool,
}

impl TryFrom<MfaMethodRow> for MfaMethod {
    type Error = String;

    fn try_from(row: MfaMethodRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: row.user_id,
            kind: row.method_type.parse()?,
            enabled: row.enabled,
            is_primary: row.is_primary,
        })
    }
}

/// Orders methods primary first, then by method name, the way the challenge picks one.
pub fn challenge_order(a: &MfaMethod, b: &MfaMethod) -> std::cmp::Ordering {
    b.is_primary
        .cmp(&a.is_primary)
        .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
}

#[derive(Debug, Clone, FromRow)]
pub struct TotpSecretRecord {
    pub user_id: Uuid,
    pub secret_encrypted: Vec<u8>,
    pub deactivated: bool,
    pub updated_at: DateTime<Utc>,
}

pub const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 10;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Stored form of a backup code: hex SHA-256 of the trimmed, upper-cased input.
pub fn hash_backup_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().to_uppercase().as_bytes()))
}

/// Fresh plaintext backup codes. Only their hashes are persisted.
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            (0..BACKUP_CODE_LEN)
                .map(|_| {
                    let idx = rng.gen_range(0..BACKUP_CODE_ALPHABET.len());
                    BACKUP_CODE_ALPHABET[idx] as char
                })
                .collect()
        })
        .collect()
}
