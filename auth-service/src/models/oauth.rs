//! Links between local users and external identity-provider subjects.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Revoked,
    Expired,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Revoked => "revoked",
            ConnectionStatus::Expired => "expired",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "revoked" => Ok(ConnectionStatus::Revoked),
            "expired" => Ok(ConnectionStatus::Expired),
            other => Err(format!("unknown connection status: {}", other)),
        }
    }
}

/// Keyed by `(issuer, subject)`.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthConnection {
    pub issuer: String,
    pub subject: String,
    pub user_id: Uuid,
    pub provider: String,
    pub email: String,
    pub status: String,
    pub is_primary: bool,
    pub linked_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl OAuthConnection {
    pub fn status(&self) -> ConnectionStatus {
        self.status.parse().unwrap_or(ConnectionStatus::Revoked)
    }

    pub fn is_active(&self) -> bool {
        self.status() == ConnectionStatus::Active
    }
}

/// Provider tokens, encrypted at rest. Keyed by `(user_id, provider)`.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthToken {
    pub user_id: Uuid,
    pub provider: String,
    pub access_token_encrypted: Vec<u8>,
    pub refresh_token_encrypted: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
