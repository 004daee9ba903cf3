//! User accounts.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Role;

/// Externally visible account status, as reported to peer services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    Disabled,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Disabled => "disabled",
            UserStatus::Deleted => "deleted",
        }
    }
}

/// User row joined with its role name.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Empty for users that only sign in through an identity provider.
    pub password_hash: Option<String>,
    pub role_id: i16,
    pub role_name: String,
    pub email_verified: bool,
    pub active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_password(&self) -> bool {
        self.password_hash
            .as_deref()
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    /// Active and not soft-deleted.
    pub fn can_authenticate(&self) -> bool {
        self.active && self.deleted_at.is_none()
    }

    pub fn status(&self) -> UserStatus {
        if self.deleted_at.is_some() {
            UserStatus::Deleted
        } else if !self.active {
            UserStatus::Disabled
        } else {
            UserStatus::Active
        }
    }
}

/// Fields needed to insert a user. The id is chosen by the caller so the
/// announcing event can carry it before the row exists.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub role: Role,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl NewUser {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            password_hash: self.password_hash,
            role_id: self.role.id,
            role_name: self.role.name,
            email_verified: self.email_verified,
            active: true,
            deleted_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
