//! Revocable login sessions.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Client device details recorded with sessions and login attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceContext {
    pub device_name: String,
    pub device_os: String,
    pub ip_address: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_name: String,
    pub device_os: String,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Sliding expiry, pushed forward on activity.
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: Uuid, device: &DeviceContext, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            device_name: device.device_name.clone(),
            device_os: device.device_os.clone(),
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + ttl,
            revoked_at: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Hard cap measured from creation, regardless of activity.
    pub fn past_absolute_ttl(&self, now: DateTime<Utc>, absolute_ttl: Duration) -> bool {
        self.created_at + absolute_ttl <= now
    }

    /// New sliding expiry after activity at `now`, never beyond the absolute cap.
    pub fn slid_expiry(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
        absolute_ttl: Duration,
    ) -> DateTime<Utc> {
        (now + ttl).min(self.created_at + absolute_ttl).max(now)
    }
}

/// Result of revoking a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slide_is_capped_by_absolute_ttl() {
        let created = Utc::now();
        let session = Session::new(
            Uuid::new_v4(),
            &DeviceContext::default(),
            created,
            Duration::days(30),
        );

        let now = created + Duration::days(80);
        let slid = session.slid_expiry(now, Duration::days(30), Duration::days(90));
        assert_eq!(slid, created + Duration::days(90));
        assert!(session.last_activity_at <= session.expires_at);
    }

    #[test]
    fn test_absolute_ttl_boundary() {
        let created = Utc::now();
        let session = Session::new(
            Uuid::new_v4(),
            &DeviceContext::default(),
            created,
            Duration::days(30),
        );
        let abs = Duration::days(90);
        assert!(!session.past_absolute_ttl(created + Duration::days(89), abs));
        assert!(session.past_absolute_ttl(created + abs, abs));
    }
}
