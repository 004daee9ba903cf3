//! Transactional outbox rows and the event envelope they carry.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const SOURCE_SERVICE: &str = "auth-service";
pub const SCHEMA_VERSION: &str = "1.0";

pub const USER_REGISTERED: &str = "user.registered";
pub const USER_DELETED: &str = "user.deleted";
pub const TWO_FACTOR_REQUIRED: &str = "auth.2fa.required";
pub const PASSWORD_RESET_REQUESTED: &str = "auth.password_reset.requested";

/// A persisted outbox row. At any instant it is exactly one of unclaimed,
/// claimed (claim_until in the future), published or dead-lettered.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub claim_token: Option<Uuid>,
    pub claim_until: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Eligible for a new claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_published()
            && !self.is_dead_lettered()
            && self.claim_until.map(|until| until < now).unwrap_or(true)
    }
}

/// An event ready to be written alongside a state change.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    /// Wrap `data` in the mesh envelope and serialise it as the row payload.
    pub fn envelope<T: Serialize>(
        event_type: &str,
        partition_key_path: &str,
        partition_key: &str,
        data: &T,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let event_id = Uuid::new_v4();
        let envelope = EventEnvelope {
            event_id,
            event_type: event_type.to_string(),
            occurred_at: rfc3339(now),
            source_service: SOURCE_SERVICE.to_string(),
            trace_id: service_core::observability::current_trace_id(),
            schema_version: SCHEMA_VERSION.to_string(),
            partition_key_path: partition_key_path.to_string(),
            partition_key: partition_key.to_string(),
            data: serde_json::to_value(data)?,
        };

        Ok(Self {
            event_id,
            event_type: event_type.to_string(),
            partition_key: partition_key.to_string(),
            payload: serde_json::to_vec(&envelope)?,
            created_at: now,
        })
    }

    pub fn into_record(self) -> OutboxRecord {
        OutboxRecord {
            event_id: self.event_id,
            event_type: self.event_type,
            partition_key: self.partition_key,
            payload: self.payload,
            created_at: self.created_at,
            first_seen_at: None,
            published_at: None,
            retry_count: 0,
            last_error: None,
            last_error_at: None,
            claim_token: None,
            claim_until: None,
            dead_lettered_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: String,
    pub source_service: String,
    pub trace_id: String,
    pub schema_version: String,
    pub partition_key_path: String,
    pub partition_key: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserRegisteredData {
    pub user_id: Uuid,
    pub email: String,
    pub registered_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserDeletedData {
    pub user_id: Uuid,
    pub email: String,
    pub deleted_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TwoFactorRequiredData {
    pub user_id: Uuid,
    pub method: String,
    pub requested_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PasswordResetRequestedData {
    pub user_id: Uuid,
    pub email: String,
    pub reset_token: String,
    pub requested_at: String,
}

pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_payload_shape() {
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let event = NewOutboxEvent::envelope(
            USER_REGISTERED,
            "data.email",
            "alice@example.com",
            &UserRegisteredData {
                user_id,
                email: "alice@example.com".into(),
                registered_at: rfc3339(now),
            },
            now,
        )
        .unwrap();

        let envelope: EventEnvelope = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(envelope.event_id, event.event_id);
        assert_eq!(envelope.event_type, "user.registered");
        assert_eq!(envelope.source_service, SOURCE_SERVICE);
        assert_eq!(envelope.partition_key, "alice@example.com");
        assert_eq!(envelope.trace_id.len(), 32);
        assert_eq!(envelope.data["user_id"], user_id.to_string());
    }

    #[test]
    fn test_claimable_states() {
        let now = Utc::now();
        let mut record = NewOutboxEvent::envelope(USER_DELETED, "data.user_id", "u", &(), now)
            .unwrap()
            .into_record();
        assert!(record.is_claimable(now));

        record.claim_until = Some(now + chrono::Duration::seconds(30));
        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(now + chrono::Duration::seconds(31)));

        record.claim_until = None;
        record.published_at = Some(now);
        assert!(!record.is_claimable(now));
    }
}
