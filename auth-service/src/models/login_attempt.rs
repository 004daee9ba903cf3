use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::DeviceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "SUCCESS",
            AttemptStatus::Failed => "FAILED",
        }
    }
}

/// Append-only audit row for a primary authentication attempt.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub id: Uuid,
    /// Unknown when the email did not resolve to a user.
    pub user_id: Option<Uuid>,
    pub attempted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub failure_reason: Option<String>,
    pub device: DeviceContext,
}

impl LoginAttempt {
    pub fn failed(
        user_id: Option<Uuid>,
        reason: &str,
        device: &DeviceContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            attempted_at: now,
            status: AttemptStatus::Failed,
            failure_reason: Some(reason.to_string()),
            device: device.clone(),
        }
    }

    pub fn succeeded(user_id: Uuid, device: &DeviceContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: Some(user_id),
            attempted_at: now,
            status: AttemptStatus::Success,
            failure_reason: None,
            device: device.clone(),
        }
    }
}
