//! Failed-login lockout and request rate limiting on top of [`AttemptCounter`].
//!
//! The engine knows nothing about policy: callers choose the key, the
//! threshold and the lock window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::error::StoreResult;
use super::redis::{AttemptCounter, LockoutState};

/// Threshold and lock window for one use of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub max: u32,
    pub window: Duration,
}

impl LimitPolicy {
    pub fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }
}

/// Outcome of counting a rate-limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Option<u64> },
}

pub fn login_key(email: &str) -> String {
    format!("login:{}", email)
}

pub fn register_ip_key(ip: &str) -> String {
    format!("register:ip:{}", ip)
}

pub fn register_identifier_key(identifier: &str) -> String {
    format!("register:identifier:{}", identifier)
}

pub fn oidc_authorize_ip_key(ip: &str) -> String {
    format!("oidc-authorize:ip:{}", ip)
}

pub fn oidc_authorize_identifier_key(identifier: &str) -> String {
    format!("oidc-authorize:identifier:{}", identifier)
}

pub fn mfa_key(temp_token: &str) -> String {
    format!("mfa:{}", temp_token)
}

#[derive(Clone)]
pub struct LockoutEngine {
    counter: Arc<dyn AttemptCounter>,
}

impl LockoutEngine {
    pub fn new(counter: Arc<dyn AttemptCounter>) -> Self {
        Self { counter }
    }

    pub async fn state(&self, key: &str) -> StoreResult<LockoutState> {
        self.counter.get(key).await
    }

    /// Count one failure. Only the returned post-increment state is authoritative.
    pub async fn record_failure(
        &self,
        key: &str,
        policy: LimitPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<LockoutState> {
        let state = self
            .counter
            .increment(key, policy.max, policy.window, now)
            .await?;
        if state.is_locked(now) {
            tracing::warn!(
                key = %key,
                failed_count = state.failed_count,
                locked_until = ?state.locked_until,
                "Lockout threshold reached"
            );
        }
        Ok(state)
    }

    pub async fn clear(&self, key: &str) -> StoreResult<()> {
        self.counter.clear(key).await
    }

    /// Count a request against a rate limit.
    ///
    /// The request that reaches the threshold is still allowed; later ones are
    /// limited until the lock clears. Counter errors allow the request.
    pub async fn hit(&self, key: &str, policy: LimitPolicy, now: DateTime<Utc>) -> RateDecision {
        match self.counter.get(key).await {
            Ok(state) if state.is_locked(now) => {
                return RateDecision::Limited {
                    retry_after: state.retry_after(now),
                };
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rate limit read failed, allowing request");
                return RateDecision::Allowed;
            }
        }

        if let Err(e) = self.counter.increment(key, policy.max, policy.window, now).await {
            tracing::warn!(key = %key, error = %e, "Rate limit write failed, allowing request");
        }
        RateDecision::Allowed
    }
}
