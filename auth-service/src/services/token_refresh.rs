//! Background refresh of stored provider tokens.
//!
//! Each pass lists tokens whose access token expires inside the refresh window
//! and redeems their refresh tokens. A token that still fails after the last
//! attempt marks the user's connections through that provider as expired.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use service_core::context::RequestContext;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::crypto::{provider_token_aad, SecretCipher};
use super::error::StoreResult;
use super::metrics;
use super::oidc::{OidcError, OidcVerifier, ProviderTokens};
use super::store::OAuthStore;
use crate::config::OidcConfig;
use crate::models::{ConnectionStatus, OAuthToken};

#[derive(Debug, Clone)]
pub struct TokenRefreshConfig {
    pub interval: Duration,
    pub window: Duration,
    pub batch_size: i64,
    pub max_attempts: u32,
    /// First backoff wait; doubles after every failed attempt.
    pub initial_backoff: Duration,
}

impl From<&OidcConfig> for TokenRefreshConfig {
    fn from(config: &OidcConfig) -> Self {
        Self {
            interval: config.refresh_interval,
            window: config.refresh_window,
            batch_size: config.refresh_batch_size.max(1),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub scanned: usize,
    pub refreshed: usize,
    pub expired: usize,
}

enum Attempt {
    Refreshed(ProviderTokens),
    Failed(String),
    Cancelled,
}

#[derive(Clone)]
pub struct TokenRefresher {
    oauth: Arc<dyn OAuthStore>,
    oidc: OidcVerifier,
    cipher: SecretCipher,
    clock: Clock,
    config: TokenRefreshConfig,
}

impl TokenRefresher {
    pub fn new(
        oauth: Arc<dyn OAuthStore>,
        oidc: OidcVerifier,
        cipher: SecretCipher,
        clock: Clock,
        config: TokenRefreshConfig,
    ) -> Self {
        Self {
            oauth,
            oidc,
            cipher,
            clock,
            config,
        }
    }

    /// One pass over the expiring tokens. Stops early when `ctx` is cancelled.
    pub async fn run_once(&self, ctx: &RequestContext) -> StoreResult<RefreshReport> {
        let now = (self.clock)();
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let tokens = self
            .oauth
            .list_expiring_tokens(now + window, self.config.batch_size)
            .await?;

        let mut report = RefreshReport {
            scanned: tokens.len(),
            ..RefreshReport::default()
        };

        for token in &tokens {
            match self.refresh_with_retry(ctx, token).await {
                Attempt::Refreshed(fresh) => {
                    self.store_refreshed(token, fresh).await?;
                    self.oauth
                        .set_provider_status(token.user_id, &token.provider, ConnectionStatus::Active)
                        .await?;
                    metrics::record_token_refresh("refreshed");
                    report.refreshed += 1;
                }
                Attempt::Failed(reason) => {
                    tracing::warn!(
                        user_id = %token.user_id,
                        provider = %token.provider,
                        reason = %reason,
                        "Provider token refresh failed, marking connection expired"
                    );
                    self.oauth
                        .set_provider_status(token.user_id, &token.provider, ConnectionStatus::Expired)
                        .await?;
                    metrics::record_token_refresh("expired");
                    report.expired += 1;
                }
                Attempt::Cancelled => break,
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                refreshed = report.refreshed,
                expired = report.expired,
                "Provider token refresh pass finished"
            );
        }
        Ok(report)
    }

    async fn refresh_with_retry(&self, ctx: &RequestContext, token: &OAuthToken) -> Attempt {
        let Some(sealed) = token.refresh_token_encrypted.as_deref() else {
            return Attempt::Failed("no refresh token".to_string());
        };
        let refresh_token = match self.cipher.open_str(
            sealed,
            &provider_token_aad(token.user_id, &token.provider, "refresh"),
        ) {
            Ok(rt) => rt,
            Err(e) => return Attempt::Failed(format!("cannot decrypt refresh token: {}", e)),
        };

        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.config.initial_backoff * 8)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 1;
        loop {
            match self
                .oidc
                .refresh(ctx, &token.provider, &refresh_token, (self.clock)())
                .await
            {
                Ok(fresh) => return Attempt::Refreshed(fresh),
                Err(OidcError::UnknownProvider(alias)) => {
                    return Attempt::Failed(format!("provider {} is not configured", alias));
                }
                Err(e) if attempt >= self.config.max_attempts => return Attempt::Failed(e.to_string()),
                Err(e) => {
                    let wait = schedule.next_backoff().unwrap_or(self.config.initial_backoff);
                    tracing::debug!(
                        provider = %token.provider,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Provider token refresh attempt failed"
                    );
                    if ctx.sleep(wait).await.is_err() {
                        return Attempt::Cancelled;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Replace the access token; keep the old refresh token when none came back.
    async fn store_refreshed(&self, token: &OAuthToken, fresh: ProviderTokens) -> StoreResult<()> {
        let seal = |value: &str, kind: &str| {
            self.cipher
                .seal_str(value, &provider_token_aad(token.user_id, &token.provider, kind))
                .map_err(super::error::StoreError::Backend)
        };

        let access = seal(&fresh.access_token, "access")?;
        let refresh = match fresh.refresh_token.as_deref() {
            Some(rt) if !rt.is_empty() => Some(seal(rt, "refresh")?),
            _ => token.refresh_token_encrypted.clone(),
        };

        self.oauth
            .upsert_token(&OAuthToken {
                user_id: token.user_id,
                provider: token.provider.clone(),
                access_token_encrypted: access,
                refresh_token_encrypted: refresh,
                expires_at: fresh.expires_at,
                updated_at: (self.clock)(),
            })
            .await
    }

    /// Run a pass every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                window_secs = self.config.window.as_secs(),
                "Provider token refresher started"
            );

            loop {
                let ctx = RequestContext::with_cancellation(cancel.child_token());
                if let Err(err) = self.run_once(&ctx).await {
                    tracing::error!(error = %err, "Provider token refresh pass failed");
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }

            tracing::info!("Provider token refresher stopped");
        })
    }
}
