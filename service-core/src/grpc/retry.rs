//! Retry with exponential backoff for calls to peer services.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tonic::{Code, Status};
use tracing::{info, warn};

use crate::context::RequestContext;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each wait.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);
        if self.add_jitter && backoff_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 4);
            duration += Duration::from_millis(jitter);
        }
        duration
    }
}

/// Transient failures worth another attempt. Authentication failures never are.
pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::Aborted | Code::DeadlineExceeded | Code::Unknown
    )
}

/// Run `f` until it succeeds, fails permanently, exhausts retries, or `ctx` ends.
pub async fn retry_grpc_call<F, Fut, T>(
    ctx: &RequestContext,
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T, Status>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let mut attempt = 0;

    loop {
        let result = ctx
            .run(f())
            .await
            .map_err(|e| Status::deadline_exceeded(e.to_string()))?;

        match result {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "gRPC call succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(status) if attempt >= config.max_retries || !is_retryable(&status) => {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    code = ?status.code(),
                    "gRPC call failed"
                );
                return Err(status);
            }
            Err(status) => {
                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    code = ?status.code(),
                    backoff_ms = backoff.as_millis() as u64,
                    "gRPC call failed, retrying after backoff"
                );
                ctx.sleep(backoff)
                    .await
                    .map_err(|e| Status::deadline_exceeded(e.to_string()))?;
                attempt += 1;
            }
        }
    }
}
