//! Outbox publisher.
//!
//! Producers write `outbox_events` rows in the same transaction as the state
//! change they announce. This worker claims batches of those rows, hands each
//! one to an [`EventPublisher`], and records the outcome. Every update is
//! conditional on the claim token, so a worker whose claim expired cannot
//! overwrite the work of the worker that reclaimed the row.
//!
//! Delivery is at-least-once; consumers dedupe on `event_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::Clock;
use super::error::StoreResult;
use super::metrics;
use super::store::OutboxStore;
use crate::config::OutboxConfig;
use crate::models::OutboxRecord;

/// Event sink abstraction used by the outbox worker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Deliver one event or return an error to schedule a retry.
    async fn publish(&self, record: &OutboxRecord) -> Result<(), anyhow::Error>;
}

/// Appends events to a Redis stream.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    manager: ConnectionManager,
    stream: String,
}

impl RedisStreamPublisher {
    pub fn new(manager: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            manager,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, record: &OutboxRecord) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("event_id")
            .arg(record.event_id.to_string())
            .arg("event_type")
            .arg(&record.event_type)
            .arg("partition_key")
            .arg(&record.partition_key)
            .arg("payload")
            .arg(record.payload.as_slice())
            .query_async(&mut conn)
            .await?;
        tracing::debug!(
            event_id = %record.event_id,
            stream = %self.stream,
            entry_id = %entry_id,
            "Event appended to stream"
        );
        Ok(())
    }
}

/// Local dev sink that logs events instead of publishing them.
#[derive(Clone, Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, record: &OutboxRecord) -> Result<(), anyhow::Error> {
        tracing::info!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            partition_key = %record.partition_key,
            payload_bytes = record.payload.len(),
            "outbox publish stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OutboxWorkerConfig {
    poll_interval: Duration,
    batch_size: i64,
    claim_ttl: Duration,
    max_retries: i32,
}

impl OutboxWorkerConfig {
    /// Default worker config: 2s poll interval, 100 rows per batch,
    /// 30s claim TTL, 5 attempts before dead-lettering.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 100,
            claim_ttl: Duration::from_secs(30),
            max_retries: 5,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            poll_interval: if self.poll_interval.is_zero() {
                Duration::from_secs(1)
            } else {
                self.poll_interval
            },
            batch_size: self.batch_size.max(1),
            claim_ttl: if self.claim_ttl.is_zero() {
                Duration::from_secs(30)
            } else {
                self.claim_ttl
            },
            max_retries: self.max_retries.max(1),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        self.claim_ttl
    }

    #[must_use]
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&OutboxConfig> for OutboxWorkerConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self::new()
            .with_poll_interval(config.poll_interval)
            .with_batch_size(config.batch_size)
            .with_claim_ttl(config.claim_ttl)
            .with_max_retries(config.max_retries)
    }
}

/// What one pass over the outbox did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Rows whose claim was taken over before this worker finished with them.
    pub lost_claims: usize,
}

#[derive(Clone)]
pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxWorkerConfig,
    clock: Clock,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxWorkerConfig,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            publisher,
            config: config.normalize(),
            clock,
        }
    }

    /// Claim one batch and settle every row in it.
    pub async fn run_once(&self) -> StoreResult<BatchReport> {
        let claim_ttl = chrono::Duration::from_std(self.config.claim_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let batch = self
            .store
            .claim_batch((self.clock)(), self.config.batch_size(), claim_ttl)
            .await?;

        let mut report = BatchReport {
            claimed: batch.records.len(),
            ..BatchReport::default()
        };

        for record in &batch.records {
            self.settle(record, batch.claim_token, &mut report).await?;
        }

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                published = report.published,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                lost_claims = report.lost_claims,
                "Outbox batch processed"
            );
        }
        Ok(report)
    }

    async fn settle(
        &self,
        record: &OutboxRecord,
        claim_token: Uuid,
        report: &mut BatchReport,
    ) -> StoreResult<()> {
        let max_retries = self.config.max_retries();

        if record.retry_count >= max_retries {
            let applied = self
                .store
                .mark_dead_lettered(
                    record.event_id,
                    claim_token,
                    record.last_error.as_deref(),
                    (self.clock)(),
                )
                .await?;
            self.count(record, applied, "dead_lettered", report);
            return Ok(());
        }

        match self.publisher.publish(record).await {
            Ok(()) => {
                let applied = self
                    .store
                    .mark_published(record.event_id, claim_token, (self.clock)())
                    .await?;
                self.count(record, applied, "published", report);
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    retry_count = record.retry_count,
                    error = %error,
                    "Outbox publish failed"
                );
                let now = (self.clock)();
                if record.retry_count + 1 >= max_retries {
                    let applied = self
                        .store
                        .mark_dead_lettered(record.event_id, claim_token, Some(&error), now)
                        .await?;
                    self.count(record, applied, "dead_lettered", report);
                } else {
                    let applied = self
                        .store
                        .record_failure(record.event_id, claim_token, &error, now)
                        .await?;
                    self.count(record, applied, "retried", report);
                }
            }
        }
        Ok(())
    }

    fn count(&self, record: &OutboxRecord, applied: bool, outcome: &str, report: &mut BatchReport) {
        if !applied {
            tracing::warn!(
                event_id = %record.event_id,
                outcome = outcome,
                "Outbox claim lost before the row was settled"
            );
            report.lost_claims += 1;
            return;
        }

        match outcome {
            "published" => report.published += 1,
            "retried" => report.retried += 1,
            _ => {
                tracing::error!(
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    "Outbox event dead-lettered"
                );
                report.dead_lettered += 1;
            }
        }
        metrics::record_outbox_event(&record.event_type, outcome);
    }

    /// Poll until `cancel` fires. A failed batch is logged and retried next tick.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let poll_interval = self.config.poll_interval();
            tracing::info!(
                poll_interval_ms = poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size(),
                "Outbox worker started"
            );

            loop {
                if let Err(err) = self.run_once().await {
                    tracing::error!(error = %err, "Outbox batch failed");
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            tracing::info!("Outbox worker stopped");
        })
    }
}
