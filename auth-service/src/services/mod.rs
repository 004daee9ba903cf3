//! Services layer for auth-service.
//!
//! Storage traits with their PostgreSQL, Redis and in-memory backends, the
//! token and crypto primitives, the background workers, and the `AuthService`
//! orchestrator built on top of them.

pub mod auth;
pub mod clock;
pub mod crypto;
mod database;
pub mod ephemeral;
pub mod error;
pub mod jwt;
pub mod lockout;
pub mod memory;
pub mod metrics;
pub mod oidc;
pub mod outbox;
pub mod redis;
pub mod store;
pub mod token_refresh;

pub use auth::{AuthDeps, AuthService, AuthSettings, RefreshedToken, SessionToken};
pub use clock::{system_clock, Clock, ManualClock};
pub use crypto::SecretCipher;
pub use database::Database;
pub use ephemeral::EphemeralState;
pub use error::{ServiceError, ServiceResult, StoreError, StoreResult};
pub use jwt::{JwtService, TokenError};
pub use lockout::{LimitPolicy, LockoutEngine};
pub use memory::MemoryStore;
pub use oidc::{OidcError, OidcVerifier};
pub use outbox::{EventPublisher, LogPublisher, OutboxWorker, OutboxWorkerConfig, RedisStreamPublisher};
pub use redis::{
    AttemptCounter, EphemeralStore, MemoryAttemptCounter, MemoryEphemeralStore, RedisService,
};
pub use token_refresh::{TokenRefreshConfig, TokenRefresher};
