//! service-core: Shared infrastructure for micros microservices.
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod grpc;
pub mod observability;

pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tokio_util;
pub use tonic;
pub use tracing;
pub use validator;
