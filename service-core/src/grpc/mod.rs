//! gRPC utilities for micros microservices.
//!
//! - Error conversion between `AppError` and `tonic::Status`
//! - Server assembly (transport settings, health, reflection)
//! - Retry with backoff for service-to-service calls
//! - Auth service client for peers

pub mod auth_client;
pub mod error;
pub mod retry;
pub mod server;

pub mod proto {
    pub mod auth {
        tonic::include_proto!("micros.auth.v1");
    }
}

pub use auth_client::{AuthClient, AuthClientConfig};
pub use error::{ERROR_CODE_METADATA, GrpcResult, IntoStatus};
pub use retry::{RetryConfig, is_retryable, retry_grpc_call};
pub use server::{GrpcServerBuilder, create_health_service, create_reflection_service};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
