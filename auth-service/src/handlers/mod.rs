//! HTTP handlers. The authentication operations themselves are served over gRPC.

pub mod health;
pub mod metrics;
pub mod well_known;
