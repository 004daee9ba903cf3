pub mod login_attempt;
pub mod mfa;
pub mod oauth;
pub mod outbox;
pub mod role;
pub mod session;
pub mod user;

pub use login_attempt::{AttemptStatus, LoginAttempt};
pub use mfa::{MfaMethod, MfaMethodKind, MfaMethodRow, TotpSecretRecord};
pub use oauth::{ConnectionStatus, OAuthConnection, OAuthToken};
pub use outbox::{EventEnvelope, NewOutboxEvent, OutboxRecord};
pub use role::Role;
pub use session::{DeviceContext, RevokeOutcome, Session};
pub use user::{NewUser, User, UserStatus};
