use rand::{rngs::OsRng, RngCore};
use service_core::context::RequestContext;
use uuid::Uuid;

use super::login::authenticator;
use super::AuthService;
use crate::models::mfa::{generate_backup_codes, hash_backup_code};
use crate::models::MfaMethodKind;
use crate::services::crypto::totp_secret_aad;
use crate::services::error::{ServiceError, ServiceResult};

const TOTP_SECRET_BYTES: usize = 20;

/// What an authenticator app needs to start producing codes.
#[derive(Debug, Clone)]
pub struct EnrolledAuthenticator {
    pub secret_base32: String,
    pub otpauth_url: String,
}

impl AuthService {
    /// Enable or disable one method. Enabling the authenticator needs an enrolled secret.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, method = %method))]
    pub async fn set_mfa_method(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        method: &str,
        enabled: bool,
        primary: bool,
    ) -> ServiceResult<()> {
        self.observe(ctx, "set_mfa_method", async {
            let kind: MfaMethodKind = method.parse().map_err(ServiceError::InvalidInput)?;
            let user = self.load_active_user(user_id).await?;

            if kind == MfaMethodKind::AuthenticatorApp && enabled {
                let enrolled = self
                    .mfa
                    .get_totp_secret(user.id)
                    .await?
                    .map(|s| !s.deactivated)
                    .unwrap_or(false);
                if !enrolled {
                    return Err(ServiceError::invalid_input(
                        "enroll an authenticator before enabling it",
                    ));
                }
            }

            self.mfa
                .upsert_method(user.id, kind, enabled, enabled && primary, self.now())
                .await?;
            tracing::info!(user_id = %user.id, method = %kind, enabled, primary, "MFA method updated");
            Ok(())
        })
        .await
    }

    /// Generate and store a fresh authenticator secret.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn enroll_authenticator(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
    ) -> ServiceResult<EnrolledAuthenticator> {
        self.observe(ctx, "enroll_authenticator", async {
            let user = self.load_active_user(user_id).await?;

            let mut secret = vec![0u8; TOTP_SECRET_BYTES];
            OsRng.fill_bytes(&mut secret);

            let sealed = self
                .cipher
                .seal(&secret, &totp_secret_aad(user.id))
                .map_err(ServiceError::Internal)?;
            self.mfa
                .upsert_totp_secret(user.id, &sealed, self.now())
                .await?;

            let secret_base32 =
                base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &secret);
            let totp = authenticator(
                secret,
                Some(self.settings.totp_issuer.clone()),
                user.email.clone(),
            )?;

            tracing::info!(user_id = %user.id, "Authenticator enrolled");
            Ok(EnrolledAuthenticator {
                secret_base32,
                otpauth_url: totp.get_url(),
            })
        })
        .await
    }

    /// Replace all backup codes; the plaintext codes are only returned here.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn regenerate_backup_codes(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
    ) -> ServiceResult<Vec<String>> {
        self.observe(ctx, "regenerate_backup_codes", async {
            let user = self.load_active_user(user_id).await?;
            let codes = generate_backup_codes();
            let hashes: Vec<String> = codes.iter().map(|c| hash_backup_code(c)).collect();
            self.mfa
                .replace_backup_codes(user.id, &hashes, self.now())
                .await?;
            tracing::info!(user_id = %user.id, count = codes.len(), "Backup codes regenerated");
            Ok(codes)
        })
        .await
    }
}
