mod common;

use std::time::Duration;

use auth_service::models::ConnectionStatus;
use auth_service::services::auth::CallbackOutcome;
use auth_service::services::crypto::provider_token_aad;
use auth_service::services::store::OAuthStore;
use auth_service::services::{OidcVerifier, TokenRefreshConfig, TokenRefresher};
use common::{ctx, device, IdpIdentity, TestHarness};
use uuid::Uuid;

fn refresher(h: &TestHarness) -> TokenRefresher {
    TokenRefresher::new(
        h.store.clone(),
        OidcVerifier::new(&h.idp().oidc_config()).unwrap(),
        h.cipher.clone(),
        h.clock.clock(),
        TokenRefreshConfig {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(24 * 3600),
            batch_size: 10,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
        },
    )
}

async fn signed_in_user(h: &TestHarness, code: &str, subject: &str, email: &str) -> Uuid {
    let identity = IdpIdentity::verified(subject, email);
    let (state, nonce) = h.begin_oidc(email).await;
    h.idp().expect_code(code, &identity, &nonce).await;
    match h
        .auth
        .oidc_callback(&ctx(), code, &state, device("1.2.3.4"))
        .await
        .unwrap()
    {
        CallbackOutcome::SignedIn { session, .. } => session.user_id,
        CallbackOutcome::RegistrationIncomplete { .. } => panic!("expected a signed-in callback"),
    }
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_and_resealed() {
    let h = TestHarness::with_idp().await;
    let user_id = signed_in_user(&h, "code-rt", "sub-rt", "rt@example.com").await;
    h.idp().expect_refresh("access-refreshed").await;

    let report = refresher(&h).run_once(&ctx()).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.expired, 0);

    let stored = h.store.get_token(user_id, "google").await.unwrap().unwrap();
    let access = h
        .cipher
        .open_str(
            &stored.access_token_encrypted,
            &provider_token_aad(user_id, "google", "access"),
        )
        .unwrap();
    assert_eq!(access, "access-refreshed");

    // No refresh token came back, so the original one is kept
    let refresh = h
        .cipher
        .open_str(
            &stored.refresh_token_encrypted.unwrap(),
            &provider_token_aad(user_id, "google", "refresh"),
        )
        .unwrap();
    assert_eq!(refresh, "refresh-code-rt");
}

#[tokio::test]
async fn test_rejected_refresh_marks_connection_expired() {
    let h = TestHarness::with_idp().await;
    let user_id = signed_in_user(&h, "code-dead", "sub-dead", "dead@example.com").await;

    // No refresh mock: the IdP answers 404 on every attempt
    let report = refresher(&h).run_once(&ctx()).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.refreshed, 0);
    assert_eq!(report.expired, 1);

    let connection = h
        .store
        .get_connection(&h.idp().issuer(), "sub-dead")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.user_id, user_id);
    assert_eq!(connection.status(), ConnectionStatus::Expired);
}

#[tokio::test]
async fn test_nothing_to_refresh_outside_window() {
    let h = TestHarness::with_idp().await;
    signed_in_user(&h, "code-fresh", "sub-fresh", "fresh@example.com").await;

    let refresher = TokenRefresher::new(
        h.store.clone(),
        OidcVerifier::new(&h.idp().oidc_config()).unwrap(),
        h.cipher.clone(),
        h.clock.clock(),
        TokenRefreshConfig {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(60),
            batch_size: 10,
            max_attempts: 1,
            initial_backoff: Duration::from_millis(10),
        },
    );

    let report = refresher.run_once(&ctx()).await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn test_unlinked_identity_stays_revoked_after_refresh_pass() {
    let h = TestHarness::with_idp().await;
    let user_id = h.register("unlinked@example.com", "").await;

    let identity = IdpIdentity::verified("sub-unlinked", "unlinked-idp@example.com");
    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-unlinked", &identity, &nonce).await;
    let linked = h
        .auth
        .link_oidc(&ctx(), user_id, "code-unlinked", &state)
        .await
        .unwrap();
    h.auth
        .unlink_oidc(&ctx(), user_id, &linked.issuer, &linked.subject)
        .await
        .unwrap();
    assert!(h.store.get_token(user_id, "google").await.unwrap().is_none());

    h.idp().expect_refresh("access-after-unlink").await;
    let report = refresher(&h).run_once(&ctx()).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.refreshed, 0);

    let connection = h
        .store
        .get_connection(&linked.issuer, &linked.subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Revoked);
    assert!(h
        .store
        .list_active_connections(user_id)
        .await
        .unwrap()
        .is_empty());
}
