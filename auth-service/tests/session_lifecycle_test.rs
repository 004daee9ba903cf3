mod common;

use auth_service::models::outbox::USER_DELETED;
use auth_service::models::UserStatus;
use auth_service::services::store::SessionStore;
use auth_service::services::{AuthSettings, ServiceError};
use chrono::Duration;
use common::{ctx, login_request, TestHarness, STRONG_PASSWORD};

#[tokio::test]
async fn test_register_then_login_issues_editor_session() {
    let h = TestHarness::new().await;
    let user_id = h.register("Alice@Example.com", "EDITOR").await;

    let session = h.login("alice@example.com").await;
    assert_eq!(session.user_id, user_id);
    assert_eq!(session.expires_in, 86_400);

    let claims = h.auth.validate_token(&ctx(), &session.token).await.unwrap();
    assert_eq!(claims.user_id, user_id.to_string());
    assert_eq!(claims.email, "alice@example.com");
    assert_eq!(claims.role, "EDITOR");
    assert_eq!(claims.session_id, session.session_id.to_string());
    assert_eq!(claims.exp - claims.iat, 86_400);
}

#[tokio::test]
async fn test_validate_rejects_garbage_and_empty_tokens() {
    let h = TestHarness::new().await;

    let err = h.auth.validate_token(&ctx(), "").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    let err = h.auth.validate_token(&ctx(), "not.a.jwt").await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let h = TestHarness::new().await;
    h.register("exp@example.com", "").await;
    let session = h.login("exp@example.com").await;

    h.clock.advance(Duration::hours(25));
    let err = h.auth.validate_token(&ctx(), &session.token).await.unwrap_err();
    assert!(matches!(err, ServiceError::TokenExpired));
}

#[tokio::test]
async fn test_refresh_moves_expiry_strictly_forward() {
    let h = TestHarness::new().await;
    h.register("refresh@example.com", "").await;
    let session = h.login("refresh@example.com").await;
    let before = h.auth.validate_token(&ctx(), &session.token).await.unwrap();

    // Same instant: the new token must still outlive the old one
    let refreshed = h.auth.refresh(&ctx(), &session.token).await.unwrap();
    let after = h.auth.validate_token(&ctx(), &refreshed.token).await.unwrap();
    assert!(after.exp > before.exp);
    assert_eq!(after.session_id, before.session_id);

    h.clock.advance(Duration::hours(1));
    let again = h.auth.refresh(&ctx(), &refreshed.token).await.unwrap();
    let later = h.auth.validate_token(&ctx(), &again.token).await.unwrap();
    assert!(later.exp > after.exp);
    assert_eq!(again.expires_in, 86_400);
}

#[tokio::test]
async fn test_logout_revokes_session_and_is_idempotent() {
    let h = TestHarness::new().await;
    h.register("dave@example.com", "").await;
    let session = h.login("dave@example.com").await;

    assert_eq!(h.auth.logout(&ctx(), &session.token).await.unwrap(), 1);

    let err = h.auth.validate_token(&ctx(), &session.token).await.unwrap_err();
    assert!(matches!(err, ServiceError::SessionRevoked));
    assert_eq!(err.kind(), "session_revoked");

    // A second logout finds nothing left to revoke
    assert_eq!(h.auth.logout(&ctx(), &session.token).await.unwrap(), 0);

    let err = h.auth.refresh(&ctx(), &session.token).await.unwrap_err();
    assert!(matches!(err, ServiceError::SessionRevoked));
}

#[tokio::test]
async fn test_expired_token_can_still_log_out() {
    let h = TestHarness::new().await;
    let user_id = h.register("stale@example.com", "").await;
    let session = h.login("stale@example.com").await;

    h.clock.advance(Duration::hours(25));
    assert_eq!(h.auth.logout(&ctx(), &session.token).await.unwrap(), 1);

    let stored = SessionStore::get_by_id(&*h.store, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.user_id, user_id);
    assert!(stored.is_revoked());

    // A forged token is still refused
    let err = h.auth.logout(&ctx(), "not.a.token").await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn test_logout_all_revokes_every_session() {
    let h = TestHarness::new().await;
    let user_id = h.register("erin@example.com", "").await;
    let first = h.login("erin@example.com").await;
    let second = h.login("erin@example.com").await;
    let third = h.login("erin@example.com").await;

    assert_eq!(h.auth.logout_all(&ctx(), &second.token).await.unwrap(), 3);

    for token in [&first.token, &second.token, &third.token] {
        let err = h.auth.validate_token(&ctx(), token).await.unwrap_err();
        assert!(matches!(err, ServiceError::SessionRevoked));
    }
    let sessions = h.store.list_by_user(user_id).await.unwrap();
    assert!(sessions.iter().all(|s| s.revoked_at.is_some()));

    // A fresh login still works afterwards
    let fresh = h.login("erin@example.com").await;
    assert!(h.auth.validate_token(&ctx(), &fresh.token).await.is_ok());
}

#[tokio::test]
async fn test_idle_session_expires_before_token() {
    let h = TestHarness::with_settings(AuthSettings {
        session_ttl: std::time::Duration::from_secs(3600),
        ..AuthSettings::default()
    })
    .await;
    h.register("idle@example.com", "").await;
    let session = h.login("idle@example.com").await;

    // Activity slides the session forward
    let mut token = session.token;
    for _ in 0..3 {
        h.clock.advance(Duration::minutes(50));
        token = h.auth.refresh(&ctx(), &token).await.unwrap().token;
    }
    assert!(h.auth.validate_token(&ctx(), &token).await.is_ok());

    h.clock.advance(Duration::minutes(61));
    let err = h.auth.validate_token(&ctx(), &token).await.unwrap_err();
    assert!(matches!(err, ServiceError::SessionExpired));
}

#[tokio::test]
async fn test_delete_account_revokes_and_announces() {
    let h = TestHarness::new().await;
    let user_id = h.register("frank@example.com", "").await;
    let session = h.login("frank@example.com").await;

    h.auth.delete_account(&ctx(), &session.token).await.unwrap();

    let err = h.auth.validate_token(&ctx(), &session.token).await.unwrap_err();
    assert!(matches!(err, ServiceError::SessionRevoked));

    let err = h
        .auth
        .login(&ctx(), login_request("frank@example.com", STRONG_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidCredentials));

    let identity = h
        .auth
        .get_user_identity(&ctx(), &user_id.to_string())
        .await
        .unwrap();
    assert_eq!(identity.status(), UserStatus::Deleted);

    let deleted = h.outbox_events_of(USER_DELETED);
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].partition_key, user_id.to_string());
    assert_eq!(deleted[0].data["email"], "frank@example.com");
}

#[tokio::test]
async fn test_get_user_identity_lookups() {
    let h = TestHarness::new().await;
    let user_id = h.register("grace@example.com", "CREATOR").await;

    let user = h
        .auth
        .get_user_identity(&ctx(), &user_id.to_string())
        .await
        .unwrap();
    assert_eq!(user.email, "grace@example.com");
    assert_eq!(user.role_name, "CREATOR");
    assert_eq!(user.status(), UserStatus::Active);

    let err = h.auth.get_user_identity(&ctx(), "nope").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    let err = h
        .auth
        .get_user_identity(&ctx(), &uuid::Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_public_keys_verify_issued_tokens() {
    let h = TestHarness::new().await;
    h.register("keys@example.com", "").await;
    let session = h.login("keys@example.com").await;

    let jwks = h.auth.public_keys();
    assert_eq!(jwks.keys.len(), 1);
    let key = &jwks.keys[0];
    assert_eq!(key.kid, common::SIGNER_KID);
    assert_eq!(key.kty, "RSA");
    assert_eq!(key.alg, "RS256");

    let header = jsonwebtoken::decode_header(&session.token).unwrap();
    assert_eq!(header.kid.as_deref(), Some(common::SIGNER_KID));

    let decoding = jsonwebtoken::DecodingKey::from_rsa_components(&key.n, &key.e).unwrap();
    let decoded = jsonwebtoken::decode::<service_core::auth::SessionClaims>(
        &session.token,
        &decoding,
        &service_core::auth::session_validation(),
    )
    .unwrap();
    assert_eq!(decoded.claims.email, "keys@example.com");
}
