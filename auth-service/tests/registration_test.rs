mod common;

use auth_service::models::outbox::{SCHEMA_VERSION, SOURCE_SERVICE, USER_REGISTERED};
use auth_service::services::auth::{LegacyOidcFields, RegisterRequest};
use auth_service::services::store::UserStore;
use auth_service::services::{AuthSettings, LimitPolicy, ServiceError};
use auth_service::utils::Password;
use chrono::Duration;
use common::{ctx, register_request, TestHarness};

fn with_password(email: &str, password: &str) -> RegisterRequest {
    RegisterRequest {
        password: Password::new(password.to_string()),
        ..register_request(email, "")
    }
}

/// A password of exactly `len` characters that passes every other rule.
fn password_of_len(len: usize) -> String {
    let base = "Aa1!";
    format!("{}{}", base, "x".repeat(len - base.len()))
}

#[tokio::test]
async fn test_registration_writes_user_and_event_together() {
    let h = TestHarness::new().await;
    let user_id = h.register("alice@example.com", "EDITOR").await;

    let user = h.store.get_by_id(user_id).await.unwrap().unwrap();
    assert_eq!(user.email, "alice@example.com");
    assert_eq!(user.role_name, "EDITOR");
    assert!(user.has_password());
    assert!(!user.email_verified);

    let events = h.outbox_events_of(USER_REGISTERED);
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.source_service, SOURCE_SERVICE);
    assert_eq!(event.schema_version, SCHEMA_VERSION);
    assert_eq!(event.partition_key_path, "data.email");
    assert_eq!(event.partition_key, "alice@example.com");
    assert_eq!(event.data["user_id"], user_id.to_string());
}

#[tokio::test]
async fn test_failed_registration_leaves_no_event() {
    let h = TestHarness::new().await;
    h.register("taken@example.com", "").await;

    let err = h
        .auth
        .register(&ctx(), register_request("TAKEN@example.com", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    assert_eq!(h.store.user_count().unwrap(), 1);
    assert_eq!(h.outbox_events_of(USER_REGISTERED).len(), 1);
}

#[tokio::test]
async fn test_idempotent_replay_and_conflict() {
    let h = TestHarness::new().await;
    let request = RegisterRequest {
        idempotency_key: Some("idem-1".into()),
        ..register_request("alice@example.com", "EDITOR")
    };

    let first = h.auth.register(&ctx(), request.clone()).await.unwrap();
    let replay = h.auth.register(&ctx(), request.clone()).await.unwrap();
    assert_eq!(first, replay);
    assert_eq!(h.store.user_count().unwrap(), 1);
    assert_eq!(h.outbox_events_of(USER_REGISTERED).len(), 1);

    let different = RegisterRequest {
        role: "CREATOR".into(),
        ..request
    };
    let err = h.auth.register(&ctx(), different).await.unwrap_err();
    assert!(matches!(err, ServiceError::IdempotencyConflict));
    assert_eq!(err.kind(), "idempotency_conflict");
}

#[tokio::test]
async fn test_same_key_with_other_password_conflicts() {
    let h = TestHarness::new().await;
    let first = RegisterRequest {
        idempotency_key: Some("idem-pw".into()),
        ..with_password("carol@example.com", "StrongPass123!")
    };
    let user_id = h.auth.register(&ctx(), first).await.unwrap();

    let other_password = RegisterRequest {
        idempotency_key: Some("idem-pw".into()),
        ..with_password("carol@example.com", "OtherStrong456?")
    };
    let err = h.auth.register(&ctx(), other_password).await.unwrap_err();
    assert!(matches!(err, ServiceError::IdempotencyConflict));

    // The original body still replays
    let replay = RegisterRequest {
        idempotency_key: Some("idem-pw".into()),
        ..with_password("carol@example.com", "StrongPass123!")
    };
    assert_eq!(h.auth.register(&ctx(), replay).await.unwrap(), user_id);
    assert_eq!(h.store.user_count().unwrap(), 1);
}

#[tokio::test]
async fn test_failed_registration_releases_idempotency_key() {
    let h = TestHarness::new().await;
    h.register("bob@example.com", "").await;

    let request = RegisterRequest {
        idempotency_key: Some("idem-2".into()),
        ..register_request("bob@example.com", "")
    };
    let err = h.auth.register(&ctx(), request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // The key is free again for a different body
    let retry = RegisterRequest {
        idempotency_key: Some("idem-2".into()),
        ..register_request("bobby@example.com", "")
    };
    assert!(h.auth.register(&ctx(), retry).await.is_ok());
}

#[tokio::test]
async fn test_password_length_boundaries() {
    let h = TestHarness::new().await;

    let err = h
        .auth
        .register(&ctx(), with_password("p11@example.com", &password_of_len(11)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    h.auth
        .register(&ctx(), with_password("p12@example.com", &password_of_len(12)))
        .await
        .unwrap();
    h.auth
        .register(&ctx(), with_password("p128@example.com", &password_of_len(128)))
        .await
        .unwrap();

    let err = h
        .auth
        .register(&ctx(), with_password("p129@example.com", &password_of_len(129)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));
}

#[tokio::test]
async fn test_weak_passwords_rejected() {
    let h = TestHarness::new().await;
    for weak in ["alllowercase1!", "NoDigitsHere!!", "NoSymbols12345", "MyPassword12!"] {
        let err = h
            .auth
            .register(&ctx(), with_password("weak@example.com", weak))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)), "{}", weak);
    }
    assert_eq!(h.store.user_count().unwrap(), 0);
}

#[tokio::test]
async fn test_role_selection_rules() {
    let h = TestHarness::new().await;

    let user_id = h.register("default@example.com", "").await;
    let user = h.store.get_by_id(user_id).await.unwrap().unwrap();
    assert_eq!(user.role_name, "USER");

    let user_id = h.register("creator@example.com", "creator").await;
    let user = h.store.get_by_id(user_id).await.unwrap().unwrap();
    assert_eq!(user.role_name, "CREATOR");

    let err = h
        .auth
        .register(&ctx(), register_request("admin@example.com", "ADMIN"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    let err = h
        .auth
        .register(&ctx(), register_request("ghost@example.com", "WIZARD"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));
}

#[tokio::test]
async fn test_terms_and_email_are_required() {
    let h = TestHarness::new().await;

    let err = h
        .auth
        .register(
            &ctx(),
            RegisterRequest {
                terms_accepted: false,
                ..register_request("terms@example.com", "")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    let err = h
        .auth
        .register(&ctx(), register_request("not-an-email", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));
}

#[tokio::test]
async fn test_provider_fields_are_redirected_to_oidc_flow() {
    let h = TestHarness::new().await;
    let request = RegisterRequest {
        legacy_oidc: LegacyOidcFields {
            provider: "google".into(),
            code: "abc".into(),
            ..Default::default()
        },
        ..register_request("legacy@example.com", "")
    };

    let err = h.auth.register(&ctx(), request).await.unwrap_err();
    assert!(matches!(err, ServiceError::OidcFlowRequired));
    assert_eq!(err.kind(), "oidc_flow_required");
    assert_eq!(h.store.user_count().unwrap(), 0);
}

#[tokio::test]
async fn test_registration_rate_limit_per_ip() {
    let h = TestHarness::with_settings(AuthSettings {
        register_limit: LimitPolicy::new(3, std::time::Duration::from_secs(3600)),
        ..AuthSettings::default()
    })
    .await;

    for i in 0..3 {
        let request = RegisterRequest {
            ip_address: "198.51.100.7".into(),
            ..register_request(&format!("user{}@example.com", i), "")
        };
        h.auth.register(&ctx(), request).await.unwrap();
    }

    let request = RegisterRequest {
        ip_address: "198.51.100.7".into(),
        ..register_request("user3@example.com", "")
    };
    let err = h.auth.register(&ctx(), request.clone()).await.unwrap_err();
    match err {
        ServiceError::RateLimited { retry_after } => assert!(retry_after.is_some()),
        other => panic!("expected rate_limited, got {:?}", other),
    }

    // The window rolls over
    h.clock.advance(Duration::seconds(3601));
    assert!(h.auth.register(&ctx(), request).await.is_ok());
}
