mod common;

use auth_service::models::outbox::USER_REGISTERED;
use auth_service::models::ConnectionStatus;
use auth_service::services::auth::{CallbackOutcome, OidcAuthorizeRequest};
use auth_service::services::crypto::provider_token_aad;
use auth_service::services::store::{OAuthStore, UserStore};
use auth_service::services::{AuthSettings, ServiceError};
use chrono::Duration;
use common::{
    ctx, device, fragment_params, query_param, IdpIdentity, TestHarness, IDP_CLIENT_ID,
    REDIRECT_URI,
};

async fn sign_in(h: &TestHarness, code: &str, identity: &IdpIdentity) -> CallbackOutcome {
    let (state, nonce) = h.begin_oidc(&identity.email).await;
    h.idp().expect_code(code, identity, &nonce).await;
    h.auth
        .oidc_callback(&ctx(), code, &state, device("1.2.3.4"))
        .await
        .unwrap()
}

fn signed_in_user(outcome: &CallbackOutcome) -> uuid::Uuid {
    match outcome {
        CallbackOutcome::SignedIn { session, .. } => session.user_id,
        CallbackOutcome::RegistrationIncomplete { .. } => panic!("expected a signed-in callback"),
    }
}

#[tokio::test]
async fn test_new_user_bootstrap_redirects_with_session_fragment() {
    let h = TestHarness::with_idp().await;

    let started = h
        .auth
        .oidc_authorize(
            &ctx(),
            OidcAuthorizeRequest {
                provider: "google".into(),
                redirect_uri: "https://app.example.com/cb".into(),
                client_context: String::new(),
                login_hint: "oidc@example.com".into(),
                ip_address: "1.2.3.4".into(),
            },
        )
        .await
        .unwrap();
    assert!(started
        .authorize_url
        .starts_with(&format!("{}/authorize", h.idp().issuer())));
    assert_eq!(
        query_param(&started.authorize_url, "state").as_deref(),
        Some(started.state.as_str())
    );
    assert_eq!(
        query_param(&started.authorize_url, "client_id").as_deref(),
        Some(IDP_CLIENT_ID)
    );
    assert_eq!(
        query_param(&started.authorize_url, "code_challenge_method").as_deref(),
        Some("S256")
    );
    let nonce = query_param(&started.authorize_url, "nonce").unwrap();

    let identity = IdpIdentity::verified("provider-sub-1", "oidc@example.com");
    h.idp().expect_code("code-ok", &identity, &nonce).await;

    let outcome = h
        .auth
        .oidc_callback(&ctx(), "code-ok", &started.state, device("1.2.3.4"))
        .await
        .unwrap();
    let CallbackOutcome::SignedIn {
        redirect_url,
        session,
    } = outcome
    else {
        panic!("expected a signed-in callback");
    };

    assert!(redirect_url.starts_with("https://app.example.com/cb#"));
    let fragment = fragment_params(&redirect_url);
    assert_eq!(fragment["token"], session.token);
    assert_eq!(fragment["session_id"], session.session_id.to_string());
    assert_eq!(fragment["user_id"], session.user_id.to_string());

    let claims = h.auth.validate_token(&ctx(), &session.token).await.unwrap();
    assert_eq!(claims.email, "oidc@example.com");
    assert_eq!(claims.role, "USER");

    let user = h.store.get_by_id(session.user_id).await.unwrap().unwrap();
    assert!(user.email_verified);
    assert!(!user.has_password());

    let connection = h
        .store
        .get_connection(&h.idp().issuer(), "provider-sub-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.user_id, session.user_id);
    assert_eq!(connection.status(), ConnectionStatus::Active);
    assert!(connection.is_primary);

    assert_eq!(h.outbox_events_of(USER_REGISTERED).len(), 1);
}

#[tokio::test]
async fn test_provider_tokens_are_sealed_at_rest() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-sealed", "sealed@example.com");
    let user_id = signed_in_user(&sign_in(&h, "code-sealed", &identity).await);

    let stored = h.store.get_token(user_id, "google").await.unwrap().unwrap();
    assert_ne!(stored.access_token_encrypted, b"access-code-sealed".to_vec());

    let access = h
        .cipher
        .open_str(
            &stored.access_token_encrypted,
            &provider_token_aad(user_id, "google", "access"),
        )
        .unwrap();
    assert_eq!(access, "access-code-sealed");

    let refresh = stored.refresh_token_encrypted.expect("refresh token stored");
    assert!(h
        .cipher
        .open_str(&refresh, &provider_token_aad(user_id, "google", "access"))
        .is_err());
    assert_eq!(
        h.cipher
            .open_str(&refresh, &provider_token_aad(user_id, "google", "refresh"))
            .unwrap(),
        "refresh-code-sealed"
    );
}

#[tokio::test]
async fn test_state_is_single_use() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-replay", "replay@example.com");
    let (state, nonce) = h.begin_oidc(&identity.email).await;
    h.idp().expect_code("code-replay", &identity, &nonce).await;

    h.auth
        .oidc_callback(&ctx(), "code-replay", &state, device("1.2.3.4"))
        .await
        .unwrap();
    let err = h
        .auth
        .oidc_callback(&ctx(), "code-replay", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));

    let err = h
        .auth
        .oidc_callback(&ctx(), "code-replay", "made-up-state", device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn test_expired_state_is_rejected() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-slow", "slow@example.com");
    let (state, nonce) = h.begin_oidc(&identity.email).await;
    h.idp().expect_code("code-slow", &identity, &nonce).await;

    h.clock.advance(Duration::minutes(11));
    let err = h
        .auth
        .oidc_callback(&ctx(), "code-slow", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn test_nonce_mismatch_is_rejected() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-nonce", "nonce@example.com");
    let (state, _nonce) = h.begin_oidc(&identity.email).await;
    h.idp()
        .expect_code("code-nonce", &identity, "someone-elses-nonce")
        .await;

    let err = h
        .auth
        .oidc_callback(&ctx(), "code-nonce", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
    assert_eq!(h.store.user_count().unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_code_is_unauthorized() {
    let h = TestHarness::with_idp().await;
    let (state, _) = h.begin_oidc("nobody@example.com").await;

    // No token mock for this code, so the IdP answers 404
    let err = h
        .auth
        .oidc_callback(&ctx(), "code-unknown", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn test_returning_user_reuses_connection() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-return", "return@example.com");

    let first = signed_in_user(&sign_in(&h, "code-return-a", &identity).await);
    let second = signed_in_user(&sign_in(&h, "code-return-b", &identity).await);

    assert_eq!(first, second);
    assert_eq!(h.store.user_count().unwrap(), 1);
}

#[tokio::test]
async fn test_verified_email_links_existing_password_account() {
    let h = TestHarness::with_idp().await;
    let user_id = h.register("linked@example.com", "CREATOR").await;

    let identity = IdpIdentity::verified("sub-linked", "Linked@Example.com");
    let outcome = sign_in(&h, "code-linked", &identity).await;

    assert_eq!(signed_in_user(&outcome), user_id);
    assert_eq!(h.store.user_count().unwrap(), 1);

    // The password still works
    h.login("linked@example.com").await;
}

#[tokio::test]
async fn test_email_linking_disabled_reports_conflict() {
    let h = TestHarness::with_idp_and_settings(AuthSettings {
        allow_email_linking: false,
        ..AuthSettings::default()
    })
    .await;
    h.register("taken@example.com", "").await;

    let identity = IdpIdentity::verified("sub-taken", "taken@example.com");
    let (state, nonce) = h.begin_oidc(&identity.email).await;
    h.idp().expect_code("code-taken", &identity, &nonce).await;

    let err = h
        .auth
        .oidc_callback(&ctx(), "code-taken", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn test_placeholder_collision_never_links_accounts() {
    let h = TestHarness::with_idp().await;

    // Both subjects share the first 12 characters of their placeholder
    let first = IdpIdentity {
        subject: "collide-subject-a".into(),
        email: String::new(),
        email_verified: false,
    };
    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-collide-a", &first, &nonce).await;
    let CallbackOutcome::RegistrationIncomplete { user_id, .. } = h
        .auth
        .oidc_callback(&ctx(), "code-collide-a", &state, device("1.2.3.4"))
        .await
        .unwrap()
    else {
        panic!("expected registration to be incomplete");
    };

    // A verified but unusable email falls back to the same placeholder
    let second = IdpIdentity::verified("collide-subject-b", "not an email");
    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-collide-b", &second, &nonce).await;
    let err = h
        .auth
        .oidc_callback(&ctx(), "code-collide-b", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    assert!(h
        .store
        .get_connection(&h.idp().issuer(), "collide-subject-b")
        .await
        .unwrap()
        .is_none());
    let owner = h
        .store
        .get_connection(&h.idp().issuer(), "collide-subject-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owner.user_id, user_id);
}

#[tokio::test]
async fn test_unverified_email_requires_registration_completion() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity {
        subject: "Sub-Unverified-123456".into(),
        email: "maybe@example.com".into(),
        email_verified: false,
    };

    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-unverified", &identity, &nonce).await;
    let outcome = h
        .auth
        .oidc_callback(&ctx(), "code-unverified", &state, device("1.2.3.4"))
        .await
        .unwrap();

    let CallbackOutcome::RegistrationIncomplete {
        redirect_url,
        user_id,
        completion_token,
    } = outcome
    else {
        panic!("expected registration to be incomplete");
    };
    let fragment = fragment_params(&redirect_url);
    assert_eq!(fragment["registration_incomplete"], "true");
    assert_eq!(fragment["completion_token"], completion_token);
    assert!(!fragment.contains_key("token"));

    let user = h.store.get_by_id(user_id).await.unwrap().unwrap();
    assert_eq!(user.email, "oidc-sub-unverifi@example.invalid");
    assert!(!user.email_verified);

    let session = h
        .auth
        .register_complete(&ctx(), &completion_token, device("1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(session.user_id, user_id);

    let err = h
        .auth
        .register_complete(&ctx(), &completion_token, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn test_client_context_round_trips_through_fragment() {
    let h = TestHarness::with_idp().await;
    let started = h
        .auth
        .oidc_authorize(
            &ctx(),
            OidcAuthorizeRequest {
                provider: "GOOGLE".into(),
                redirect_uri: REDIRECT_URI.into(),
                client_context: "return_to=/studio&tab=2".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let nonce = query_param(&started.authorize_url, "nonce").unwrap();
    let identity = IdpIdentity::verified("sub-ctx", "ctx@example.com");
    h.idp().expect_code("code-ctx", &identity, &nonce).await;

    let outcome = h
        .auth
        .oidc_callback(&ctx(), "code-ctx", &started.state, device("1.2.3.4"))
        .await
        .unwrap();
    let CallbackOutcome::SignedIn { redirect_url, .. } = outcome else {
        panic!("expected a signed-in callback");
    };
    assert_eq!(
        fragment_params(&redirect_url)["client_context"],
        "return_to=/studio&tab=2"
    );
}

#[tokio::test]
async fn test_authorize_input_validation() {
    let h = TestHarness::with_idp_and_settings(AuthSettings {
        allowed_redirect_uris: vec![REDIRECT_URI.to_string()],
        ..AuthSettings::default()
    })
    .await;

    let request = |provider: &str, redirect: &str| OidcAuthorizeRequest {
        provider: provider.into(),
        redirect_uri: redirect.into(),
        ..Default::default()
    };

    for (provider, redirect) in [
        ("google", "ftp://app.example.com/cb"),
        ("google", "not a uri"),
        ("google", "https://evil.example.com/cb"),
        ("myspace", REDIRECT_URI),
    ] {
        let err = h
            .auth
            .oidc_authorize(&ctx(), request(provider, redirect))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ServiceError::InvalidInput(_)),
            "{} {} gave {:?}",
            provider,
            redirect,
            err
        );
    }

    assert!(h
        .auth
        .oidc_authorize(&ctx(), request("", REDIRECT_URI))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_authorize_rate_limited_per_ip() {
    let h = TestHarness::with_idp().await;
    let request = OidcAuthorizeRequest {
        provider: "google".into(),
        redirect_uri: REDIRECT_URI.into(),
        ip_address: "192.0.2.50".into(),
        ..Default::default()
    };

    for _ in 0..20 {
        h.auth.oidc_authorize(&ctx(), request.clone()).await.unwrap();
    }
    let err = h.auth.oidc_authorize(&ctx(), request).await.unwrap_err();
    assert!(matches!(err, ServiceError::RateLimited { .. }));
}

#[tokio::test]
async fn test_link_and_unlink_second_identity() {
    let h = TestHarness::with_idp().await;
    let user_id = h.register("multi@example.com", "").await;

    let identity = IdpIdentity::verified("sub-multi", "other-address@example.com");
    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-multi", &identity, &nonce).await;

    let linked = h
        .auth
        .link_oidc(&ctx(), user_id, "code-multi", &state)
        .await
        .unwrap();
    assert_eq!(linked.provider, "google");
    assert_eq!(linked.issuer, h.idp().issuer());
    assert_eq!(linked.subject, "sub-multi");

    let active = h.store.list_active_connections(user_id).await.unwrap();
    assert_eq!(active.len(), 1);

    // A password account may drop its only provider identity
    h.auth
        .unlink_oidc(&ctx(), user_id, &linked.issuer, &linked.subject)
        .await
        .unwrap();
    assert!(h
        .store
        .list_active_connections(user_id)
        .await
        .unwrap()
        .is_empty());

    // Signing in through the unlinked identity is refused
    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-multi-again", &identity, &nonce).await;
    let err = h
        .auth
        .oidc_callback(&ctx(), "code-multi-again", &state, device("1.2.3.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));

    let err = h
        .auth
        .unlink_oidc(&ctx(), user_id, &linked.issuer, &linked.subject)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_identity_of_another_account_cannot_be_linked() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-owned", "owner@example.com");
    let owner = signed_in_user(&sign_in(&h, "code-owned", &identity).await);

    let other = h.register("thief@example.com", "").await;
    assert_ne!(owner, other);

    let (state, nonce) = h.begin_oidc("").await;
    h.idp().expect_code("code-steal", &identity, &nonce).await;
    let err = h
        .auth
        .link_oidc(&ctx(), other, "code-steal", &state)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn test_last_sign_in_method_cannot_be_unlinked() {
    let h = TestHarness::with_idp().await;
    let identity = IdpIdentity::verified("sub-only", "only@example.com");
    let user_id = signed_in_user(&sign_in(&h, "code-only", &identity).await);

    let err = h
        .auth
        .unlink_oidc(&ctx(), user_id, &h.idp().issuer(), "sub-only")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CannotUnlinkLastMethod));
    assert_eq!(err.kind(), "cannot_unlink_last_method");
}
