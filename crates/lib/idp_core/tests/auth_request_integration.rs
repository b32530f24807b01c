//! Authorization request state machine against a real PostgreSQL.

use idp_core::ErrorKind;
use idp_core::auth_request::AuthRequests;
use idp_core::models::auth_request::{
    AuthRequestState, CodeChallengeMethod, NewAuthRequest, compute_s256_challenge,
};
use idp_core::testutil::{TEST_REDIRECT_URI, seed_client, test_database};
use sqlx::PgConnection;
use uuid::Uuid;

fn openid_email() -> Vec<String> {
    vec!["openid".into(), "email".into()]
}

fn new_request(client_id: &str) -> NewAuthRequest {
    NewAuthRequest::new(client_id, TEST_REDIRECT_URI, openid_email(), "code")
}

async fn force_expired(conn: &mut PgConnection, id: Uuid) {
    sqlx::query("UPDATE oidc_auth_requests SET expires_at = now() - interval '1 second' WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await
        .expect("force expiry");
}

#[tokio::test]
async fn scenario_a_code_redeems_exactly_once() {
    let Some(db) = test_database().await else {
        return;
    };
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    let requests = AuthRequests::new();
    let tenant = Uuid::new_v4();

    let created = requests
        .create(&mut conn, new_request("c1").with_state("xyz"))
        .await
        .expect("create");
    assert!(!created.is_authenticated());
    assert_eq!(created.state.as_deref(), Some("xyz"));

    let authenticated = requests
        .complete_authentication(&mut conn, created.id, 7, tenant)
        .await
        .expect("complete authentication");
    assert_eq!(authenticated.tenant_id, Some(tenant));

    requests
        .save_code(&mut conn, created.id, "abc123")
        .await
        .expect("save code");

    let redeemed = requests
        .redeem_by_code(&mut conn, "abc123")
        .await
        .expect("redeem");
    assert!(redeemed.is_authenticated());
    assert_eq!(redeemed.subject(), "7");
    assert_eq!(redeemed.scopes, openid_email());
    assert_eq!(
        redeemed.lifecycle(chrono::Utc::now()),
        AuthRequestState::Redeemed
    );

    let err = requests
        .redeem_by_code(&mut conn, "abc123")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyUsed);
    assert!(err.is_client_error());

    requests.delete(&mut conn, created.id).await.expect("delete");
    let err = requests.get_by_id(&mut conn, created.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn concurrent_redemption_has_one_winner() {
    let Some(db) = test_database().await else {
        return;
    };
    let requests = AuthRequests::new();
    {
        let mut conn = db.pool.acquire().await.expect("acquire");
        seed_client(&mut conn, "c1").await;
        let created = requests.create(&mut conn, new_request("c1")).await.expect("create");
        requests
            .complete_authentication(&mut conn, created.id, 7, Uuid::new_v4())
            .await
            .expect("complete");
        requests.save_code(&mut conn, created.id, "race").await.expect("save code");
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = db.pool.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = pool.acquire().await.expect("acquire");
            AuthRequests::new().redeem_by_code(&mut conn, "race").await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadyUsed),
        }
    }
    assert_eq!(winners, 1);

    db.teardown().await;
}

#[tokio::test]
async fn create_validates_against_client_registry() {
    let Some(db) = test_database().await else {
        return;
    };
    let mut conn = db.pool.acquire().await.expect("acquire");
    let requests = AuthRequests::new();
    seed_client(&mut conn, "c1").await;

    let err = requests.create(&mut conn, new_request("nope")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let bad_redirect = NewAuthRequest::new("c1", "https://evil.example/cb", openid_email(), "code");
    let err = requests.create(&mut conn, bad_redirect).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let implicit = NewAuthRequest::new("c1", TEST_REDIRECT_URI, openid_email(), "token");
    let err = requests.create(&mut conn, implicit).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    sqlx::query("UPDATE oidc_clients SET require_pkce = true WHERE client_id = 'c1'")
        .execute(&mut *conn)
        .await
        .expect("require pkce");
    let err = requests.create(&mut conn, new_request("c1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    let with_pkce = new_request("c1")
        .with_code_challenge(compute_s256_challenge(verifier), CodeChallengeMethod::S256);
    let created = requests.create(&mut conn, with_pkce).await.expect("create with PKCE");
    assert!(created.verify_code_verifier(verifier));
    assert!(!created.verify_code_verifier("wrong"));

    idp_core::clients::set_active(&mut conn, "c1", false)
        .await
        .expect("deactivate");
    let with_pkce = new_request("c1").with_code_challenge("x", CodeChallengeMethod::Plain);
    let err = requests.create(&mut conn, with_pkce).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn authentication_is_a_one_way_transition() {
    let Some(db) = test_database().await else {
        return;
    };
    let mut conn = db.pool.acquire().await.expect("acquire");
    let requests = AuthRequests::new();
    seed_client(&mut conn, "c1").await;
    let created = requests.create(&mut conn, new_request("c1")).await.expect("create");

    let err = requests
        .save_code(&mut conn, created.id, "too-early")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    requests
        .complete_authentication(&mut conn, created.id, 7, Uuid::new_v4())
        .await
        .expect("complete");
    let err = requests
        .complete_authentication(&mut conn, created.id, 8, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(
        requests.get_by_id(&mut conn, created.id).await.expect("get").user_id,
        Some(7)
    );

    let err = requests
        .complete_authentication(&mut conn, Uuid::new_v4(), 7, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn already_logged_in_user_skips_authentication_step() {
    let Some(db) = test_database().await else {
        return;
    };
    let mut conn = db.pool.acquire().await.expect("acquire");
    let requests = AuthRequests::new();
    seed_client(&mut conn, "c1").await;

    let tenant = Uuid::new_v4();
    let created = requests
        .create(&mut conn, new_request("c1").with_authentication(7, tenant))
        .await
        .expect("create");
    assert!(created.is_authenticated());
    assert_eq!(created.subject(), "7");

    requests.save_code(&mut conn, created.id, "sso").await.expect("save code");
    assert_eq!(
        requests.redeem_by_code(&mut conn, "sso").await.expect("redeem").tenant_id,
        Some(tenant)
    );

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn expired_requests_fail_and_are_swept() {
    let Some(db) = test_database().await else {
        return;
    };
    let mut conn = db.pool.acquire().await.expect("acquire");
    let requests = AuthRequests::new();
    seed_client(&mut conn, "c1").await;

    let unauthenticated = requests.create(&mut conn, new_request("c1")).await.expect("create");
    let with_code = requests.create(&mut conn, new_request("c1")).await.expect("create");
    requests
        .complete_authentication(&mut conn, with_code.id, 7, Uuid::new_v4())
        .await
        .expect("complete");
    requests.save_code(&mut conn, with_code.id, "late").await.expect("save code");
    let live = requests.create(&mut conn, new_request("c1")).await.expect("create");

    force_expired(&mut conn, unauthenticated.id).await;
    force_expired(&mut conn, with_code.id).await;

    let err = requests.get_by_id(&mut conn, unauthenticated.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    let err = requests
        .complete_authentication(&mut conn, unauthenticated.id, 7, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    let err = requests.redeem_by_code(&mut conn, "late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    let err = requests.redeem_by_code(&mut conn, "never-issued").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(requests.delete_expired(&mut conn).await.expect("sweep"), 2);
    requests.get_by_id(&mut conn, live.id).await.expect("live request survives");

    drop(conn);
    db.teardown().await;
}
