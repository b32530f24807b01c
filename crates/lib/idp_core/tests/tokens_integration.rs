//! Token issuance, refresh-token storage and the access-token denylist
//! against a real PostgreSQL.

use chrono::{Duration, Utc};
use idp_core::ErrorKind;
use idp_core::testutil::{
    TEST_ISSUER, key_manager, seed_client, test_database, token_issuer, user_directory,
};
use idp_core::tokens::{
    AuthContext, TokenLifetimes, TokenRequest, generate_refresh_token, hash_refresh_token,
};
use sqlx::PgConnection;

fn offline_request(subject: &str, client_id: &str) -> TokenRequest {
    TokenRequest::new(
        subject,
        client_id,
        vec!["openid".into(), "offline_access".into()],
    )
}

async fn refresh_count(conn: &mut PgConnection, user_id: i64, client_id: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM oidc_refresh_tokens WHERE user_id = $1 AND client_id = $2",
    )
    .bind(user_id)
    .bind(client_id)
    .fetch_one(conn)
    .await
    .expect("count refresh tokens")
}

#[tokio::test]
async fn scenario_b_refresh_token_lookup_and_expiry() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    let issuer = token_issuer(user_directory(&[7]));

    let raw = generate_refresh_token();
    let issued = issuer
        .issue_access_and_refresh_tokens(
            &mut conn,
            &offline_request("7", "c1"),
            &raw,
            TokenLifetimes::default(),
        )
        .await
        .expect("issue");
    assert_eq!(issued.refresh.token_hash, hash_refresh_token(&raw));
    assert_eq!(issued.refresh.amr, vec!["pwd".to_string()]);

    let found = issuer.lookup_by_raw_token(&mut conn, &raw).await.expect("lookup");
    assert_eq!(found.subject(), "7");
    assert_eq!(found.client_id, "c1");
    assert_eq!(found.scopes, vec!["openid".to_string(), "offline_access".to_string()]);

    // Only the hash is stored; the raw value appears nowhere in the row.
    let leaked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM oidc_refresh_tokens t WHERE t::text LIKE '%' || $1 || '%'",
    )
    .bind(&raw)
    .fetch_one(&mut *conn)
    .await
    .expect("search rows");
    assert_eq!(leaked, 0);

    sqlx::query("UPDATE oidc_refresh_tokens SET expires_at = now() - interval '1 second'")
        .execute(&mut *conn)
        .await
        .expect("force expiry");
    let err = issuer.lookup_by_raw_token(&mut conn, &raw).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);

    let err = issuer
        .lookup_by_raw_token(&mut conn, "never-issued")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn revoke_is_scoped_to_the_owning_client() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    seed_client(&mut conn, "c2").await;
    let issuer = token_issuer(user_directory(&[7]));

    let raw = generate_refresh_token();
    issuer
        .issue_access_and_refresh_tokens(
            &mut conn,
            &offline_request("7", "c1"),
            &raw,
            TokenLifetimes::default(),
        )
        .await
        .expect("issue");

    let err = issuer
        .revoke_refresh_token(&mut conn, &raw, "c2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    issuer
        .lookup_by_raw_token(&mut conn, &raw)
        .await
        .expect("token survives a foreign revoke");

    issuer
        .revoke_refresh_token(&mut conn, &raw, "c1")
        .await
        .expect("revoke");
    let err = issuer.lookup_by_raw_token(&mut conn, &raw).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = issuer
        .revoke_refresh_token(&mut conn, &raw, "c1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn consume_requires_the_owning_client_and_a_live_token() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    seed_client(&mut conn, "c2").await;
    let issuer = token_issuer(user_directory(&[7]));

    let live = generate_refresh_token();
    let stale = generate_refresh_token();
    for raw in [&live, &stale] {
        issuer
            .issue_access_and_refresh_tokens(
                &mut conn,
                &offline_request("7", "c1"),
                raw,
                TokenLifetimes::default(),
            )
            .await
            .expect("issue");
    }
    sqlx::query(
        "UPDATE oidc_refresh_tokens SET expires_at = now() - interval '1 second' \
         WHERE token_hash = $1",
    )
    .bind(hash_refresh_token(&stale))
    .execute(&mut *conn)
    .await
    .expect("force expiry");

    let err = issuer
        .consume_refresh_token(&mut conn, &live, "c2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    issuer
        .lookup_by_raw_token(&mut conn, &live)
        .await
        .expect("token survives a foreign exchange");

    let err = issuer
        .consume_refresh_token(&mut conn, &stale, "c1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);

    let consumed = issuer
        .consume_refresh_token(&mut conn, &live, "c1")
        .await
        .expect("consume");
    assert_eq!(consumed.client_id, "c1");
    let err = issuer
        .consume_refresh_token(&mut conn, &live, "c1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn scenario_c_terminate_session_only_touches_one_pair() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    seed_client(&mut conn, "c2").await;
    let issuer = token_issuer(user_directory(&[7, 8]));

    for (subject, client_id) in [("7", "c1"), ("7", "c1"), ("7", "c2"), ("8", "c1")] {
        issuer
            .issue_access_and_refresh_tokens(
                &mut conn,
                &offline_request(subject, client_id),
                &generate_refresh_token(),
                TokenLifetimes::default(),
            )
            .await
            .expect("issue");
    }

    assert_eq!(
        issuer.terminate_session(&mut conn, 7, "c1").await.expect("terminate"),
        2
    );
    assert_eq!(refresh_count(&mut conn, 7, "c1").await, 0);
    assert_eq!(refresh_count(&mut conn, 7, "c2").await, 1);
    assert_eq!(refresh_count(&mut conn, 8, "c1").await, 1);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn unknown_user_or_malformed_subject_stores_nothing() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    let issuer = token_issuer(user_directory(&[7]));

    let err = issuer
        .issue_access_and_refresh_tokens(
            &mut conn,
            &offline_request("99", "c1"),
            &generate_refresh_token(),
            TokenLifetimes::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = issuer
        .issue_access_and_refresh_tokens(
            &mut conn,
            &offline_request("not-a-number", "c1"),
            &generate_refresh_token(),
            TokenLifetimes::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(refresh_count(&mut conn, 7, "c1").await, 0);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn client_lifetimes_and_auth_context_are_honoured() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    let mut client = seed_client(&mut conn, "c1").await;
    client.access_token_lifetime = Duration::seconds(60);
    client.refresh_token_lifetime = Duration::hours(2);
    let issuer = token_issuer(user_directory(&[7]));

    let auth_time = Utc::now() - Duration::minutes(10);
    let request = offline_request("7", "c1")
        .with_auth(AuthContext::new(auth_time, vec!["otp".into(), "pwd".into()]));
    let issued = issuer
        .issue_access_and_refresh_tokens(
            &mut conn,
            &request,
            &generate_refresh_token(),
            TokenLifetimes::from_client(&client),
        )
        .await
        .expect("issue");

    let claims = issuer
        .verify_access_token(&mut conn, &issued.access.token)
        .await
        .expect("verify");
    assert_eq!(claims.exp - claims.iat, 60);
    assert_eq!(claims.iss, TEST_ISSUER);
    assert_eq!(claims.aud, vec!["c1".to_string()]);

    let refresh_lifetime = issued.refresh.expires_at - issued.refresh.created_at;
    assert!((refresh_lifetime - Duration::hours(2)).num_seconds().abs() <= 5);
    assert_eq!(issued.refresh.amr, vec!["otp".to_string(), "pwd".to_string()]);
    assert_eq!(
        issued.refresh.auth_time.timestamp(),
        auth_time.timestamp()
    );

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn denylisted_access_tokens_fail_verification_and_are_swept() {
    let Some(db) = test_database().await else {
        return;
    };
    key_manager().bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    let issuer = token_issuer(user_directory(&[7]));

    let request = TokenRequest::new("7", "c1", vec!["openid".into()]);
    let issued = issuer
        .issue_access_token(&mut conn, &request, None)
        .await
        .expect("issue");
    let claims = issuer
        .verify_access_token(&mut conn, &issued.token)
        .await
        .expect("verify");
    assert_eq!(claims.jti, issued.jti);
    assert_eq!(claims.scope, "openid");

    issuer
        .revoke_access_token(&mut conn, &issued.jti, issued.expires_at)
        .await
        .expect("revoke");
    assert!(issuer.is_access_token_revoked(&mut conn, &issued.jti).await.expect("check"));
    let err = issuer
        .verify_access_token(&mut conn, &issued.token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // An expired denylist entry no longer counts and is swept.
    sqlx::query("UPDATE oidc_revoked_access_tokens SET expires_at = now() - interval '1 second'")
        .execute(&mut *conn)
        .await
        .expect("expire denylist entry");
    assert!(!issuer.is_access_token_revoked(&mut conn, &issued.jti).await.expect("check"));

    let raw = generate_refresh_token();
    issuer
        .issue_access_and_refresh_tokens(
            &mut conn,
            &TokenRequest::new("7", "c1", vec!["offline_access".into()]),
            &raw,
            TokenLifetimes::default(),
        )
        .await
        .expect("issue refresh");
    sqlx::query("UPDATE oidc_refresh_tokens SET expires_at = now() - interval '1 second'")
        .execute(&mut *conn)
        .await
        .expect("expire refresh token");

    let sweep = issuer.delete_expired(&mut conn).await.expect("sweep");
    assert_eq!(sweep.refresh_tokens, 1);
    assert_eq!(sweep.revoked_access_tokens, 1);

    drop(conn);
    db.teardown().await;
}

#[tokio::test]
async fn tokens_signed_before_rotation_still_verify() {
    let Some(db) = test_database().await else {
        return;
    };
    let keys = key_manager();
    keys.bootstrap(&db.pool).await.expect("bootstrap");
    let mut conn = db.pool.acquire().await.expect("acquire");
    seed_client(&mut conn, "c1").await;
    let issuer = token_issuer(user_directory(&[7]));
    let request = TokenRequest::new("7", "c1", vec!["openid".into()]);

    let before = issuer
        .issue_access_token(&mut conn, &request, None)
        .await
        .expect("issue before rotation");
    let new_key = keys.rotate(&db.pool).await.expect("rotate");
    let after = issuer
        .issue_access_token(&mut conn, &request, None)
        .await
        .expect("issue after rotation");

    let header = jsonwebtoken::decode_header(&after.token).expect("header");
    assert_eq!(header.kid.as_deref(), Some(new_key.as_str()));
    let old_header = jsonwebtoken::decode_header(&before.token).expect("header");
    assert_ne!(old_header.kid, header.kid);

    issuer
        .verify_access_token(&mut conn, &before.token)
        .await
        .expect("old token verifies during grace period");
    issuer
        .verify_access_token(&mut conn, &after.token)
        .await
        .expect("new token verifies");

    drop(conn);
    db.teardown().await;
}
