//! Token manager lifecycle against a mock accounts service

mod mock_servers;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use connect_alarm::config::AuthConfig;
use connect_alarm::error::AuthError;
use connect_alarm::token::{TokenManager, TokenPayload, EXPIRY_MARGIN};

use mock_servers::accounts::MockAccountsServer;

fn auth_with_refresh() -> AuthConfig {
    AuthConfig {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        refresh_token: Some("seed-refresh".to_string()),
        ..Default::default()
    }
}

fn payload(token: &str, expires_in: i64) -> TokenPayload {
    TokenPayload {
        access_token: token.to_string(),
        refresh_token: Some("payload-refresh".to_string()),
        token_type: Some("Bearer".to_string()),
        scope: None,
        expires_at: Utc::now().timestamp() + expires_in,
    }
}

#[tokio::test]
async fn valid_token_is_returned_without_refresh() {
    let accounts = MockAccountsServer::start().await;
    let manager = TokenManager::with_accounts_base(auth_with_refresh(), accounts.base_url(), None)
        .seeded(payload("cached", 3600));

    let token = manager.get_access_token().await.expect("token");
    assert_eq!(token, "cached");
    assert_eq!(accounts.refresh_count(), 0);
}

#[tokio::test]
async fn token_inside_margin_is_refreshed() {
    let accounts = MockAccountsServer::start().await;
    let manager = TokenManager::with_accounts_base(auth_with_refresh(), accounts.base_url(), None)
        .seeded(payload("nearly-expired", 60));

    assert!(Duration::from_secs(60) < EXPIRY_MARGIN);
    let token = manager.get_access_token().await.expect("token");
    assert_eq!(token, "token-1");
    assert_eq!(accounts.refresh_count(), 1);
}

#[tokio::test]
async fn concurrent_callers_trigger_at_most_one_refresh() {
    let accounts = MockAccountsServer::start().await;
    let manager = Arc::new(
        TokenManager::with_accounts_base(auth_with_refresh(), accounts.base_url(), None)
            .seeded(payload("nearly-expired", 60)),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(
            async move { manager.get_access_token().await },
        ));
    }
    for handle in handles {
        let token = handle.await.expect("join").expect("token");
        assert_eq!(token, "token-1");
    }
    assert_eq!(
        accounts.refresh_count(),
        1,
        "single-flight: one network refresh for all concurrent callers"
    );
}

#[tokio::test]
async fn refresh_if_needed_is_idempotent() {
    let accounts = MockAccountsServer::start().await;
    let manager = TokenManager::with_accounts_base(auth_with_refresh(), accounts.base_url(), None)
        .seeded(payload("nearly-expired", 60));

    assert!(manager.refresh_if_needed(false).await.expect("refresh"));
    assert!(!manager.refresh_if_needed(false).await.expect("refresh"));
    assert_eq!(accounts.refresh_count(), 1);

    // Force bypasses the freshness check
    assert!(manager.refresh_if_needed(true).await.expect("refresh"));
    assert_eq!(accounts.refresh_count(), 2);
}

#[tokio::test]
async fn refreshed_payload_is_persisted_and_reloaded() {
    let accounts = MockAccountsServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = dir.path().join("token.json");

    let manager = TokenManager::with_accounts_base(
        auth_with_refresh(),
        accounts.base_url(),
        Some(cache.clone()),
    );
    let token = manager.get_access_token().await.expect("token");
    assert_eq!(token, "token-1");
    assert!(cache.exists(), "payload must be persisted after refresh");

    // A fresh manager adopts the cached payload without touching the network
    let reloaded = TokenManager::with_accounts_base(
        AuthConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            ..Default::default()
        },
        accounts.base_url(),
        Some(cache),
    );
    let token = reloaded.get_access_token().await.expect("token");
    assert_eq!(token, "token-1");
    assert_eq!(accounts.refresh_count(), 1);
}

#[tokio::test]
async fn rejected_refresh_surfaces_typed_error() {
    let accounts = MockAccountsServer::start().await;
    accounts.fail_with(400);
    let manager = TokenManager::with_accounts_base(auth_with_refresh(), accounts.base_url(), None);

    let err = manager.get_access_token().await.expect_err("should fail");
    match err {
        AuthError::RefreshRejected { status, .. } => assert_eq!(status, 400),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_credentials_fail_without_network() {
    let accounts = MockAccountsServer::start().await;
    let manager = TokenManager::with_accounts_base(
        AuthConfig::default(),
        accounts.base_url(),
        None,
    );

    let err = manager.get_access_token().await.expect_err("should fail");
    assert!(matches!(err, AuthError::NoCredentials(_)));
    assert_eq!(accounts.refresh_count(), 0);
}
