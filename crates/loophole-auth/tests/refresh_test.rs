//! Token refresh behavior against a mock token endpoint

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Json, Router};
use serde_json::json;

use loophole_auth::{AuthError, TokenPair, TokenStore};

#[derive(Clone)]
struct MockState {
    calls: Arc<AtomicUsize>,
    /// Response body template per call index; last entry repeats.
    responses: Arc<Vec<(StatusCode, serde_json::Value)>>,
}

async fn token_endpoint(
    State(state): State<MockState>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<serde_json::Value>) {
    assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
    assert!(form.contains_key("client_id"));
    assert!(form.contains_key("refresh_token"));

    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    let idx = call.min(state.responses.len() - 1);
    let (status, body) = state.responses[idx].clone();
    (status, Json(body))
}

async fn start_mock(responses: Vec<(StatusCode, serde_json::Value)>) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = MockState {
        calls: calls.clone(),
        responses: Arc::new(responses),
    };
    let app = Router::new()
        .route("/oauth/token", post(token_endpoint))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/oauth/token", addr), calls)
}

fn seeded_store(dir: &tempfile::TempDir, token_url: String) -> TokenStore {
    let store = TokenStore::with_path(dir.path().join("tokens.json")).with_token_url(token_url);
    store
        .save(&TokenPair {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            id_token: "old-id".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
        })
        .unwrap();
    store
}

#[tokio::test]
async fn refresh_keeps_prior_refresh_token_when_issuer_omits_it() {
    let (url, calls) = start_mock(vec![(
        StatusCode::OK,
        json!({"access_token": "new-access", "token_type": "Bearer", "expires_in": 3600}),
    )])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, url);

    store.refresh().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.access_token().unwrap(), "new-access");
    assert_eq!(store.refresh_token().unwrap(), "old-refresh");
}

#[tokio::test]
async fn refresh_adopts_new_refresh_token_when_issuer_returns_one() {
    let (url, _calls) = start_mock(vec![(
        StatusCode::OK,
        json!({"access_token": "new-access", "refresh_token": "new-refresh"}),
    )])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, url);

    store.refresh().await.unwrap();
    assert_eq!(store.refresh_token().unwrap(), "new-refresh");
}

#[tokio::test]
async fn refresh_denied_requires_new_login() {
    for error in ["expired_token", "invalid_grant", "invalid_grand", "access_denied"] {
        let (url, _calls) =
            start_mock(vec![(StatusCode::FORBIDDEN, json!({"error": error}))]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, url);

        let err = store.refresh().await.unwrap_err();
        assert!(
            matches!(err, AuthError::LoginRequired),
            "error `{}` should require a new login, got {:?}",
            error,
            err
        );
    }
}

#[tokio::test]
async fn refresh_surfaces_unexpected_statuses() {
    let (url, _calls) = start_mock(vec![(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "boom"}),
    )])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, url);

    let err = store.refresh().await.unwrap_err();
    assert!(matches!(err, AuthError::UnexpectedResponse(_)));
}

#[tokio::test]
async fn refresh_without_stored_tokens_is_not_logged_in() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::with_path(dir.path().join("tokens.json"));

    let err = store.refresh().await.unwrap_err();
    assert!(matches!(err, AuthError::NotLoggedIn));
}
