//! Mock accounts service for token refresh testing

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct MockAccountsState {
    refresh_calls: AtomicUsize,
    /// 0 means success; anything else is returned as the response status
    fail_status: AtomicU16,
}

/// Mock of the accounts token endpoint. Each successful refresh hands out
/// `token-<n>` where n is the 1-based refresh count.
pub struct MockAccountsServer {
    addr: SocketAddr,
    state: Arc<MockAccountsState>,
    handle: JoinHandle<()>,
}

impl MockAccountsServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockAccountsState {
            refresh_calls: AtomicUsize::new(0),
            fail_status: AtomicU16::new(0),
        });

        let app = Router::new()
            .route("/api/token", post(handle_token))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn refresh_count(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    /// Make the token endpoint answer with the given status instead of a token.
    pub fn fail_with(&self, status: u16) {
        self.state.fail_status.store(status, Ordering::SeqCst);
    }
}

impl Drop for MockAccountsServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_token(
    State(state): State<Arc<MockAccountsState>>,
) -> (StatusCode, Json<Value>) {
    let fail = state.fail_status.load(Ordering::SeqCst);
    if fail != 0 {
        return (
            StatusCode::from_u16(fail).unwrap(),
            Json(json!({ "error": "invalid_grant" })),
        );
    }
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({
            "access_token": format!("token-{n}"),
            "token_type": "Bearer",
            "scope": "user-read-playback-state user-modify-playback-state",
            "expires_in": 3600
        })),
    )
}
