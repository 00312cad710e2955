//! Mock Connect device speaking the Zeroconf action protocol
//!
//! Dispatches on the `action` query parameter from a fallback handler so the
//! CPath can be anything, just like on a real device.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddUserBody {
    Json(String),
    Form(String),
}

pub struct MockDeviceState {
    /// Status answered to getInfo
    pub getinfo_status: u16,
    /// Body answered to a 200 getInfo
    pub info_body: Value,
    /// Status answered to a JSON addUser
    pub adduser_json_status: u16,
    /// Status answered to a form-encoded addUser
    pub adduser_form_status: u16,

    pub getinfo_calls: usize,
    pub adduser_calls: usize,
    pub adduser_bodies: Vec<AddUserBody>,
}

impl Default for MockDeviceState {
    fn default() -> Self {
        Self {
            getinfo_status: 200,
            info_body: json!({ "status": 101, "remoteName": "Mock Device" }),
            adduser_json_status: 200,
            adduser_form_status: 200,
            getinfo_calls: 0,
            adduser_calls: 0,
            adduser_bodies: Vec::new(),
        }
    }
}

pub type SharedDeviceState = Arc<RwLock<MockDeviceState>>;

/// Mock device server. `ip()`/`port()` plug straight into the client calls.
pub struct MockDeviceServer {
    addr: SocketAddr,
    pub state: SharedDeviceState,
    handle: JoinHandle<()>,
}

impl MockDeviceServer {
    pub async fn start() -> Self {
        let state: SharedDeviceState = Arc::new(RwLock::new(MockDeviceState::default()));

        let app = Router::new()
            .fallback(handle_action)
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

    pub fn ip(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for MockDeviceServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_action(
    State(state): State<SharedDeviceState>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let action = params.get("action").map(String::as_str).unwrap_or_default();
    let mut guard = state.write().await;

    match (method, action) {
        (Method::GET, "getInfo") => {
            guard.getinfo_calls += 1;
            let status = StatusCode::from_u16(guard.getinfo_status).unwrap();
            let body = if status == StatusCode::OK {
                guard.info_body.clone()
            } else {
                json!({ "status": 500 })
            };
            (status, Json(body))
        }
        (Method::POST, "addUser") => {
            guard.adduser_calls += 1;
            let content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let raw = String::from_utf8_lossy(&body).to_string();
            let status = if content_type.starts_with("application/json") {
                guard.adduser_bodies.push(AddUserBody::Json(raw));
                guard.adduser_json_status
            } else {
                guard.adduser_bodies.push(AddUserBody::Form(raw));
                guard.adduser_form_status
            };
            (
                StatusCode::from_u16(status).unwrap(),
                Json(json!({ "status": if status == 200 { 101 } else { 202 } })),
            )
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({ "status": 400 }))),
    }
}
