//! Mock Web API player endpoints

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct MockWebApiState {
    /// Devices returned by the enumeration endpoint
    pub devices: Vec<Value>,
    /// Bearer token that gets a 401 (simulates an expired token)
    pub reject_token: Option<String>,
    /// Device id reported as actively playing by the playback endpoint
    pub playing_device: Option<String>,
    /// Remaining play requests to answer 404 (device vanished)
    pub play_404_remaining: usize,
    /// Playlist track total; `playlist_missing` makes the lookup 404
    pub playlist_total: u32,
    pub playlist_missing: bool,

    pub devices_calls: usize,
    pub transfer_calls: usize,
    pub volume_calls: usize,
    pub play_calls: usize,
    pub pause_calls: usize,
    pub playlist_calls: usize,
    pub shuffle_requests: Vec<HashMap<String, String>>,
    pub volume_requests: Vec<HashMap<String, String>>,
    pub play_bodies: Vec<Value>,
}

pub type SharedWebApiState = Arc<RwLock<MockWebApiState>>;

/// Mock Web API server for the directory client.
pub struct MockWebApiServer {
    addr: SocketAddr,
    pub state: SharedWebApiState,
    handle: JoinHandle<()>,
}

impl MockWebApiServer {
    pub async fn start() -> Self {
        let state: SharedWebApiState = Arc::new(RwLock::new(MockWebApiState::default()));

        let app = Router::new()
            .route("/me/player/devices", get(handle_devices))
            .route("/me/player", put(handle_transfer).get(handle_playback))
            .route("/me/player/volume", put(handle_volume))
            .route("/me/player/play", put(handle_play))
            .route("/me/player/pause", put(handle_pause))
            .route("/me/player/shuffle", put(handle_shuffle))
            .route("/playlists/{id}", get(handle_playlist))
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

    pub async fn set_devices(&self, devices: Vec<Value>) {
        self.state.write().await.devices = devices;
    }

    pub fn device(id: &str, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "is_active": false,
            "volume_percent": 35,
            "type": "Speaker"
        })
    }
}

impl Drop for MockWebApiServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn authorized(state: &SharedWebApiState, headers: &HeaderMap) -> bool {
    let reject = state.read().await.reject_token.clone();
    let Some(reject) = reject else { return true };
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    bearer != format!("Bearer {reject}")
}

async fn handle_devices(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&state, &headers).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "expired" })));
    }
    let mut guard = state.write().await;
    guard.devices_calls += 1;
    (
        StatusCode::OK,
        Json(json!({ "devices": guard.devices.clone() })),
    )
}

async fn handle_transfer(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
    Json(_body): Json<Value>,
) -> StatusCode {
    if !authorized(&state, &headers).await {
        return StatusCode::UNAUTHORIZED;
    }
    state.write().await.transfer_calls += 1;
    StatusCode::NO_CONTENT
}

async fn handle_playback(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&state, &headers).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "expired" })));
    }
    let guard = state.read().await;
    match guard.playing_device.as_ref() {
        Some(id) => (
            StatusCode::OK,
            Json(json!({
                "is_playing": true,
                "device": { "id": id, "name": "mock" }
            })),
        ),
        None => (StatusCode::NO_CONTENT, Json(Value::Null)),
    }
}

async fn handle_volume(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    if !authorized(&state, &headers).await {
        return StatusCode::UNAUTHORIZED;
    }
    let mut guard = state.write().await;
    guard.volume_calls += 1;
    guard.volume_requests.push(params);
    StatusCode::NO_CONTENT
}

async fn handle_play(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if !authorized(&state, &headers).await {
        return StatusCode::UNAUTHORIZED;
    }
    let mut guard = state.write().await;
    guard.play_calls += 1;
    guard.play_bodies.push(body);
    if guard.play_404_remaining > 0 {
        guard.play_404_remaining -= 1;
        return StatusCode::NOT_FOUND;
    }
    StatusCode::NO_CONTENT
}

async fn handle_pause(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(&state, &headers).await {
        return StatusCode::UNAUTHORIZED;
    }
    state.write().await.pause_calls += 1;
    StatusCode::NO_CONTENT
}

async fn handle_shuffle(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    if !authorized(&state, &headers).await {
        return StatusCode::UNAUTHORIZED;
    }
    let mut guard = state.write().await;
    guard.shuffle_requests.push(params);
    StatusCode::NO_CONTENT
}

async fn handle_playlist(
    State(state): State<SharedWebApiState>,
    headers: HeaderMap,
    Path(_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&state, &headers).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "expired" })));
    }
    let mut guard = state.write().await;
    guard.playlist_calls += 1;
    if guard.playlist_missing {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })));
    }
    let total = guard.playlist_total;
    (
        StatusCode::OK,
        Json(json!({ "tracks": { "total": total } })),
    )
}
