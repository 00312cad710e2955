//! Cloud device directory and playback commands
//!
//! Thin client over the Web API player endpoints: device enumeration,
//! transfer, volume, shuffle, play/pause, and the playback probe used to
//! confirm a device actually started. The device list is cached briefly to
//! absorb polling bursts, and every command invalidates that cache so the
//! next poll reflects the command's effect.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::http::{is_transient_status, RetryPolicy};
use crate::models::CloudDevice;
use crate::token::TokenManager;

/// Default Web API base URL.
pub const WEB_API_BASE: &str = "https://api.spotify.com/v1";

/// Device list cache lifetime; absorbs bursts of polling calls.
const DEVICE_CACHE_TTL: Duration = Duration::from_millis(750);
/// Playlist track-count cache lifetime and bound.
const PLAYLIST_CACHE_TTL: Duration = Duration::from_secs(300);
const PLAYLIST_CACHE_MAX: usize = 64;

/// Seam between the orchestrator and the cloud directory, mockable in tests.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Current device list; `force_refresh` bypasses the burst cache.
    async fn get_devices(&self, force_refresh: bool) -> Result<Vec<CloudDevice>>;

    /// Transfer playback to the device, optionally starting it.
    async fn put_transfer(&self, device_id: &str, play: bool) -> Result<()>;

    /// Set device volume.
    async fn put_volume(&self, device_id: &str, percent: u8) -> Result<()>;

    /// Start playback of the context on the device.
    async fn put_play(&self, device_id: &str, context_uri: Option<&str>, shuffle: bool)
        -> Result<()>;

    /// Pause playback on the device.
    async fn pause_playback(&self, device_id: &str) -> Result<()>;

    /// Whether the device is currently reported as the active, playing one.
    async fn verify_device_ready(&self, device_id: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<CloudDevice>,
}

#[derive(Debug, Deserialize)]
struct PlaybackDevice {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaybackSnapshot {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    device: Option<PlaybackDevice>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracks {
    #[serde(default)]
    total: u32,
}

#[derive(Debug, Deserialize)]
struct PlaylistResponse {
    #[serde(default)]
    tracks: Option<PlaylistTracks>,
}

/// Production directory over the Web API.
pub struct CloudDirectory {
    http: Client,
    tokens: Arc<TokenManager>,
    api_base: String,
    retry: RetryPolicy,
    retry_404_delay: Duration,
    verify_timeout: Duration,
    device_cache: Mutex<Option<(Instant, Vec<CloudDevice>)>>,
    playlist_cache: Mutex<HashMap<String, (Instant, u32)>>,
}

impl CloudDirectory {
    pub fn new(tokens: Arc<TokenManager>, timings: &Timings) -> Self {
        Self::with_api_base(tokens, timings, WEB_API_BASE)
    }

    /// Constructor with an explicit API base URL (mock servers in tests).
    pub fn with_api_base(
        tokens: Arc<TokenManager>,
        timings: &Timings,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            tokens,
            api_base: api_base.into(),
            retry: RetryPolicy::web_api(),
            retry_404_delay: timings.retry_404_delay(),
            verify_timeout: timings.verify_device_ready_timeout(),
            device_cache: Mutex::new(None),
            playlist_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn invalidate_device_cache(&self) {
        *self.device_cache.lock().await = None;
    }

    /// Send a request with the shared retry contract: 401 forces a token
    /// refresh and re-attempts, 429/5xx and connection errors back off and
    /// re-attempt, everything else is returned to the caller as-is.
    async fn send_with_retry<F>(&self, mut build: F) -> Result<reqwest::Response>
    where
        F: FnMut(&Client) -> reqwest::RequestBuilder + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.tokens.get_access_token().await?;
            let result = build(&self.http).bearer_auth(&token).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED {
                        warn!("Web API returned 401, forcing token refresh");
                        self.tokens.refresh_if_needed(true).await?;
                        if attempt >= self.retry.max_attempts {
                            bail!("web api still unauthorized after token refresh");
                        }
                    } else if is_transient_status(status) {
                        warn!("Web API returned {status}");
                        if attempt >= self.retry.max_attempts {
                            return Ok(resp);
                        }
                    } else {
                        return Ok(resp);
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!("Web API request failed: {e}");
                    if attempt >= self.retry.max_attempts {
                        return Err(e).context("web api request failed after retries");
                    }
                }
                Err(e) => return Err(e).context("web api request failed"),
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }
    }

    async fn set_shuffle(&self, device_id: &str, state: bool) -> Result<()> {
        let url = format!("{}/me/player/shuffle", self.api_base);
        let state_str = if state { "true" } else { "false" };
        let resp = self
            .send_with_retry(|http| {
                http.put(&url)
                    .query(&[("state", state_str), ("device_id", device_id)])
            })
            .await?;
        resp.error_for_status()?;
        debug!("Shuffle {state} on device {device_id}");
        Ok(())
    }

    /// Total tracks of a playlist, cached with a TTL and a bounded entry count.
    async fn playlist_total_tracks(&self, playlist_id: &str) -> Result<u32> {
        {
            let cache = self.playlist_cache.lock().await;
            if let Some((at, total)) = cache.get(playlist_id) {
                if at.elapsed() < PLAYLIST_CACHE_TTL {
                    return Ok(*total);
                }
            }
        }

        let url = format!("{}/playlists/{playlist_id}", self.api_base);
        let resp = self
            .send_with_retry(|http| http.get(&url).query(&[("fields", "tracks.total")]))
            .await?;
        let resp = resp.error_for_status()?;
        let body: PlaylistResponse = resp.json().await?;
        let total = body.tracks.map(|t| t.total).unwrap_or(0);

        let mut cache = self.playlist_cache.lock().await;
        if cache.len() >= PLAYLIST_CACHE_MAX && !cache.contains_key(playlist_id) {
            // Evict the stalest entry to stay bounded
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(playlist_id.to_string(), (Instant::now(), total));
        Ok(total)
    }

    /// Random start offset for a shuffled playlist context, when resolvable.
    async fn shuffle_offset(&self, context_uri: Option<&str>) -> Option<u32> {
        let context = context_uri?;
        if !context.contains("playlist") {
            return None;
        }
        let playlist_id = context.rsplit(':').next()?;
        match self.playlist_total_tracks(playlist_id).await {
            Ok(total) if total > 1 => {
                let offset = rand::thread_rng().gen_range(0..total);
                debug!("Starting shuffled playlist at random position {offset} of {total}");
                Some(offset)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Could not get playlist info for random offset: {e}");
                None
            }
        }
    }

    fn play_body(context_uri: Option<&str>, offset: Option<u32>) -> Value {
        let mut body = serde_json::Map::new();
        if let Some(context) = context_uri.filter(|c| !c.is_empty()) {
            body.insert("context_uri".to_string(), Value::String(context.to_string()));
            if let Some(position) = offset {
                body.insert("offset".to_string(), json!({ "position": position }));
            }
        }
        Value::Object(body)
    }

    async fn start_playback(
        &self,
        device_id: &str,
        context_uri: Option<&str>,
        shuffle: bool,
    ) -> Result<StatusCode> {
        // Shuffle state must be set before playback so it applies to the
        // first track; failure to set it is not fatal
        if shuffle {
            if let Err(e) = self.set_shuffle(device_id, true).await {
                warn!("Failed to set shuffle on device {device_id}: {e}");
            }
        }
        let offset = if shuffle {
            self.shuffle_offset(context_uri).await
        } else {
            None
        };
        let url = format!("{}/me/player/play", self.api_base);
        let body = Self::play_body(context_uri, offset);
        let resp = self
            .send_with_retry(|http| {
                http.put(&url)
                    .query(&[("device_id", device_id)])
                    .json(&body)
            })
            .await?;
        Ok(resp.status())
    }

    async fn play_inner(
        &self,
        device_id: &str,
        context_uri: Option<&str>,
        shuffle: bool,
    ) -> Result<()> {
        let status = self.start_playback(device_id, context_uri, shuffle).await?;
        if status == StatusCode::NOT_FOUND {
            // Device vanished mid-command; give it a moment and retry once
            warn!(
                "Device {device_id} not found (404), retrying after {:?}",
                self.retry_404_delay
            );
            tokio::time::sleep(self.retry_404_delay).await;
            let status = self.start_playback(device_id, context_uri, shuffle).await?;
            if !status.is_success() {
                bail!("playback retry on {device_id} failed: HTTP {status}");
            }
            info!("Retry successful, started playback on device {device_id}");
            return Ok(());
        }
        if !status.is_success() {
            bail!("start playback on {device_id} failed: HTTP {status}");
        }
        info!(
            "Started playback on device {device_id} (context: {})",
            context_uri.unwrap_or("current")
        );
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for CloudDirectory {
    async fn get_devices(&self, force_refresh: bool) -> Result<Vec<CloudDevice>> {
        if !force_refresh {
            let cache = self.device_cache.lock().await;
            if let Some((at, devices)) = cache.as_ref() {
                if at.elapsed() < DEVICE_CACHE_TTL {
                    return Ok(devices.clone());
                }
            }
        }

        let url = format!("{}/me/player/devices", self.api_base);
        let resp = self.send_with_retry(|http| http.get(&url)).await?;
        let resp = resp.error_for_status()?;
        let body: DevicesResponse = resp.json().await?;
        debug!(
            "Web API returned {} devices: {:?}",
            body.devices.len(),
            body.devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
        );

        *self.device_cache.lock().await = Some((Instant::now(), body.devices.clone()));
        Ok(body.devices)
    }

    async fn put_transfer(&self, device_id: &str, play: bool) -> Result<()> {
        let url = format!("{}/me/player", self.api_base);
        let body = json!({ "device_ids": [device_id], "play": play });
        let result = async {
            let resp = self
                .send_with_retry(|http| http.put(&url).json(&body))
                .await?;
            resp.error_for_status()?;
            debug!("Transferred playback to device {device_id} (play={play})");
            Ok(())
        }
        .await;
        self.invalidate_device_cache().await;
        result
    }

    async fn put_volume(&self, device_id: &str, percent: u8) -> Result<()> {
        let url = format!("{}/me/player/volume", self.api_base);
        let percent_str = percent.to_string();
        let result = async {
            let resp = self
                .send_with_retry(|http| {
                    http.put(&url).query(&[
                        ("volume_percent", percent_str.as_str()),
                        ("device_id", device_id),
                    ])
                })
                .await?;
            resp.error_for_status()?;
            debug!("Set volume to {percent}% for device {device_id}");
            Ok(())
        }
        .await;
        self.invalidate_device_cache().await;
        result
    }

    async fn put_play(
        &self,
        device_id: &str,
        context_uri: Option<&str>,
        shuffle: bool,
    ) -> Result<()> {
        let result = self.play_inner(device_id, context_uri, shuffle).await;
        self.invalidate_device_cache().await;
        result
    }

    async fn pause_playback(&self, device_id: &str) -> Result<()> {
        let url = format!("{}/me/player/pause", self.api_base);
        let result = async {
            let resp = self
                .send_with_retry(|http| http.put(&url).query(&[("device_id", device_id)]))
                .await?;
            resp.error_for_status()?;
            info!("Paused playback on device {device_id}");
            Ok(())
        }
        .await;
        self.invalidate_device_cache().await;
        result
    }

    async fn verify_device_ready(&self, device_id: &str) -> Result<bool> {
        let url = format!("{}/me/player", self.api_base);
        let timeout = self.verify_timeout;
        let resp = self
            .send_with_retry(|http| http.get(&url).timeout(timeout))
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(false);
        }
        let resp = resp.error_for_status()?;
        let snapshot: PlaybackSnapshot = resp.json().await?;
        let ready = snapshot.is_playing
            && snapshot
                .device
                .and_then(|d| d.id)
                .is_some_and(|id| id == device_id);
        Ok(ready)
    }
}
