//! HTTP client for Spotify Connect Zeroconf endpoints
//!
//! Speaks the small action-based protocol a device exposes at the address
//! and CPath carried in its mDNS advertisement: `getInfo` to check whether
//! it is awake, `addUser` to push the account's credentials into it. All
//! operations return booleans or options and log on failure; a device that
//! does not answer is an expected condition, not an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::http::{is_transient_status, RetryPolicy};

/// Auth path used when the advertisement carries none.
pub const DEFAULT_CPATH: &str = "/spotifyconnect/zeroconf";

const USER_AGENT: &str = concat!("connect-alarm/", env!("CARGO_PKG_VERSION"));
/// Bounded connection reuse against many small embedded HTTP stacks
const POOL_MAX_IDLE_PER_HOST: usize = 4;

/// Normalize a CPath: leading `/`, no trailing `/`, default when absent or blank.
pub fn normalize_cpath(cpath: Option<&str>) -> String {
    let trimmed = cpath.unwrap_or("").trim();
    let mut normalized = if trimmed.is_empty() {
        DEFAULT_CPATH.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Credentials for the addUser action, one variant per protocol mode.
#[derive(Debug, Clone)]
pub enum AddUserCredentials {
    AccessToken {
        access_token: String,
    },
    BlobClientKey {
        user_name: String,
        blob: String,
        client_key: String,
        token_type: String,
    },
}

impl AddUserCredentials {
    /// Protocol mode name, for logging.
    pub fn mode(&self) -> &'static str {
        match self {
            AddUserCredentials::AccessToken { .. } => "access_token",
            AddUserCredentials::BlobClientKey { .. } => "blob_clientKey",
        }
    }

    fn fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            AddUserCredentials::AccessToken { access_token } => vec![
                ("tokenType", "accesstoken"),
                ("accessToken", access_token.as_str()),
            ],
            AddUserCredentials::BlobClientKey {
                user_name,
                blob,
                client_key,
                token_type,
            } => vec![
                ("userName", user_name.as_str()),
                ("blob", blob.as_str()),
                ("clientKey", client_key.as_str()),
                ("tokenType", token_type.as_str()),
            ],
        }
    }

    fn json_payload(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in self.fields() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        Value::Object(map)
    }

    fn form_payload(&self) -> Vec<(String, String)> {
        self.fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Structured result of a device health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceHealth {
    pub reachable: bool,
    pub responding: bool,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

/// Seam between the orchestrator and the device protocol, mockable in tests.
#[async_trait]
pub trait ConnectClient: Send + Sync {
    /// Wake probe / activity check. True iff the device answers 200.
    async fn get_info(&self, ip: &str, port: u16, cpath: &str, timeout: Duration) -> bool;

    /// Push account credentials into the device. True iff the device answers 200.
    async fn add_user(
        &self,
        ip: &str,
        port: u16,
        cpath: &str,
        creds: &AddUserCredentials,
        timeout: Duration,
    ) -> bool;

    /// Fetch the getInfo body, used to learn the device's advertised names.
    async fn get_device_info(
        &self,
        ip: &str,
        port: u16,
        cpath: &str,
        timeout: Duration,
    ) -> Option<Value>;
}

/// Production client over a pooled reqwest client.
pub struct ZeroconfClient {
    http: Client,
    retry: RetryPolicy,
}

impl ZeroconfClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .context("build zeroconf http client")?;
        Ok(Self {
            http,
            retry: RetryPolicy::zeroconf(),
        })
    }

    fn endpoint(ip: &str, port: u16, cpath: &str) -> String {
        format!("http://{ip}:{port}{}/", normalize_cpath(Some(cpath)))
    }

    /// GET with bounded retry on connect errors, timeouts and transient statuses.
    async fn get_with_retry(
        &self,
        url: &str,
        action: &str,
        timeout: Duration,
    ) -> Option<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .http
                .get(url)
                .query(&[("action", action)])
                .timeout(timeout)
                .send()
                .await;
            match result {
                Ok(resp) if is_transient_status(resp.status()) => {
                    debug!("{action} on {url} returned {}", resp.status());
                    if attempt >= self.retry.max_attempts {
                        return Some(resp);
                    }
                }
                Ok(resp) => return Some(resp),
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!("{action} on {url} failed: {e}");
                    if attempt >= self.retry.max_attempts {
                        return None;
                    }
                }
                Err(e) => {
                    warn!("{action} on {url} failed: {e}");
                    return None;
                }
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }
    }

    /// Health probe wrapping getInfo with timing diagnostics. Never fails.
    pub async fn check_health(
        &self,
        ip: &str,
        port: u16,
        cpath: &str,
        timeout: Duration,
    ) -> DeviceHealth {
        let url = Self::endpoint(ip, port, cpath);
        let start = Instant::now();
        let result = self
            .http
            .get(&url)
            .query(&[("action", "getInfo")])
            .timeout(timeout)
            .send()
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status() == StatusCode::OK => {
                debug!("Device {ip}:{port} health check passed ({elapsed_ms}ms)");
                DeviceHealth {
                    reachable: true,
                    responding: true,
                    response_time_ms: Some(elapsed_ms),
                    error: None,
                }
            }
            Ok(resp) => DeviceHealth {
                reachable: true,
                responding: false,
                response_time_ms: Some(elapsed_ms),
                error: Some(format!("HTTP {}", resp.status().as_u16())),
            },
            Err(e) => DeviceHealth {
                reachable: false,
                responding: false,
                response_time_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl ConnectClient for ZeroconfClient {
    async fn get_info(&self, ip: &str, port: u16, cpath: &str, timeout: Duration) -> bool {
        let url = Self::endpoint(ip, port, cpath);
        debug!("GET {url}?action=getInfo");

        match self.get_with_retry(&url, "getInfo", timeout).await {
            Some(resp) if resp.status() == StatusCode::OK => {
                info!("Device {ip}:{port} is awake and responding");
                true
            }
            Some(resp) => {
                warn!("Device {ip}:{port} returned status {}", resp.status());
                false
            }
            None => false,
        }
    }

    async fn add_user(
        &self,
        ip: &str,
        port: u16,
        cpath: &str,
        creds: &AddUserCredentials,
        timeout: Duration,
    ) -> bool {
        let url = Self::endpoint(ip, port, cpath);
        let mode = creds.mode();
        debug!("POST {url}?action=addUser mode={mode}");

        // JSON first; some devices only accept form-encoded bodies and
        // answer 415, in which case the identical payload is re-sent as a form.
        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let result = self
                .http
                .post(&url)
                .query(&[("action", "addUser")])
                .json(&creds.json_payload())
                .timeout(timeout)
                .send()
                .await;
            match result {
                Ok(resp) if is_transient_status(resp.status()) => {
                    debug!("addUser on {ip}:{port} returned {}", resp.status());
                    if attempt >= self.retry.max_attempts {
                        break Some(resp);
                    }
                }
                Ok(resp) => break Some(resp),
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!("addUser connection to {ip}:{port} failed: {e}");
                    if attempt >= self.retry.max_attempts {
                        break None;
                    }
                }
                Err(e) => {
                    warn!("addUser on {ip}:{port} failed: {e}");
                    break None;
                }
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        };

        let Some(response) = response else {
            return false;
        };

        match response.status() {
            StatusCode::OK => {
                info!("Authenticated with device {ip}:{port} (mode={mode}, JSON)");
                true
            }
            StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                debug!("Device {ip}:{port} rejected JSON, retrying form-encoded");
                let form_result = self
                    .http
                    .post(&url)
                    .query(&[("action", "addUser")])
                    .form(&creds.form_payload())
                    .timeout(timeout)
                    .send()
                    .await;
                match form_result {
                    Ok(resp) if resp.status() == StatusCode::OK => {
                        info!("Authenticated with device {ip}:{port} (mode={mode}, form)");
                        true
                    }
                    Ok(resp) => {
                        warn!("addUser form fallback on {ip}:{port} failed: {}", resp.status());
                        false
                    }
                    Err(e) => {
                        warn!("addUser form fallback on {ip}:{port} failed: {e}");
                        false
                    }
                }
            }
            status => {
                warn!("addUser failed on {ip}:{port}: status {status}");
                false
            }
        }
    }

    async fn get_device_info(
        &self,
        ip: &str,
        port: u16,
        cpath: &str,
        timeout: Duration,
    ) -> Option<Value> {
        let url = Self::endpoint(ip, port, cpath);

        let resp = self.get_with_retry(&url, "getInfo", timeout).await?;
        if resp.status() != StatusCode::OK {
            warn!("getInfo body fetch from {ip}:{port} failed: {}", resp.status());
            return None;
        }
        match resp.json::<Value>().await {
            Ok(info) => {
                debug!("Device info from {ip}:{port}: {info}");
                Some(info)
            }
            Err(e) => {
                warn!("getInfo body from {ip}:{port} was not JSON: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpath_normalization() {
        assert_eq!(normalize_cpath(None), DEFAULT_CPATH);
        assert_eq!(normalize_cpath(Some("")), DEFAULT_CPATH);
        assert_eq!(normalize_cpath(Some("  ")), DEFAULT_CPATH);
        assert_eq!(normalize_cpath(Some("zc")), "/zc");
        assert_eq!(normalize_cpath(Some("/zc")), "/zc");
        assert_eq!(normalize_cpath(Some("/zc/")), "/zc");
        assert_eq!(normalize_cpath(Some("zc///")), "/zc");
        assert_eq!(normalize_cpath(Some("/")), "/");
    }

    #[test]
    fn endpoint_includes_normalized_cpath() {
        assert_eq!(
            ZeroconfClient::endpoint("192.168.1.20", 8080, "zc/"),
            "http://192.168.1.20:8080/zc/"
        );
    }

    #[test]
    fn access_token_payload_shape() {
        let creds = AddUserCredentials::AccessToken {
            access_token: "tok-1".to_string(),
        };
        let payload = creds.json_payload();
        assert_eq!(payload["tokenType"], "accesstoken");
        assert_eq!(payload["accessToken"], "tok-1");
        assert_eq!(creds.mode(), "access_token");
    }

    #[test]
    fn blob_payload_shape() {
        let creds = AddUserCredentials::BlobClientKey {
            user_name: "alarm_user".to_string(),
            blob: "b64blob".to_string(),
            client_key: "ck".to_string(),
            token_type: "default".to_string(),
        };
        let payload = creds.json_payload();
        assert_eq!(payload["userName"], "alarm_user");
        assert_eq!(payload["blob"], "b64blob");
        assert_eq!(payload["clientKey"], "ck");
        assert_eq!(creds.mode(), "blob_clientKey");

        let form = creds.form_payload();
        assert_eq!(form.len(), 4);
        assert!(form.contains(&("blob".to_string(), "b64blob".to_string())));
    }
}
