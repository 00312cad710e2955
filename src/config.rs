//! Configuration management
//!
//! Layering: built-in defaults, then an optional `alarm` config file in the
//! platform config directory, then `ALARM_`-prefixed environment variables.
//! The legacy `SPOTIFY_*` / `ALARM_CONTEXT_URI` names are honored as
//! overrides for deployments that predate the config file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::DeviceProfile;

/// Cloud account credentials consumed by the token manager.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Long-lived refresh credential for the account
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// Token cache file; defaults to `<data dir>/token.json`
    #[serde(default)]
    pub token_cache: Option<PathBuf>,
}

fn default_redirect_uri() -> String {
    "https://localhost/callback".to_string()
}

impl AuthConfig {
    pub fn token_cache_path(&self) -> PathBuf {
        self.token_cache
            .clone()
            .unwrap_or_else(|| get_data_dir().join("token.json"))
    }
}

/// Every timeout, sleep and deadline the state machine uses. Seconds, to
/// match the on-disk config schema; accessors convert to `Duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Pre-warm lead time consumed by the scheduling caller
    pub prewarm_s: u64,
    pub poll_fast_period_s: f64,
    pub total_poll_deadline_s: u64,
    /// Extra poll time granted after a successful addUser
    pub poll_deadline_extension_s: u64,
    pub debounce_after_seen_s: f64,
    pub retry_404_delay_s: f64,
    pub failover_fire_after_s: f64,
    pub adduser_wait_after_s: f64,
    pub mdns_discovery_timeout_s: f64,
    pub getinfo_timeout_s: f64,
    pub adduser_timeout_s: f64,
    pub device_info_timeout_s: f64,
    pub verify_device_ready_timeout_s: f64,
    pub confirmation_sleep_s: f64,
    pub poll_sleep_fast_s: f64,
    pub poll_sleep_slow_s: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            prewarm_s: 60,
            poll_fast_period_s: 5.0,
            total_poll_deadline_s: 20,
            poll_deadline_extension_s: 15,
            debounce_after_seen_s: 0.6,
            retry_404_delay_s: 0.7,
            failover_fire_after_s: 2.0,
            adduser_wait_after_s: 5.0,
            mdns_discovery_timeout_s: 1.5,
            getinfo_timeout_s: 1.5,
            adduser_timeout_s: 2.5,
            device_info_timeout_s: 2.0,
            verify_device_ready_timeout_s: 0.5,
            confirmation_sleep_s: 0.2,
            poll_sleep_fast_s: 0.5,
            poll_sleep_slow_s: 1.0,
        }
    }
}

impl Timings {
    pub fn poll_fast_period(&self) -> Duration {
        Duration::from_secs_f64(self.poll_fast_period_s)
    }
    pub fn total_poll_deadline(&self) -> Duration {
        Duration::from_secs(self.total_poll_deadline_s)
    }
    pub fn poll_deadline_extension(&self) -> Duration {
        Duration::from_secs(self.poll_deadline_extension_s)
    }
    pub fn debounce_after_seen(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_after_seen_s)
    }
    pub fn retry_404_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_404_delay_s)
    }
    pub fn failover_fire_after(&self) -> Duration {
        Duration::from_secs_f64(self.failover_fire_after_s)
    }
    pub fn adduser_wait_after(&self) -> Duration {
        Duration::from_secs_f64(self.adduser_wait_after_s)
    }
    pub fn mdns_discovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.mdns_discovery_timeout_s)
    }
    pub fn getinfo_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.getinfo_timeout_s)
    }
    pub fn adduser_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.adduser_timeout_s)
    }
    pub fn device_info_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.device_info_timeout_s)
    }
    pub fn verify_device_ready_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.verify_device_ready_timeout_s)
    }
    pub fn confirmation_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.confirmation_sleep_s)
    }
    pub fn poll_sleep_fast(&self) -> Duration {
        Duration::from_secs_f64(self.poll_sleep_fast_s)
    }
    pub fn poll_sleep_slow(&self) -> Duration {
        Duration::from_secs_f64(self.poll_sleep_slow_s)
    }
}

/// Full engine configuration, as loaded by `load_config` or assembled by
/// the caller directly.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    /// Registered target device profiles
    #[serde(default)]
    pub targets: Vec<DeviceProfile>,
    #[serde(default)]
    pub timings: Timings,
    /// Context URI (playlist/album/artist) started at alarm fire
    #[serde(default)]
    pub context_uri: String,
    #[serde(default)]
    pub shuffle: bool,
}

/// Get config directory (ALARM_CONFIG_DIR, XDG, or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ALARM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/connect-alarm");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("connect-alarm");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/connect-alarm");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("connect-alarm");
        }
    }

    PathBuf::from(".")
}

/// Get data directory (ALARM_DATA_DIR, XDG, or platform default)
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ALARM_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/connect-alarm");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("connect-alarm");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share/connect-alarm");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("connect-alarm");
        }
    }

    PathBuf::from("./data")
}

pub fn load_config() -> Result<EngineConfig> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .add_source(
            ::config::File::with_name(&config_dir.join("alarm").to_string_lossy()).required(false),
        )
        .add_source(
            ::config::Environment::with_prefix("ALARM")
                .separator("__")
                .try_parsing(true),
        );

    // Legacy env names used before the config file existed
    if let Ok(id) = std::env::var("SPOTIFY_CLIENT_ID") {
        builder = builder.set_override("auth.client_id", id)?;
    }
    if let Ok(secret) = std::env::var("SPOTIFY_CLIENT_SECRET") {
        builder = builder.set_override("auth.client_secret", secret)?;
    }
    if let Ok(token) = std::env::var("SPOTIFY_REFRESH_TOKEN") {
        builder = builder.set_override("auth.refresh_token", token)?;
    }
    if let Ok(uri) = std::env::var("SPOTIFY_REDIRECT_URI") {
        builder = builder.set_override("auth.redirect_uri", uri)?;
    }
    if let Ok(uri) = std::env::var("ALARM_CONTEXT_URI") {
        builder = builder.set_override("context_uri", uri)?;
    }

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}
