//! Shared data model for the wake-and-play engine
//!
//! Profiles are owned by the caller and persisted between runs; everything
//! else here is rebuilt per discovery pass, per directory refresh, or per
//! orchestration run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_volume_preset() -> u8 {
    35
}

fn default_auth_mode() -> String {
    "access_token".to_string()
}

fn default_max_wake_wait() -> u32 {
    22
}

/// Identity record for one physical Connect device.
///
/// Accumulates every name known to refer to the device: the canonical
/// friendly name, the instance name seen on the local network, and any
/// names the cloud directory has reported it under. Cloud matching is
/// always exact against this set, never substring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Friendly name (used for display and matching)
    pub name: String,
    /// Instance name from mDNS discovery, once seen
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Cloud device names learned over time (exact matching only)
    #[serde(default)]
    pub spotify_device_names: Vec<String>,
    /// Static IP if known (enables the direct wake probe)
    #[serde(default)]
    pub ip: Option<String>,
    /// Zeroconf TXT CPath if known
    #[serde(default)]
    pub cpath: Option<String>,
    /// Zeroconf SRV port if known
    #[serde(default)]
    pub port: Option<u16>,
    /// Volume level 0-100 applied when staging
    #[serde(default = "default_volume_preset")]
    pub volume_preset: u8,
    /// Authentication mode for addUser
    #[serde(default = "default_auth_mode")]
    pub auth_mode_for_adduser: String,
    /// Maximum time to wait for device wake, seconds
    #[serde(default = "default_max_wake_wait")]
    pub max_wake_wait_s: u32,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_name: None,
            spotify_device_names: Vec::new(),
            ip: None,
            cpath: None,
            port: None,
            volume_preset: default_volume_preset(),
            auth_mode_for_adduser: default_auth_mode(),
            max_wake_wait_s: default_max_wake_wait(),
        }
    }

    /// Minimal profile for a device that was never registered.
    pub fn minimal(name: impl Into<String>) -> Self {
        Self {
            volume_preset: 30,
            ..Self::new(name)
        }
    }

    /// All names that should match this device, deduplicated case-insensitively
    /// while preserving first-seen order and original casing.
    pub fn get_all_matching_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut names = Vec::new();
        let candidates = std::iter::once(self.name.as_str())
            .chain(self.instance_name.as_deref())
            .chain(self.spotify_device_names.iter().map(String::as_str));
        for candidate in candidates {
            let folded = candidate.trim().to_lowercase();
            if folded.is_empty() {
                continue;
            }
            if seen.insert(folded) {
                names.push(candidate.to_string());
            }
        }
        names
    }

    /// Record a cloud device name for future exact matching.
    /// Returns true if the name was not already known.
    pub fn learn_spotify_name(&mut self, name: &str) -> bool {
        if name.trim().is_empty() {
            return false;
        }
        if self.spotify_device_names.iter().any(|n| n == name) {
            return false;
        }
        self.spotify_device_names.push(name.to_string());
        true
    }
}

/// One local-network advertisement, as resolved during a discovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub cpath: Option<String>,
    pub instance_name: Option<String>,
    #[serde(default)]
    pub txt_records: HashMap<String, String>,
}

impl DiscoveryResult {
    /// Whether the advertisement carries everything needed to speak to the device.
    pub fn is_complete(&self) -> bool {
        self.ip.is_some() && self.port.is_some() && self.cpath.is_some()
    }
}

/// One entry of the cloud directory's device list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudDevice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub is_private_session: bool,
    #[serde(default)]
    pub is_restricted: bool,
}

/// One recorded error from an orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    pub phase: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Timing metrics for one orchestration run.
///
/// Returned on success, attached to the failure on any terminal error, so
/// the caller always sees the per-phase timings up to the point reached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub discovered_ms: Option<u64>,
    pub getinfo_ms: Option<u64>,
    pub adduser_ms: Option<u64>,
    pub cloud_visible_ms: Option<u64>,
    pub play_ms: Option<u64>,
    /// Path taken, e.g. "primary", "webapi_direct", or "failed:<reason>"
    pub branch: Option<String>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub total_duration_ms: u64,
}

impl PhaseMetrics {
    pub fn add_error(&mut self, error: impl Into<String>, phase: Option<&str>) {
        self.errors.push(ErrorRecord {
            error: error.into(),
            phase: phase.map(str::to_string),
            timestamp: Utc::now(),
        });
    }
}

/// Observability state of the target device as a run progresses.
/// Branching is deadline- and result-driven; this is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Unknown,
    Discovered,
    LocalAwake,
    LoggedIn,
    CloudVisible,
    Staged,
    Playing,
    FallbackActive,
    DeepSleepSuspected,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Unknown => "UNKNOWN",
            DeviceState::Discovered => "DISCOVERED",
            DeviceState::LocalAwake => "LOCAL_AWAKE",
            DeviceState::LoggedIn => "LOGGED_IN",
            DeviceState::CloudVisible => "CLOUD_VISIBLE",
            DeviceState::Staged => "STAGED",
            DeviceState::Playing => "PLAYING",
            DeviceState::FallbackActive => "FALLBACK_ACTIVE",
            DeviceState::DeepSleepSuspected => "DEEP_SLEEP_SUSPECTED",
        };
        f.write_str(s)
    }
}
