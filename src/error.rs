//! Failure taxonomy for orchestration runs
//!
//! Local/network sub-operations never raise; they return booleans or empty
//! results. Only the orchestrator's deadline logic converts the absence of
//! success into one of these tagged failures, and every failure carries the
//! metrics accumulated up to that point.

use thiserror::Error;

use crate::models::PhaseMetrics;

/// Why a run terminated without a confirmed playing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Breaker open for this device; no network action was attempted
    CircuitBreakerOpen,
    /// Local discovery found nothing and no cached address exists
    NoMdns,
    /// Device never became cloud-visible within the poll deadline
    NotInDevicesByDeadline,
    /// Playback command accepted but never confirmed within the window
    PlayNotConfirmed,
    /// The run was cancelled externally
    Cancelled,
    /// Unexpected internal error, wrapped
    Internal(String),
}

impl FailureReason {
    /// Stable tag recorded in `PhaseMetrics::branch` as `failed:<tag>`.
    pub fn tag(&self) -> &str {
        match self {
            FailureReason::CircuitBreakerOpen => "circuit_breaker_open",
            FailureReason::NoMdns => "no_mdns",
            FailureReason::NotInDevicesByDeadline => "not_in_devices_by_deadline",
            FailureReason::PlayNotConfirmed => "play_not_confirmed_t2",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Internal(_) => "internal_error",
        }
    }

    /// Human-readable message with a remediation hint where one exists.
    pub fn message_for(&self, target_name: &str) -> String {
        match self {
            FailureReason::CircuitBreakerOpen => format!(
                "Device '{target_name}' has failed multiple times and its circuit breaker is \
                 open. The device may need manual authentication or troubleshooting."
            ),
            FailureReason::NoMdns => format!(
                "Device '{target_name}' could not be discovered on the network. Check that the \
                 device is powered on and connected to the same network."
            ),
            FailureReason::NotInDevicesByDeadline => format!(
                "Device '{target_name}' did not appear in the cloud device list within the \
                 deadline. This usually means the device needs manual authentication first: open \
                 the Spotify app, select '{target_name}' as the playback device, and play any \
                 song once. Then retry the alarm."
            ),
            FailureReason::PlayNotConfirmed => format!(
                "Playback was started on '{target_name}' but was not confirmed within the \
                 confirmation window."
            ),
            FailureReason::Cancelled => {
                format!("Alarm playback for '{target_name}' was cancelled before completion.")
            }
            FailureReason::Internal(detail) => format!(
                "Alarm playback failed for '{target_name}': {detail}. The primary Connect flow \
                 must succeed; no fallback path is available."
            ),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Terminal failure of one `play_alarm` run.
#[derive(Debug, Error)]
#[error("alarm playback failed ({}): {message}", .reason.tag())]
pub struct PlaybackFailure {
    pub reason: FailureReason,
    pub message: String,
    pub metrics: PhaseMetrics,
}

/// Token manager errors. Fatal for the current run: without a usable
/// credential source no cloud call can be made.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no usable credential source: {0}")]
    NoCredentials(String),
    #[error("token endpoint rejected refresh: HTTP {status}: {body}")]
    RefreshRejected { status: u16, body: String },
    #[error("token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token cache: {0}")]
    Cache(#[from] std::io::Error),
    #[error("token payload: {0}")]
    Payload(#[from] serde_json::Error),
}
