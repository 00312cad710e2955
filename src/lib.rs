//! connect-alarm - wake-and-play orchestration for Spotify Connect targets
//!
//! Wakes a sleeping Connect device and drives it into a confirmed playing
//! state by alarm time, even when the device starts out unauthenticated or
//! absent from the cloud device list.
//!
//! This library provides:
//! - mDNS/DNS-SD discovery of Connect devices
//! - The Zeroconf device protocol (getInfo/addUser) over HTTP
//! - OAuth token lifecycle with single-flight refresh
//! - A cached, retrying cloud device directory client
//! - Per-device circuit breakers
//! - The deadline-driven wake-and-play orchestrator

pub mod breaker;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod token;
pub mod zeroconf;

pub use config::{load_config, EngineConfig, Timings};
pub use error::{AuthError, FailureReason, PlaybackFailure};
pub use models::{CloudDevice, DeviceProfile, DiscoveryResult, PhaseMetrics};
pub use orchestrator::AlarmEngine;
