//! Per-device circuit breakers
//!
//! A device that keeps failing stops being probed for a cooldown window so
//! an alarm storm cannot hammer a dead endpoint. States are created lazily
//! and live for the lifetime of the engine.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Consecutive failures before the breaker opens.
const FAILURE_THRESHOLD: u32 = 3;
/// The breaker self-closes once this much time has passed since the last failure.
const COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct BreakerState {
    failure_count: u32,
    last_failure_time: Option<Instant>,
    is_open: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure_time: None,
            is_open: false,
        }
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());
        if self.failure_count >= FAILURE_THRESHOLD {
            self.is_open = true;
        }
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure_time = None;
        self.is_open = false;
    }

    fn should_bypass_primary(&mut self) -> bool {
        if !self.is_open {
            return false;
        }
        if let Some(last) = self.last_failure_time {
            if last.elapsed() > COOLDOWN {
                self.is_open = false;
                return false;
            }
        }
        true
    }
}

/// Point-in-time breaker state, exposed for device status queries.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub is_open: bool,
    /// Seconds since the last recorded failure, if any
    pub last_failure_age_s: Option<u64>,
}

/// Registry of breakers keyed by device name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, device_name: &str) {
        let mut states = self.states.lock().expect("breaker registry poisoned");
        let state = states
            .entry(device_name.to_string())
            .or_insert_with(BreakerState::new);
        state.record_failure();
        if state.is_open {
            warn!(
                "Circuit breaker open for {} after {} failures",
                device_name, state.failure_count
            );
        } else {
            warn!(
                "Recorded failure for {} ({}/{})",
                device_name, state.failure_count, FAILURE_THRESHOLD
            );
        }
    }

    pub fn record_success(&self, device_name: &str) {
        let mut states = self.states.lock().expect("breaker registry poisoned");
        states
            .entry(device_name.to_string())
            .or_insert_with(BreakerState::new)
            .record_success();
        info!("Recorded success for {}", device_name);
    }

    /// True while the breaker is open and inside the cooldown window.
    /// Self-closes (and returns false) once the cooldown has elapsed.
    pub fn should_bypass_primary(&self, device_name: &str) -> bool {
        let mut states = self.states.lock().expect("breaker registry poisoned");
        states
            .entry(device_name.to_string())
            .or_insert_with(BreakerState::new)
            .should_bypass_primary()
    }

    /// Force-close a breaker, e.g. from an operator action.
    pub fn reset(&self, device_name: &str) -> bool {
        let mut states = self.states.lock().expect("breaker registry poisoned");
        match states.get_mut(device_name) {
            Some(state) => {
                state.record_success();
                info!("Reset circuit breaker for {}", device_name);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, device_name: &str) -> BreakerSnapshot {
        let states = self.states.lock().expect("breaker registry poisoned");
        match states.get(device_name) {
            Some(state) => BreakerSnapshot {
                failure_count: state.failure_count,
                is_open: state.is_open,
                last_failure_age_s: state.last_failure_time.map(|t| t.elapsed().as_secs()),
            },
            None => BreakerSnapshot {
                failure_count: 0,
                is_open: false,
                last_failure_age_s: None,
            },
        }
    }
}
