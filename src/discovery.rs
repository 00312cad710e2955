//! mDNS/DNS-SD discovery of Spotify Connect devices
//!
//! Browses `_spotify-connect._tcp.local.` and extracts the connection
//! coordinates (address, port, CPath) from each resolved advertisement.
//! Browsing never fails: any daemon or network error yields empty results
//! and a warning, and the orchestrator's deadline logic decides what that
//! means.

use async_trait::async_trait;
use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::models::DiscoveryResult;
use crate::zeroconf::normalize_cpath;

pub const SERVICE_TYPE: &str = "_spotify-connect._tcp.local.";

/// Grace window granted after each new advertisement while enumerating,
/// so late responders in a large fleet are not dropped at the deadline.
const IDLE_GRACE: Duration = Duration::from_millis(300);

/// Seam between the orchestrator and local discovery, mockable in tests.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Browse for up to `timeout`, returning the best match for `name_hint`:
    /// exact case-insensitive instance match, then substring in either
    /// direction, then the first advertisement seen. Empty (incomplete)
    /// result when nothing was found.
    async fn discover_one(&self, name_hint: Option<&str>, timeout: Duration) -> DiscoveryResult;

    /// Browse without a hint, accumulating all unique advertisements seen
    /// within the window (deduplicated by instance name).
    async fn discover_all(&self, timeout: Duration) -> Vec<DiscoveryResult>;
}

/// Production discovery over an mDNS service daemon.
#[derive(Debug, Default)]
pub struct MdnsDiscovery;

impl MdnsDiscovery {
    pub fn new() -> Self {
        Self
    }
}

fn result_from_service(service: &ResolvedService) -> DiscoveryResult {
    let instance_name = service
        .get_fullname()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string();

    // Prefer an IPv4 address; embedded Connect stacks often only listen there
    let ip = service
        .addresses
        .iter()
        .find(|addr| matches!(addr, ScopedIp::V4(_)))
        .or_else(|| service.addresses.iter().next())
        .map(|addr| addr.to_ip_addr().to_string());

    let mut txt_records = HashMap::new();
    for prop in service.txt_properties.iter() {
        txt_records.insert(prop.key().to_string(), prop.val_str().to_string());
    }

    let cpath = normalize_cpath(service.get_property_val_str("CPath"));

    DiscoveryResult {
        ip,
        port: Some(service.get_port()),
        cpath: Some(cpath),
        instance_name: Some(instance_name),
        txt_records,
    }
}

/// Whether an instance satisfies the hint as a containment match
/// (either direction, case-insensitive).
fn hint_matches(hint: &str, instance: &str) -> bool {
    let hint = hint.to_lowercase();
    let instance = instance.to_lowercase();
    instance.contains(&hint) || hint.contains(&instance)
}

struct BrowseSession {
    daemon: ServiceDaemon,
    receiver: mdns_sd::Receiver<ServiceEvent>,
}

impl BrowseSession {
    fn start() -> Option<Self> {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                warn!("mDNS daemon unavailable: {e}");
                return None;
            }
        };
        let receiver = match daemon.browse(SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("mDNS browse failed: {e}");
                let _ = daemon.shutdown();
                return None;
            }
        };
        Some(Self { daemon, receiver })
    }
}

impl Drop for BrowseSession {
    fn drop(&mut self) {
        // Daemon cleanup hiccups are a known non-fatal condition
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!("stop_browse: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {e}");
        }
    }
}

#[async_trait]
impl DeviceDiscovery for MdnsDiscovery {
    async fn discover_one(&self, name_hint: Option<&str>, window: Duration) -> DiscoveryResult {
        info!(
            "Starting mDNS discovery (hint: {:?}, timeout: {:?})",
            name_hint, window
        );

        let Some(session) = BrowseSession::start() else {
            return DiscoveryResult::default();
        };

        let mut seen: Vec<DiscoveryResult> = Vec::new();
        let deadline = Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let event = match timeout(remaining, session.receiver.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) | Err(_) => break,
            };
            if let ServiceEvent::ServiceResolved(service) = event {
                let result = result_from_service(&service);
                debug!(
                    "Resolved {} at {:?}:{:?}",
                    result.instance_name.as_deref().unwrap_or("?"),
                    result.ip,
                    result.port
                );
                let satisfied = match (name_hint, result.instance_name.as_deref()) {
                    (Some(hint), Some(instance)) => hint_matches(hint, instance),
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                seen.push(result);
                if satisfied {
                    break;
                }
            }
        }

        if seen.is_empty() {
            warn!("No Connect devices discovered");
            return DiscoveryResult::default();
        }

        let chosen = match name_hint {
            Some(hint) => {
                let exact = seen.iter().find(|r| {
                    r.instance_name
                        .as_deref()
                        .is_some_and(|i| i.eq_ignore_ascii_case(hint))
                });
                let partial = || {
                    seen.iter().find(|r| {
                        r.instance_name
                            .as_deref()
                            .is_some_and(|i| hint_matches(hint, i))
                    })
                };
                exact.or_else(partial).unwrap_or(&seen[0])
            }
            None => &seen[0],
        };

        info!(
            "Discovery successful: {} at {:?}:{:?}",
            chosen.instance_name.as_deref().unwrap_or("?"),
            chosen.ip,
            chosen.port
        );
        chosen.clone()
    }

    async fn discover_all(&self, window: Duration) -> Vec<DiscoveryResult> {
        info!("Discovering all Connect devices (timeout: {:?})", window);

        let Some(session) = BrowseSession::start() else {
            return Vec::new();
        };

        // Keyed by case-folded instance name; a later advertisement for the
        // same instance replaces the earlier one but keeps its position.
        let mut by_instance: HashMap<String, usize> = HashMap::new();
        let mut results: Vec<DiscoveryResult> = Vec::new();
        let deadline = Instant::now() + window;

        fn record(
            service: &ResolvedService,
            by_instance: &mut HashMap<String, usize>,
            results: &mut Vec<DiscoveryResult>,
        ) {
            let result = result_from_service(service);
            let key = result
                .instance_name
                .as_deref()
                .unwrap_or_default()
                .to_lowercase();
            match by_instance.get(&key) {
                Some(&idx) => results[idx] = result,
                None => {
                    by_instance.insert(key, results.len());
                    results.push(result);
                }
            }
        }

        'outer: loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, session.receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(service))) => {
                    record(&service, &mut by_instance, &mut results);
                    // Grace loop: keep collecting while advertisements keep
                    // arriving, even slightly past the deadline
                    loop {
                        match timeout(IDLE_GRACE, session.receiver.recv_async()).await {
                            Ok(Ok(ServiceEvent::ServiceResolved(service))) => {
                                record(&service, &mut by_instance, &mut results);
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(_)) => break 'outer,
                            Err(_) => continue 'outer,
                        }
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        info!("Discovered {} Connect devices", results.len());
        results
    }
}
