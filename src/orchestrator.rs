//! Wake-and-play timeline orchestration
//!
//! One `play_alarm` run drives a single target device from unknown to a
//! confirmed playing state: cloud fast path, direct-IP wake, local
//! discovery, device authentication, cloud-visibility polling, staging,
//! playback, confirmation. Each phase has its own deadline and exits early
//! to success as soon as the device is confirmed playing; branching is
//! driven by deadlines and results, never by the observability state.

use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::config::{EngineConfig, Timings};
use crate::credentials::{CredentialProvider, NoCredentialProvider};
use crate::directory::{CloudDirectory, DeviceDirectory};
use crate::discovery::{DeviceDiscovery, MdnsDiscovery};
use crate::error::{AuthError, FailureReason, PlaybackFailure};
use crate::models::{CloudDevice, DeviceProfile, DeviceState, DiscoveryResult, PhaseMetrics};
use crate::token::TokenManager;
use crate::zeroconf::{normalize_cpath, AddUserCredentials, ConnectClient, ZeroconfClient};

/// Timeout of the direct-IP wake probe, independent of the regular getInfo
/// timeout: a device coming out of sleep answers slowly or not at all.
const IP_WAKE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// getInfo fields a device may advertise its visible name under.
const DEVICE_NAME_FIELDS: &[&str] = &["remoteName", "displayName", "name", "deviceName"];

/// Volume preset applied to devices that were never registered.
const UNREGISTERED_VOLUME_PRESET: u8 = 30;

/// Current status of one target, for the caller's status surface.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub profile: DeviceProfile,
    pub circuit_breaker: BreakerSnapshot,
}

/// Internal per-phase error: either a terminal tagged failure or an
/// unexpected error that becomes the catch-all tag at the boundary.
enum PhaseError {
    Terminal(FailureReason),
    Unexpected(anyhow::Error),
}

impl From<anyhow::Error> for PhaseError {
    fn from(e: anyhow::Error) -> Self {
        PhaseError::Unexpected(e)
    }
}

impl From<AuthError> for PhaseError {
    fn from(e: AuthError) -> Self {
        PhaseError::Unexpected(e.into())
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Exact (case-insensitive, trimmed) match of a cloud device against the
/// profile's alias set. Never substring.
fn exact_match<'a>(devices: &'a [CloudDevice], names: &[String]) -> Option<&'a CloudDevice> {
    let folded: Vec<String> = names.iter().map(|n| n.trim().to_lowercase()).collect();
    devices.iter().find(|device| {
        let candidate = device.name.trim().to_lowercase();
        !candidate.is_empty() && folded.iter().any(|n| *n == candidate)
    })
}

/// The wake-and-play engine. One instance per process; every `play_alarm`
/// invocation runs its own timeline, sharing the token manager, directory
/// caches, profile registry and circuit breakers.
pub struct AlarmEngine {
    timings: Timings,
    context_uri: String,
    shuffle: bool,
    tokens: Arc<TokenManager>,
    directory: Arc<dyn DeviceDirectory>,
    discovery: Arc<dyn DeviceDiscovery>,
    connect: Arc<dyn ConnectClient>,
    credentials: Arc<dyn CredentialProvider>,
    breakers: CircuitBreakerRegistry,
    profiles: Mutex<HashMap<String, DeviceProfile>>,
}

impl AlarmEngine {
    /// Build an engine with production components.
    pub fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        let tokens = Arc::new(TokenManager::new(cfg.auth.clone()));
        let directory = Arc::new(CloudDirectory::new(tokens.clone(), &cfg.timings));
        Ok(Self::with_components(
            cfg,
            tokens,
            directory,
            Arc::new(MdnsDiscovery::new()),
            Arc::new(ZeroconfClient::new()?),
            Arc::new(NoCredentialProvider),
        ))
    }

    /// Build an engine from explicit components (tests, embedders).
    pub fn with_components(
        cfg: EngineConfig,
        tokens: Arc<TokenManager>,
        directory: Arc<dyn DeviceDirectory>,
        discovery: Arc<dyn DeviceDiscovery>,
        connect: Arc<dyn ConnectClient>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let profiles: HashMap<String, DeviceProfile> = cfg
            .targets
            .into_iter()
            .map(|profile| (profile.name.clone(), profile))
            .collect();
        info!(
            "Initialized alarm engine with {} target devices",
            profiles.len()
        );
        Self {
            timings: cfg.timings,
            context_uri: cfg.context_uri,
            shuffle: cfg.shuffle,
            tokens,
            directory,
            discovery,
            connect,
            credentials,
            breakers: CircuitBreakerRegistry::new(),
            profiles: Mutex::new(profiles),
        }
    }

    /// Replace the blob-mode credential provider.
    pub fn with_credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    /// The profile for a device, including any aliases learned so far.
    pub fn profile(&self, name: &str) -> Option<DeviceProfile> {
        self.profiles
            .lock()
            .expect("profile registry poisoned")
            .get(name)
            .cloned()
    }

    /// All registered profiles. The caller persists these after a run to
    /// keep learned cloud names across restarts.
    pub fn profiles(&self) -> Vec<DeviceProfile> {
        self.profiles
            .lock()
            .expect("profile registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Status of one target: profile plus breaker state.
    pub fn device_status(&self, name: &str) -> Option<DeviceStatus> {
        let profile = self.profile(name)?;
        Some(DeviceStatus {
            name: name.to_string(),
            circuit_breaker: self.breakers.snapshot(name),
            profile,
        })
    }

    /// Force-close a device's circuit breaker. Returns false for a device
    /// that has no breaker state yet.
    pub fn reset_circuit_breaker(&self, name: &str) -> bool {
        self.breakers.reset(name)
    }

    /// Run the wake-and-play timeline for the target device.
    pub async fn play_alarm(&self, target_name: &str) -> Result<PhaseMetrics, PlaybackFailure> {
        self.play_alarm_cancellable(target_name, CancellationToken::new())
            .await
    }

    /// Like `play_alarm`, but the whole run can be aborted through `cancel`
    /// without waiting out the individual phase timeouts.
    pub async fn play_alarm_cancellable(
        &self,
        target_name: &str,
        cancel: CancellationToken,
    ) -> Result<PhaseMetrics, PlaybackFailure> {
        info!("Starting alarm playback for device: {target_name}");
        let run_start = Instant::now();
        let mut metrics = PhaseMetrics::default();

        let outcome = self
            .run_timeline(target_name, &cancel, &mut metrics, run_start)
            .await;
        metrics.total_duration_ms = elapsed_ms(run_start);

        match outcome {
            Ok(branch) => {
                metrics.branch = Some(branch.to_string());
                self.breakers.record_success(target_name);
                info!(
                    "Alarm playback completed for {target_name} via {branch} in {}ms",
                    metrics.total_duration_ms
                );
                Ok(metrics)
            }
            Err(err) => {
                let reason = match err {
                    PhaseError::Terminal(reason) => reason,
                    PhaseError::Unexpected(e) => {
                        error!("Alarm playback for {target_name} hit an unexpected error: {e:#}");
                        FailureReason::Internal(format!("{e:#}"))
                    }
                };
                // An open breaker or an external cancel is not evidence the
                // device got worse; everything else counts against it
                match reason {
                    FailureReason::CircuitBreakerOpen | FailureReason::Cancelled => {}
                    _ => self.breakers.record_failure(target_name),
                }
                let message = reason.message_for(target_name);
                metrics.branch = Some(format!("failed:{}", reason.tag()));
                metrics.add_error(message.clone(), Some(reason.tag()));
                error!("Alarm failed for {target_name}: {message}");
                Err(PlaybackFailure {
                    reason,
                    message,
                    metrics,
                })
            }
        }
    }

    async fn run_timeline(
        &self,
        target_name: &str,
        cancel: &CancellationToken,
        metrics: &mut PhaseMetrics,
        run_start: Instant,
    ) -> Result<&'static str, PhaseError> {
        // Circuit check gates everything: an open breaker means no network
        // action at all for this device
        if self.breakers.should_bypass_primary(target_name) {
            warn!("Bypassing primary path for {target_name}: circuit breaker open");
            return Err(PhaseError::Terminal(FailureReason::CircuitBreakerOpen));
        }
        self.ensure_not_cancelled(cancel)?;

        // Phase 1: cloud fast path. A device that is already cloud-visible
        // needs neither discovery nor authentication.
        let webapi_start = Instant::now();
        match self.directory.get_devices(true).await {
            Ok(devices) => {
                if let Some(device) = self.pick_device(&devices, target_name).cloned() {
                    info!(
                        "Device {target_name} already cloud-visible, skipping local discovery \
                         and addUser"
                    );
                    self.learn_cloud_name(target_name, &device.name);
                    metrics.discovered_ms = Some(elapsed_ms(webapi_start));
                    debug!("{target_name}: {}", DeviceState::CloudVisible);
                    let volume = self
                        .profile(target_name)
                        .map(|p| p.volume_preset)
                        .unwrap_or(UNREGISTERED_VOLUME_PRESET);
                    self.stage_and_play(target_name, &device, volume, metrics, cancel)
                        .await?;
                    return Ok("webapi_direct");
                }
                info!("Device {target_name} not cloud-visible, proceeding with local discovery");
            }
            Err(e) => {
                warn!("Cloud fast-path check failed for {target_name}: {e:#}");
                metrics.add_error(format!("webapi check failed: {e:#}"), Some("webapi_check"));
            }
        }

        let mut target = self.profile_or_minimal(target_name);

        // Phase 3: direct-IP wake, when a cached address exists
        if let Some(ip) = target.ip.clone() {
            let port = target.port.unwrap_or(80);
            let cpath = normalize_cpath(target.cpath.as_deref());
            let awake = self
                .connect
                .get_info(&ip, port, &cpath, IP_WAKE_PROBE_TIMEOUT)
                .await;
            if awake {
                info!("IP wake-up probe succeeded for {target_name}, re-checking directory");
                if let Ok(devices) = self.directory.get_devices(true).await {
                    if let Some(device) = self.pick_device(&devices, target_name).cloned() {
                        info!("Device {target_name} appeared after IP wake-up, skipping to staging");
                        self.learn_cloud_name(target_name, &device.name);
                        metrics.cloud_visible_ms = Some(elapsed_ms(run_start));
                        self.sleep_cancellable(self.timings.debounce_after_seen(), cancel)
                            .await?;
                        self.stage_and_play(
                            target_name,
                            &device,
                            target.volume_preset,
                            metrics,
                            cancel,
                        )
                        .await?;
                        return Ok("primary_ip_wakeup");
                    }
                }
            }
        }

        // Phase 4: local discovery
        let discovery_start = Instant::now();
        let mut found = self
            .discovery
            .discover_one(Some(target.name.as_str()), self.timings.mdns_discovery_timeout())
            .await;
        metrics.discovered_ms = Some(elapsed_ms(discovery_start));

        if found.is_complete() {
            if let Some(instance) = found.instance_name.clone() {
                if target.instance_name.is_none() {
                    debug!("Storing instance name '{instance}' for {target_name}");
                    target.instance_name = Some(instance.clone());
                    self.note_instance_name(target_name, &instance);
                }
            }
        } else if target.ip.is_some() {
            // Cached coordinates stand in for a missed advertisement
            info!("Local discovery found nothing for {target_name}, using cached address");
            found = DiscoveryResult {
                ip: target.ip.clone(),
                port: Some(target.port.unwrap_or(80)),
                cpath: Some(normalize_cpath(target.cpath.as_deref())),
                instance_name: Some(target.name.clone()),
                txt_records: HashMap::new(),
            };
        } else {
            warn!("Device {target_name}: {}", DeviceState::DeepSleepSuspected);
            return Err(PhaseError::Terminal(FailureReason::NoMdns));
        }

        let (ip, port, cpath) = match (found.ip.clone(), found.port, found.cpath.clone()) {
            (Some(ip), Some(port), Some(cpath)) => (ip, port, cpath),
            _ => return Err(PhaseError::Terminal(FailureReason::NoMdns)),
        };
        debug!("{target_name}: {}", DeviceState::Discovered);

        // Phase 5: activate. getInfo is a soft check; addUser pushes the
        // account's credentials into the device.
        let getinfo_start = Instant::now();
        let local_ok = self
            .connect
            .get_info(&ip, port, &cpath, self.timings.getinfo_timeout())
            .await;
        metrics.getinfo_ms = Some(elapsed_ms(getinfo_start));
        if local_ok {
            debug!("{target_name}: {}", DeviceState::LocalAwake);
        } else {
            warn!("getInfo failed for {target_name}, attempting addUser anyway");
        }

        let adduser_start = Instant::now();
        if let Err(e) = self.tokens.refresh_if_needed(false).await {
            warn!("Token refresh before addUser failed (non-fatal): {e}");
        }
        let access_token = self.tokens.get_access_token().await?;
        if access_token.trim().is_empty() {
            return Err(PhaseError::Unexpected(anyhow!("access token is empty")));
        }
        let mut auth_ok = self
            .connect
            .add_user(
                &ip,
                port,
                &cpath,
                &AddUserCredentials::AccessToken { access_token },
                self.timings.adduser_timeout(),
            )
            .await;
        if !auth_ok {
            info!("access_token mode failed for {target_name}, trying blob_clientKey mode");
            match self.credentials.blob_client_key().await {
                Ok(creds) => {
                    auth_ok = self
                        .connect
                        .add_user(&ip, port, &cpath, &creds, self.timings.adduser_timeout())
                        .await;
                }
                Err(e) => debug!("blob_clientKey mode unavailable: {e}"),
            }
        }
        metrics.adduser_ms = Some(elapsed_ms(adduser_start));

        if auth_ok {
            info!("addUser succeeded for {target_name}");
            debug!("{target_name}: {}", DeviceState::LoggedIn);
            if let Err(e) = self.tokens.refresh_if_needed(false).await {
                warn!("Token refresh after addUser failed (non-fatal): {e}");
            }

            // The device may advertise itself under a different name once
            // authenticated; learn every name field it reports
            if let Some(info_body) = self
                .connect
                .get_device_info(&ip, port, &cpath, self.timings.device_info_timeout())
                .await
            {
                for field in DEVICE_NAME_FIELDS {
                    if let Some(value) = info_body.get(field).and_then(|v| v.as_str()) {
                        if self.learn_cloud_name(target_name, value.trim()) {
                            info!("Learned device name '{}' from getInfo after addUser", value);
                        }
                    }
                }
            }

            let wait = self.timings.adduser_wait_after();
            info!("Waiting {wait:?} for {target_name} to register after addUser");
            self.sleep_cancellable(wait, cancel).await?;

            if let Ok(devices) = self.directory.get_devices(true).await {
                if let Some(device) = self.pick_device(&devices, target_name).cloned() {
                    info!("Device {target_name} appeared immediately after addUser wait");
                    self.learn_cloud_name(target_name, &device.name);
                    metrics.cloud_visible_ms = Some(elapsed_ms(run_start));
                    self.sleep_cancellable(self.timings.debounce_after_seen(), cancel)
                        .await?;
                    self.stage_and_play(target_name, &device, target.volume_preset, metrics, cancel)
                        .await?;
                    return Ok("primary_adduser_immediate");
                }
                info!("Device not yet visible after addUser wait, continuing to poll");
            }
        } else {
            warn!("addUser failed for {target_name}, continuing; device may still appear");
        }

        // Phase 6: poll the directory until the deadline. A successful
        // addUser extends the deadline: freshly authenticated devices can
        // take noticeably longer to register.
        let mut poll_window = self.timings.total_poll_deadline();
        if auth_ok {
            let extension = self.timings.poll_deadline_extension();
            info!(
                "addUser succeeded, extending poll deadline from {poll_window:?} to {:?}",
                poll_window + extension
            );
            poll_window += extension;
        }
        let deadline = Instant::now() + poll_window;
        let fast_until = Instant::now() + self.timings.poll_fast_period();
        let mut cloud_device: Option<CloudDevice> = None;
        let mut attempt: u32 = 0;

        while Instant::now() < deadline {
            self.ensure_not_cancelled(cancel)?;
            attempt += 1;
            if attempt > 1 && attempt % 5 == 0 {
                if let Err(e) = self.tokens.refresh_if_needed(false).await {
                    debug!("Token refresh during polling failed (non-fatal): {e}");
                }
            }
            match self.directory.get_devices(true).await {
                Ok(devices) => {
                    if attempt == 1 {
                        debug!(
                            "Poll start: {} cloud devices visible, matching against {:?}",
                            devices.len(),
                            self.matching_names(target_name)
                        );
                        if devices.is_empty() {
                            warn!(
                                "Cloud API returned an empty device list; the account may have \
                                 no authenticated devices"
                            );
                        }
                    }
                    if let Some(device) = self.pick_device(&devices, target_name).cloned() {
                        info!(
                            "Found device {} matching {target_name} in cloud directory",
                            device.name
                        );
                        self.learn_cloud_name(target_name, &device.name);
                        cloud_device = Some(device);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Device poll failed: {e:#}");
                    metrics.add_error(format!("{e:#}"), Some("cloud_poll"));
                    self.sleep_cancellable(self.timings.poll_sleep_slow(), cancel)
                        .await?;
                    continue;
                }
            }
            let cadence = if Instant::now() < fast_until {
                self.timings.poll_sleep_fast()
            } else {
                self.timings.poll_sleep_slow()
            };
            self.sleep_cancellable(cadence, cancel).await?;
        }
        metrics.cloud_visible_ms = Some(elapsed_ms(run_start));

        let Some(device) = cloud_device else {
            warn!(
                "Device {target_name} did not appear within {poll_window:?} (tried names {:?})",
                self.matching_names(target_name)
            );
            return Err(PhaseError::Terminal(FailureReason::NotInDevicesByDeadline));
        };
        debug!("{target_name}: {}", DeviceState::CloudVisible);

        self.sleep_cancellable(self.timings.debounce_after_seen(), cancel)
            .await?;

        // Phases 7-9: stage, play, confirm
        self.stage_and_play(target_name, &device, target.volume_preset, metrics, cancel)
            .await?;
        Ok("primary")
    }

    /// Stage the device (transfer without autoplay, volume preset), start
    /// playback, and poll readiness until the confirmation window closes.
    async fn stage_and_play(
        &self,
        target_name: &str,
        device: &CloudDevice,
        volume: u8,
        metrics: &mut PhaseMetrics,
        cancel: &CancellationToken,
    ) -> Result<(), PhaseError> {
        self.ensure_not_cancelled(cancel)?;

        info!("Staging device {} ({})", device.name, device.id);
        self.directory.put_transfer(&device.id, false).await?;
        self.directory.put_volume(&device.id, volume).await?;
        debug!("{target_name}: {}", DeviceState::Staged);

        let play_start = Instant::now();
        let context = if self.context_uri.is_empty() {
            None
        } else {
            Some(self.context_uri.as_str())
        };
        self.directory
            .put_play(&device.id, context, self.shuffle)
            .await?;
        let play_ms = elapsed_ms(play_start);
        metrics.play_ms = Some(play_ms);
        if play_ms > 1000 {
            warn!("Play phase took {play_ms}ms (expected <1000ms), network may be slow");
        }

        let window = self.timings.failover_fire_after();
        info!("Playback started, confirming within {window:?}");
        let confirm_deadline = Instant::now() + window;
        let mut confirmed = false;
        while Instant::now() < confirm_deadline {
            match self.directory.verify_device_ready(&device.id).await {
                Ok(true) => {
                    info!("Playback confirmed for {target_name}");
                    confirmed = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!("Confirmation check failed: {e:#}"),
            }
            self.sleep_cancellable(self.timings.confirmation_sleep(), cancel)
                .await?;
        }
        if !confirmed {
            error!(
                "Playback not confirmed by T+{}s for {target_name}",
                window.as_secs_f64()
            );
            return Err(PhaseError::Terminal(FailureReason::PlayNotConfirmed));
        }
        debug!("{target_name}: {}", DeviceState::Playing);
        Ok(())
    }

    fn ensure_not_cancelled(&self, cancel: &CancellationToken) -> Result<(), PhaseError> {
        if cancel.is_cancelled() {
            Err(PhaseError::Terminal(FailureReason::Cancelled))
        } else {
            Ok(())
        }
    }

    async fn sleep_cancellable(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), PhaseError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PhaseError::Terminal(FailureReason::Cancelled)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Names that may refer to the target in the cloud directory.
    fn matching_names(&self, target_name: &str) -> Vec<String> {
        self.profile(target_name)
            .map(|profile| profile.get_all_matching_names())
            .unwrap_or_else(|| vec![target_name.to_string()])
    }

    fn pick_device<'a>(
        &self,
        devices: &'a [CloudDevice],
        target_name: &str,
    ) -> Option<&'a CloudDevice> {
        let names = self.matching_names(target_name);
        let picked = exact_match(devices, &names);
        if picked.is_none() && !devices.is_empty() {
            debug!(
                "No exact match for {target_name} (tried {:?}) among {:?}",
                names,
                devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
            );
        }
        picked
    }

    /// Record a cloud name onto the profile's alias set. Returns true when
    /// the name was newly learned.
    fn learn_cloud_name(&self, target_name: &str, cloud_name: &str) -> bool {
        let mut profiles = self.profiles.lock().expect("profile registry poisoned");
        let profile = profiles
            .entry(target_name.to_string())
            .or_insert_with(|| DeviceProfile::minimal(target_name));
        let learned = profile.learn_spotify_name(cloud_name);
        if learned {
            info!("Learned cloud device name '{cloud_name}' for device '{target_name}'");
        }
        learned
    }

    fn note_instance_name(&self, target_name: &str, instance: &str) {
        let mut profiles = self.profiles.lock().expect("profile registry poisoned");
        if let Some(profile) = profiles.get_mut(target_name) {
            if profile.instance_name.is_none() {
                profile.instance_name = Some(instance.to_string());
            }
        }
    }

    /// Registered profile for the target, or a minimal one created (and
    /// registered, so learned aliases survive) on first sight.
    fn profile_or_minimal(&self, target_name: &str) -> DeviceProfile {
        let mut profiles = self.profiles.lock().expect("profile registry poisoned");
        profiles
            .entry(target_name.to_string())
            .or_insert_with(|| {
                info!("Device {target_name} not in registry, creating minimal profile");
                DeviceProfile::minimal(target_name)
            })
            .clone()
    }
}
