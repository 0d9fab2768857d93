//! The transport contract every device backend implements.
//!
//! A backend owns a [`ProviderCore`] holding the lifecycle bookkeeping shared
//! by all transports: connection status with de-duplication, connect
//! callbacks, search callback and auto-reconnect, the dynamic device info
//! monitor, single-flight config and intent requests, and the per-tick frame
//! batches. Backends only supply their I/O.
//!
//! Everything a backend wants to tell the outside world is queued as a
//! [`ProviderEvent`] and drained by the session once per tick, in order.

use crate::context::WearableContext;
use crate::device_config::DeviceConfig;
use crate::intent::AppIntentProfile;
use crate::types::{
    ConfigStatus, ConnectionStatus, Device, DeviceStatus, DynamicDeviceInfo,
    FirmwareUpdateAlertOption, FirmwareUpdateInformation, GestureData, GestureId, ProviderId,
    SensorFrame, SensorServiceSuspendedReason,
};
use std::time::Instant;

pub type SearchCallback = Box<dyn FnMut(&[Device]) + Send>;
pub type ConfigCallback = Box<dyn FnOnce(&DeviceConfig) + Send>;
pub type IntentCallback = Box<dyn FnOnce(bool) + Send>;

/// Something a backend reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    ConnectionStatusChanged {
        status: ConnectionStatus,
        device: Option<Device>,
    },
    SensorsUpdated(SensorFrame),
    GestureDetected(GestureId),
    ConfigurationSucceeded,
    ConfigurationFailed {
        sensor: ConfigStatus,
        gesture: ConfigStatus,
    },
    SensorServiceSuspended(SensorServiceSuspendedReason),
    SensorServiceResumed,
    ProxyConnected,
    ProxyDisconnected,
}

/// One-shot outcome callbacks for a connection attempt.
///
/// Exactly one of them runs when the attempt ends in success or failure.
/// Cancellation drops both unrun.
#[derive(Default)]
pub struct ConnectCallbacks {
    on_success: Option<Box<dyn FnOnce() + Send>>,
    on_failure: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn succeed(self) {
        if let Some(f) = self.on_success {
            f();
        }
    }

    pub fn fail(self) {
        if let Some(f) = self.on_failure {
            f();
        }
    }
}

impl std::fmt::Debug for ConnectCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Bookkeeping shared by every transport.
pub struct ProviderCore {
    ctx: WearableContext,
    status: ConnectionStatus,
    connected_device: Option<Device>,
    events: Vec<ProviderEvent>,

    initialized: bool,
    enabled: bool,

    search_callback: Option<SearchCallback>,
    auto_reconnect_deadline: Option<Instant>,

    connect_callbacks: Option<ConnectCallbacks>,
    failure_reason: Option<String>,

    last_device_status: DeviceStatus,

    config_waiters: Vec<ConfigCallback>,
    intent_waiter: Option<IntentCallback>,

    current_frames: Vec<SensorFrame>,
    current_gestures: Vec<GestureData>,
    last_frame: Option<SensorFrame>,
}

impl ProviderCore {
    pub fn new(ctx: WearableContext) -> Self {
        ProviderCore {
            ctx,
            status: ConnectionStatus::Disconnected,
            connected_device: None,
            events: Vec::new(),
            initialized: false,
            enabled: false,
            search_callback: None,
            auto_reconnect_deadline: None,
            connect_callbacks: None,
            failure_reason: None,
            last_device_status: DeviceStatus::empty(),
            config_waiters: Vec::new(),
            intent_waiter: None,
            current_frames: Vec::new(),
            current_gestures: Vec::new(),
            last_frame: None,
        }
    }

    pub fn ctx(&self) -> &WearableContext {
        &self.ctx
    }

    pub fn now(&self) -> Instant {
        self.ctx.now()
    }

    /// Change the RSSI filter used by subsequent searches. The value is clamped.
    pub fn set_rssi_threshold(&mut self, threshold: i32) {
        self.ctx.settings.rssi_threshold = crate::settings::clamp_rssi(threshold);
    }

    // -- Lifecycle --

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn initialize(&mut self) {
        self.initialized = true;
        self.enabled = false;
        self.reset_requests();
        self.last_device_status = DeviceStatus::empty();
        self.status = ConnectionStatus::Disconnected;
    }

    pub(crate) fn destroy(&mut self) {
        self.initialized = false;
        self.enabled = false;
        self.reset_requests();
        self.last_device_status = DeviceStatus::empty();
        self.status = ConnectionStatus::Disconnected;
    }

    /// Mark enabled and re-announce an existing connection.
    pub(crate) fn enable(&mut self) {
        self.enabled = true;
        if let Some(device) = self.connected_device.clone() {
            self.report_status(ConnectionStatus::Connected, Some(&device));
        }
    }

    /// Mark disabled. A live connection is reported as Disconnected.
    pub(crate) fn disable(&mut self) {
        self.enabled = false;
        if let Some(device) = self.connected_device.clone() {
            self.report_status(ConnectionStatus::Disconnected, Some(&device));
        }
    }

    fn reset_requests(&mut self) {
        self.config_waiters.clear();
        self.intent_waiter = None;
    }

    // -- Status --

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Record a status change and queue an event for it.
    ///
    /// Re-reporting the current status is silent. Connected always stores the
    /// device uid for auto-reconnect, and Disconnected drops any outstanding
    /// config or intent requests.
    pub fn report_status(&mut self, status: ConnectionStatus, device: Option<&Device>) {
        match status {
            ConnectionStatus::Disconnected => self.reset_requests(),
            ConnectionStatus::Connected => {
                if let Some(device) = device {
                    self.ctx.memory.remember_connected_uid(&device.uid);
                }
            }
            _ => {}
        }

        if self.status == status {
            return;
        }
        log::debug!("Connection status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.events.push(ProviderEvent::ConnectionStatusChanged {
            status,
            device: device.cloned(),
        });
    }

    pub fn connected_device(&self) -> Option<&Device> {
        self.connected_device.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected_device.is_some()
    }

    pub(crate) fn set_connected_device(&mut self, device: Option<Device>) {
        if device.is_none() {
            self.last_device_status = DeviceStatus::empty();
        }
        self.connected_device = device.map(|mut d| {
            d.is_connected = true;
            d
        });
    }

    pub(crate) fn take_connected_device(&mut self) -> Option<Device> {
        self.last_device_status = DeviceStatus::empty();
        self.connected_device.take()
    }

    // -- Connection attempts --

    pub(crate) fn begin_connection(&mut self, callbacks: ConnectCallbacks) {
        self.failure_reason = None;
        self.connect_callbacks = Some(callbacks);
    }

    pub fn has_pending_connection(&self) -> bool {
        self.connect_callbacks.is_some()
    }

    /// Mark `device` connected, run the success callback, then report Connected.
    pub(crate) fn complete_connection(&mut self, device: Device) {
        self.set_connected_device(Some(device.clone()));
        if let Some(callbacks) = self.connect_callbacks.take() {
            callbacks.succeed();
        }
        self.report_status(ConnectionStatus::Connected, Some(&device));
    }

    /// Run the failure callback, then report Failed.
    pub(crate) fn fail_connection(&mut self, device: Option<&Device>, reason: Option<String>) {
        match &reason {
            Some(reason) => log::warn!("Failed to connect to device: {}", reason),
            None => log::warn!("Failed to connect to device"),
        }
        self.failure_reason = reason;
        if let Some(callbacks) = self.connect_callbacks.take() {
            callbacks.fail();
        }
        self.report_status(ConnectionStatus::Failed, device);
    }

    /// Drop the callbacks unrun and report Cancelled.
    pub(crate) fn cancel_connection(&mut self, device: Option<&Device>) {
        self.connect_callbacks = None;
        self.report_status(ConnectionStatus::Cancelled, device);
    }

    /// Forget the callbacks of an attempt that will never finish.
    pub(crate) fn abandon_connection(&mut self) {
        self.connect_callbacks = None;
    }

    /// Diagnostic attached to the most recent failure, if the transport gave one.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    // -- Search and auto-reconnect --

    /// Install the search callback and report Searching or AutoReconnect.
    pub(crate) fn begin_search(&mut self, callback: SearchCallback, auto_reconnect: bool) {
        self.search_callback = Some(callback);
        if auto_reconnect {
            self.auto_reconnect_deadline = Some(self.now() + self.ctx.settings.auto_reconnect_timeout);
            self.report_status(ConnectionStatus::AutoReconnect, None);
        } else {
            self.auto_reconnect_deadline = None;
            self.report_status(ConnectionStatus::Searching, None);
        }
    }

    /// Drop the search callback. Returns whether a search was active.
    pub(crate) fn end_search(&mut self) -> bool {
        self.auto_reconnect_deadline = None;
        self.search_callback.take().is_some()
    }

    pub fn is_searching(&self) -> bool {
        self.search_callback.is_some()
    }

    /// Route a batch of discovered devices.
    ///
    /// While auto-reconnecting, the batch is matched against the remembered
    /// uid and the match, if any, is returned for the caller to connect to.
    /// Otherwise the batch goes to the search callback.
    pub(crate) fn route_search_results(&mut self, devices: &[Device]) -> Option<Device> {
        if self.status == ConnectionStatus::AutoReconnect {
            let uid = self.ctx.memory.last_connected_uid()?;
            return devices.iter().find(|d| d.uid == uid).cloned();
        }
        if let Some(callback) = self.search_callback.as_mut() {
            callback(devices);
        }
        None
    }

    /// Downgrade AutoReconnect to Searching once there is nothing to wait for.
    pub(crate) fn poll_auto_reconnect(&mut self) {
        if self.status != ConnectionStatus::AutoReconnect {
            return;
        }
        let expired = self.auto_reconnect_deadline.map_or(true, |d| self.now() > d);
        if expired || self.ctx.memory.last_connected_uid().is_none() {
            log::info!("Auto-reconnect gave up, falling back to manual search");
            self.auto_reconnect_deadline = None;
            self.report_status(ConnectionStatus::Searching, None);
        }
    }

    // -- Dynamic device info --

    /// Fold a dynamic info reading into the connected device and emit
    /// suspend/resume events on the service flag's edges.
    pub(crate) fn observe_dynamic_info(&mut self, info: DynamicDeviceInfo) {
        if let Some(device) = self.connected_device.as_mut() {
            device.apply_dynamic_info(&info);
        }
        let status = info.device_status;
        let rising = status.rising_edges(self.last_device_status);
        let falling = status.falling_edges(self.last_device_status);
        self.last_device_status = status;

        if rising.service_suspended() {
            let reason = status.suspended_reason();
            log::info!("Sensor service suspended: {:?}", reason);
            self.events.push(ProviderEvent::SensorServiceSuspended(reason));
        }
        if falling.service_suspended() {
            log::info!("Sensor service resumed");
            self.events.push(ProviderEvent::SensorServiceResumed);
        }
    }

    // -- Config and intent requests --

    /// Queue a config waiter. Returns true when a transport request must go out.
    pub(crate) fn queue_config_request(&mut self, callback: ConfigCallback) -> bool {
        if !self.is_connected() {
            log::warn!("Device configuration requested while no device is connected");
            self.config_waiters.clear();
            return false;
        }
        self.config_waiters.push(callback);
        self.config_waiters.len() == 1
    }

    pub fn is_waiting_for_config(&self) -> bool {
        !self.config_waiters.is_empty()
    }

    /// Hand a received config to every waiter.
    pub(crate) fn complete_config_request(&mut self, config: &DeviceConfig) {
        if !self.enabled {
            return;
        }
        for waiter in self.config_waiters.drain(..) {
            waiter(config);
        }
    }

    /// Claim the single intent-validation slot. Returns false if already taken.
    pub(crate) fn claim_intent_request(&mut self, callback: IntentCallback) -> bool {
        if !self.is_connected() {
            log::warn!("Intent validation requested while no device is connected");
            self.intent_waiter = None;
            return false;
        }
        if self.intent_waiter.is_some() {
            log::error!("An intent validation request is already outstanding; ignoring this one");
            return false;
        }
        self.intent_waiter = Some(callback);
        true
    }

    pub fn is_waiting_for_intent_validation(&self) -> bool {
        self.intent_waiter.is_some()
    }

    pub(crate) fn complete_intent_request(&mut self, valid: bool) {
        if !self.enabled {
            return;
        }
        if let Some(waiter) = self.intent_waiter.take() {
            waiter(valid);
        }
    }

    // -- Config write results --

    pub(crate) fn report_config_success(&mut self) {
        self.events.push(ProviderEvent::ConfigurationSucceeded);
    }

    pub(crate) fn report_config_failure(&mut self, sensor: ConfigStatus, gesture: ConfigStatus) {
        log::warn!(
            "Device configuration failed (sensors: {:?}, gestures: {:?})",
            sensor,
            gesture
        );
        self.events.push(ProviderEvent::ConfigurationFailed { sensor, gesture });
    }

    // -- Frames --

    /// Start a new tick's batch. The last frame is retained.
    pub(crate) fn clear_batches(&mut self) {
        self.current_frames.clear();
        self.current_gestures.clear();
    }

    pub(crate) fn push_frame(&mut self, frame: SensorFrame) {
        self.current_frames.push(frame);
        self.last_frame = Some(frame);
        self.events.push(ProviderEvent::SensorsUpdated(frame));
    }

    pub(crate) fn push_gesture(&mut self, gesture: GestureData) {
        self.current_gestures.push(gesture);
        self.events.push(ProviderEvent::GestureDetected(gesture.gesture_id));
    }

    pub fn current_frames(&self) -> &[SensorFrame] {
        &self.current_frames
    }

    pub fn current_gestures(&self) -> &[GestureData] {
        &self.current_gestures
    }

    pub fn last_frame(&self) -> Option<SensorFrame> {
        self.last_frame
    }

    pub(crate) fn push_event(&mut self, event: ProviderEvent) {
        self.events.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<ProviderEvent> {
        std::mem::take(&mut self.events)
    }
}

/// A device transport.
///
/// Implementors provide the required methods. The provided methods implement
/// the shared semantics on top of [`ProviderCore`] and should not normally be
/// overridden.
pub trait WearableProvider: Send {
    fn id(&self) -> ProviderId;

    fn core(&self) -> &ProviderCore;

    fn core_mut(&mut self) -> &mut ProviderCore;

    /// Start reporting discovered devices to `callback`.
    ///
    /// With `auto_reconnect`, devices matching the last connected uid are
    /// connected to directly until the auto-reconnect timeout elapses.
    fn search_for_devices(
        &mut self,
        intent: Option<&AppIntentProfile>,
        callback: SearchCallback,
        auto_reconnect: bool,
    );

    fn stop_searching_for_devices(&mut self);

    fn connect_to_device(&mut self, device: Device, callbacks: ConnectCallbacks);

    /// Abort an attempt in progress. Ignored unless the status is a connecting one.
    fn cancel_device_connection(&mut self);

    fn disconnect_from_device(&mut self);

    fn firmware_update_information(&self) -> FirmwareUpdateInformation {
        FirmwareUpdateInformation::default()
    }

    fn select_firmware_update_option(&mut self, _option: &FirmwareUpdateAlertOption) {}

    /// Send a configuration to the device. Results arrive as events.
    fn set_device_configuration(&mut self, config: &DeviceConfig);

    /// The last configuration known to be active, or the disabled config when not connected.
    fn cached_device_configuration(&self) -> DeviceConfig;

    fn dynamic_device_info(&mut self) -> DynamicDeviceInfo;

    fn set_app_focus_changed(&mut self, _has_focus: bool) {}

    /// Ask the transport for the device's current configuration.
    /// Must eventually call [`ProviderCore::complete_config_request`].
    fn begin_config_request(&mut self);

    /// Ask the transport to validate `profile`.
    /// Must eventually call [`ProviderCore::complete_intent_request`].
    fn begin_intent_validation(&mut self, profile: &AppIntentProfile);

    /// Advance timers and poll the transport. Called once per tick.
    fn update(&mut self);

    fn on_initialize(&mut self) {
        self.core_mut().initialize();
    }

    fn on_destroy(&mut self) {
        self.core_mut().destroy();
    }

    fn on_enable(&mut self) {
        self.core_mut().enable();
    }

    fn on_disable(&mut self) {
        self.stop_searching_for_devices();
        self.core_mut().disable();
    }

    // -- Provided --

    /// Coalesces concurrent callers into one transport request.
    fn request_device_configuration(&mut self, callback: ConfigCallback) {
        if self.core_mut().queue_config_request(callback) {
            self.begin_config_request();
        }
    }

    /// Single-flight: a second request while one is outstanding is rejected.
    fn request_intent_profile_validation(
        &mut self,
        profile: &mut AppIntentProfile,
        callback: IntentCallback,
    ) {
        if self.core_mut().claim_intent_request(callback) {
            self.begin_intent_validation(profile);
            profile.mark_clean();
        }
    }

    /// Feed a batch of discovered devices through search routing.
    fn deliver_search_results(&mut self, devices: &[Device]) {
        if let Some(device) = self.core_mut().route_search_results(devices) {
            log::info!("Auto-reconnecting to {}", device);
            self.connect_to_device(device, ConnectCallbacks::default());
        }
    }

    /// Shared end-of-update work: auto-reconnect timeout and the dynamic info monitor.
    fn finish_update(&mut self) {
        self.core_mut().poll_auto_reconnect();
        if self.core().is_connected() {
            let info = self.dynamic_device_info();
            self.core_mut().observe_dynamic_info(info);
        }
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.core().status()
    }

    fn connected_device(&self) -> Option<&Device> {
        self.core().connected_device()
    }

    fn last_sensor_frame(&self) -> Option<SensorFrame> {
        self.core().last_frame()
    }

    fn current_sensor_frames(&self) -> &[SensorFrame] {
        self.core().current_frames()
    }

    fn current_gesture_data(&self) -> &[GestureData] {
        self.core().current_gestures()
    }

    fn drain_events(&mut self) -> Vec<ProviderEvent> {
        self.core_mut().drain_events()
    }
}
