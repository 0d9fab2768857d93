//! Hardware transports: the native BLE bridge and the USB bridge.
//!
//! Both drive a [`PlatformBridge`], the thin I/O surface a platform binding
//! provides. The bridge is polled on timers; nothing here blocks.

use crate::context::WearableContext;
use crate::device_config::DeviceConfig;
use crate::intent::AppIntentProfile;
use crate::provider::{ConnectCallbacks, ProviderCore, SearchCallback, WearableProvider};
use crate::settings::{clamp_rssi, read_env_bool};
use crate::types::{
    ConfigStatus, ConnectionStatus, Device, DynamicDeviceInfo, FirmwareUpdateAlertOption,
    FirmwareUpdateInformation, GestureData, ProviderId, SensorFrame,
};
use std::time::{Duration, Instant};

/// State of the bridge's session with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Opening,
    Open,
}

/// Raw device access supplied by a platform binding.
///
/// Every method has an inert default so a binding only implements what its
/// platform offers. Status queries return an optional diagnostic message.
pub trait PlatformBridge: Send {
    fn initialize(&mut self, _simulated: bool) {}

    fn start_search(&mut self, _intent: Option<&AppIntentProfile>, _rssi_threshold: i32) {}

    fn stop_search(&mut self) {}

    fn discovered_devices(&mut self) -> Vec<Device> {
        Vec::new()
    }

    fn open_session(&mut self, _uid: &str) {}

    fn close_session(&mut self) {}

    fn cancel_connection(&mut self) {}

    fn session_status(&mut self) -> (SessionStatus, Option<String>) {
        (SessionStatus::Closed, None)
    }

    /// Progress of the connection opened by [`open_session`](Self::open_session).
    fn connection_status(&mut self) -> (ConnectionStatus, Option<String>) {
        (ConnectionStatus::Failed, Some("no platform bridge is available".into()))
    }

    /// Fill in the fields only known once a session is open.
    fn device_info(&mut self, _device: &mut Device) {}

    /// Frames received since the last call.
    fn latest_sensor_frames(&mut self) -> Vec<SensorFrame> {
        Vec::new()
    }

    /// Gestures received since the last call.
    fn latest_gestures(&mut self) -> Vec<GestureData> {
        Vec::new()
    }

    fn device_configuration(&mut self) -> DeviceConfig {
        DeviceConfig::disabled()
    }

    fn set_device_configuration(&mut self, _config: &DeviceConfig) {}

    /// Sensor and gesture progress of the last configuration write.
    fn config_status(&mut self) -> (ConfigStatus, ConfigStatus) {
        (ConfigStatus::Idle, ConfigStatus::Idle)
    }

    fn dynamic_device_info(&mut self) -> DynamicDeviceInfo {
        DynamicDeviceInfo::UNKNOWN
    }

    fn validate_intent_profile(&mut self, _profile: &AppIntentProfile) -> bool {
        false
    }

    fn firmware_update_information(&self) -> FirmwareUpdateInformation {
        FirmwareUpdateInformation::default()
    }

    fn select_firmware_update_option(&mut self, _option: &FirmwareUpdateAlertOption) {}

    fn set_app_focus_changed(&mut self, _has_focus: bool) {}
}

/// Bridge for platforms without device access. Searches find nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedPlatform;

impl PlatformBridge for UnsupportedPlatform {
    fn start_search(&mut self, _intent: Option<&AppIntentProfile>, _rssi_threshold: i32) {
        log::error!("Device search is not supported on this platform");
    }
}

/// Which bridge flavour a [`DeviceProvider`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// Mobile BLE bridge: polls `connection_status` while connecting.
    Native,
    /// Desktop USB dongle: polls `session_status` while connecting.
    Usb,
}

pub struct DeviceProvider {
    core: ProviderCore,
    kind: BridgeKind,
    bridge: Box<dyn PlatformBridge>,
    simulate_hardware: bool,
    config: DeviceConfig,

    next_search_time: Option<Instant>,

    connecting: Option<Device>,
    next_connect_time: Option<Instant>,

    next_monitor_time: Option<Instant>,

    poll_config_status: bool,
    config_success_pending: bool,

    dynamic_info: DynamicDeviceInfo,
    next_dynamic_info_time: Option<Instant>,
}

impl DeviceProvider {
    pub fn new(ctx: WearableContext, kind: BridgeKind, bridge: Box<dyn PlatformBridge>) -> Self {
        DeviceProvider {
            core: ProviderCore::new(ctx),
            kind,
            bridge,
            simulate_hardware: read_env_bool("WEARABLE_SIMULATE_HARDWARE", false),
            config: DeviceConfig::disabled(),
            next_search_time: None,
            connecting: None,
            next_connect_time: None,
            next_monitor_time: None,
            poll_config_status: false,
            config_success_pending: false,
            dynamic_info: DynamicDeviceInfo::UNKNOWN,
            next_dynamic_info_time: None,
        }
    }

    pub fn native(ctx: WearableContext, bridge: Box<dyn PlatformBridge>) -> Self {
        Self::new(ctx, BridgeKind::Native, bridge)
    }

    pub fn usb(ctx: WearableContext, bridge: Box<dyn PlatformBridge>) -> Self {
        Self::new(ctx, BridgeKind::Usb, bridge)
    }

    pub fn kind(&self) -> BridgeKind {
        self.kind
    }

    /// Ask the bridge for simulated hardware. Takes effect at initialization.
    pub fn set_simulate_hardware(&mut self, simulate: bool) {
        self.simulate_hardware = simulate;
    }

    fn search_interval(&self) -> Duration {
        let settings = &self.core.ctx().settings;
        match self.kind {
            BridgeKind::Native => settings.search_poll_interval,
            BridgeKind::Usb => settings.usb_connect_poll_interval,
        }
    }

    fn connect_interval(&self) -> Duration {
        let settings = &self.core.ctx().settings;
        match self.kind {
            BridgeKind::Native => settings.connect_poll_interval,
            BridgeKind::Usb => settings.usb_connect_poll_interval,
        }
    }

    fn stop_connection(&mut self) {
        self.connecting = None;
        self.next_connect_time = None;
        self.core.abandon_connection();
    }

    fn start_monitor(&mut self) {
        self.next_monitor_time = Some(self.core.now() + self.connect_interval());
    }

    fn stop_monitor(&mut self) {
        self.next_monitor_time = None;
    }

    fn disable_cached_config(&mut self) {
        self.config.disable_all_sensors();
        self.config.disable_all_gestures();
    }

    fn finish_connection(&mut self, mut device: Device) {
        log::info!("Session opened with {}", device);
        device.product_id = device.product_id.normalized();
        self.connecting = None;
        self.next_connect_time = None;
        self.core.complete_connection(device);
        self.start_monitor();
    }

    fn poll_connection(&mut self) {
        let Some(mut device) = self.connecting.clone() else {
            return;
        };
        match self.kind {
            BridgeKind::Native => {
                let (status, message) = self.bridge.connection_status();
                match status {
                    ConnectionStatus::Failed => {
                        self.core.fail_connection(Some(&device), message);
                        self.stop_connection();
                    }
                    ConnectionStatus::SecurePairingRequired
                    | ConnectionStatus::FirmwareUpdateAvailable
                    | ConnectionStatus::FirmwareUpdateRequired => {
                        self.core.report_status(status, Some(&device));
                    }
                    ConnectionStatus::Connected => {
                        self.bridge.device_info(&mut device);
                        self.finish_connection(device);
                    }
                    other => log::trace!("Connection still in progress ({:?})", other),
                }
            }
            BridgeKind::Usb => {
                let (session, message) = self.bridge.session_status();
                match session {
                    SessionStatus::Closed => {
                        if self.core.status() != ConnectionStatus::Searching {
                            self.core.fail_connection(Some(&device), message);
                            self.stop_connection();
                        }
                    }
                    SessionStatus::Opening => {
                        self.core.report_status(ConnectionStatus::Connecting, Some(&device));
                    }
                    SessionStatus::Open => {
                        self.bridge.device_info(&mut device);
                        self.next_dynamic_info_time = None;
                        let info = self.dynamic_device_info();
                        device.apply_dynamic_info(&info);
                        self.finish_connection(device);
                    }
                }
            }
        }
    }

    fn monitor_session(&mut self) {
        let (session, message) = self.bridge.session_status();
        if session == SessionStatus::Open {
            return;
        }
        match message {
            Some(message) => log::info!("Device session ended: {}", message),
            None => log::info!("Device session ended"),
        }
        if let Some(device) = self.core.take_connected_device() {
            self.core.report_status(ConnectionStatus::Disconnected, Some(&device));
        }
        self.disable_cached_config();
        self.stop_monitor();
    }

    fn pull_latest(&mut self) {
        for frame in self.bridge.latest_sensor_frames() {
            self.core.push_frame(frame);
        }
        for gesture in self.bridge.latest_gestures() {
            self.core.push_gesture(gesture);
        }

        match self.kind {
            BridgeKind::Native => {
                if self.poll_config_status {
                    let (sensor, gesture) = self.bridge.config_status();
                    if sensor.is_settled() && gesture.is_settled() {
                        self.poll_config_status = false;
                    }
                    if sensor == ConfigStatus::Failure || gesture == ConfigStatus::Failure {
                        self.core.report_config_failure(sensor, gesture);
                    } else if sensor == ConfigStatus::Success && gesture == ConfigStatus::Success {
                        self.core.report_config_success();
                    }
                }
                self.config = self.bridge.device_configuration();
            }
            BridgeKind::Usb => {
                if self.config_success_pending {
                    self.config_success_pending = false;
                    self.core.report_config_success();
                }
            }
        }
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|t| now >= t)
}

impl WearableProvider for DeviceProvider {
    fn id(&self) -> ProviderId {
        match self.kind {
            BridgeKind::Native => ProviderId::WearableDevice,
            BridgeKind::Usb => ProviderId::Usb,
        }
    }

    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProviderCore {
        &mut self.core
    }

    fn search_for_devices(
        &mut self,
        intent: Option<&AppIntentProfile>,
        callback: SearchCallback,
        auto_reconnect: bool,
    ) {
        self.stop_searching_for_devices();
        let threshold = clamp_rssi(self.core.ctx().settings.rssi_threshold);
        self.bridge.start_search(intent, threshold);
        self.core.begin_search(callback, auto_reconnect);
        self.next_search_time = Some(self.core.now() + self.search_interval());
    }

    fn stop_searching_for_devices(&mut self) {
        self.core.end_search();
        if self.next_search_time.take().is_none() {
            return;
        }
        self.bridge.stop_search();
        if self.kind == BridgeKind::Usb
            && !self.core.is_connected()
            && self.core.status() == ConnectionStatus::Searching
        {
            self.core.report_status(ConnectionStatus::Disconnected, None);
        }
    }

    fn connect_to_device(&mut self, device: Device, callbacks: ConnectCallbacks) {
        self.stop_searching_for_devices();
        self.disconnect_from_device();

        self.core.begin_connection(callbacks);
        self.next_connect_time = Some(self.core.now() + self.connect_interval());
        self.poll_config_status = false;
        self.config_success_pending = false;
        self.bridge.open_session(&device.uid);
        self.core.report_status(ConnectionStatus::Connecting, Some(&device));
        self.connecting = Some(device);
    }

    fn cancel_device_connection(&mut self) {
        if self.core.is_searching() || !self.core.status().is_connecting() {
            return;
        }
        match self.kind {
            BridgeKind::Native => self.bridge.cancel_connection(),
            BridgeKind::Usb => self.bridge.close_session(),
        }
        let device = self.connecting.take();
        self.next_connect_time = None;
        self.core.cancel_connection(device.as_ref());
    }

    fn disconnect_from_device(&mut self) {
        self.stop_connection();
        self.stop_monitor();
        self.disable_cached_config();

        let Some(device) = self.core.take_connected_device() else {
            return;
        };
        self.core.report_status(ConnectionStatus::Disconnected, Some(&device));
        self.bridge.close_session();
    }

    fn firmware_update_information(&self) -> FirmwareUpdateInformation {
        match self.kind {
            BridgeKind::Native => self.bridge.firmware_update_information(),
            BridgeKind::Usb => FirmwareUpdateInformation::default(),
        }
    }

    fn select_firmware_update_option(&mut self, option: &FirmwareUpdateAlertOption) {
        self.bridge.select_firmware_update_option(option);
    }

    fn set_device_configuration(&mut self, config: &DeviceConfig) {
        self.bridge.set_device_configuration(config);
        match self.kind {
            BridgeKind::Native => self.poll_config_status = true,
            BridgeKind::Usb => {
                self.config = config.clone();
                self.config_success_pending = true;
            }
        }
    }

    fn cached_device_configuration(&self) -> DeviceConfig {
        if self.core.is_connected() {
            self.config.clone()
        } else {
            DeviceConfig::disabled()
        }
    }

    fn dynamic_device_info(&mut self) -> DynamicDeviceInfo {
        match self.kind {
            BridgeKind::Native => self.bridge.dynamic_device_info(),
            BridgeKind::Usb => {
                let now = self.core.now();
                if self.next_dynamic_info_time.map_or(true, |t| now >= t) {
                    self.next_dynamic_info_time =
                        Some(now + self.core.ctx().settings.usb_dynamic_info_interval);
                    self.dynamic_info = self.bridge.dynamic_device_info();
                }
                self.dynamic_info
            }
        }
    }

    fn set_app_focus_changed(&mut self, has_focus: bool) {
        self.bridge.set_app_focus_changed(has_focus);
    }

    fn begin_config_request(&mut self) {
        let config = self.bridge.device_configuration();
        self.core.complete_config_request(&config);
    }

    fn begin_intent_validation(&mut self, profile: &AppIntentProfile) {
        let valid = self.bridge.validate_intent_profile(profile);
        self.core.complete_intent_request(valid);
    }

    fn on_initialize(&mut self) {
        if self.core.is_initialized() {
            return;
        }
        self.bridge.initialize(self.simulate_hardware);
        self.core.initialize();
        self.stop_connection();
        self.stop_monitor();
        self.stop_searching_for_devices();
    }

    fn on_destroy(&mut self) {
        self.core.destroy();
        self.disconnect_from_device();
        self.stop_searching_for_devices();
    }

    fn on_enable(&mut self) {
        if self.core.is_enabled() {
            return;
        }
        self.core.enable();
        if self.core.is_connected() {
            self.start_monitor();
        }
    }

    fn on_disable(&mut self) {
        if !self.core.is_enabled() {
            return;
        }
        self.stop_searching_for_devices();
        self.core.disable();
        self.stop_monitor();
        self.stop_connection();
    }

    fn update(&mut self) {
        let now = self.core.now();

        if due(self.next_search_time, now) {
            self.next_search_time = self.next_search_time.map(|t| t + self.search_interval());
            let devices = self.bridge.discovered_devices();
            self.deliver_search_results(&devices);
        }

        if due(self.next_connect_time, now) {
            self.next_connect_time = self.next_connect_time.map(|t| t + self.connect_interval());
            self.poll_connection();
        }

        if due(self.next_monitor_time, now) {
            self.next_monitor_time = self.next_monitor_time.map(|t| t + self.connect_interval());
            self.monitor_session();
        }

        self.core.clear_batches();
        if self.core.is_connected() {
            self.pull_latest();
        }

        self.finish_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::provider::ProviderEvent;
    use crate::types::{GestureId, ProductId, SensorFlags, SensorId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        discovered: Vec<Device>,
        connection: Option<(ConnectionStatus, Option<String>)>,
        session: Option<SessionStatus>,
        product_id: ProductId,
        frames: Vec<SensorFrame>,
        gestures: Vec<GestureData>,
        config: Option<DeviceConfig>,
        config_status: (ConfigStatus, ConfigStatus),
        dynamic_reads: usize,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct ScriptedBridge(Arc<Mutex<Script>>);

    impl ScriptedBridge {
        fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            f(&mut self.0.lock().unwrap())
        }
    }

    impl PlatformBridge for ScriptedBridge {
        fn start_search(&mut self, _intent: Option<&AppIntentProfile>, rssi_threshold: i32) {
            self.with(|s| s.calls.push(format!("start_search {}", rssi_threshold)));
        }

        fn stop_search(&mut self) {
            self.with(|s| s.calls.push("stop_search".into()));
        }

        fn discovered_devices(&mut self) -> Vec<Device> {
            self.with(|s| s.discovered.clone())
        }

        fn open_session(&mut self, uid: &str) {
            self.with(|s| s.calls.push(format!("open_session {}", uid)));
        }

        fn close_session(&mut self) {
            self.with(|s| s.calls.push("close_session".into()));
        }

        fn cancel_connection(&mut self) {
            self.with(|s| s.calls.push("cancel_connection".into()));
        }

        fn session_status(&mut self) -> (SessionStatus, Option<String>) {
            self.with(|s| (s.session.unwrap_or(SessionStatus::Closed), None))
        }

        fn connection_status(&mut self) -> (ConnectionStatus, Option<String>) {
            self.with(|s| s.connection.clone().unwrap_or((ConnectionStatus::Connecting, None)))
        }

        fn device_info(&mut self, device: &mut Device) {
            self.with(|s| {
                device.product_id = s.product_id;
                device.available_sensors = SensorFlags::ACCELEROMETER | SensorFlags::GYROSCOPE;
            });
        }

        fn latest_sensor_frames(&mut self) -> Vec<SensorFrame> {
            self.with(|s| std::mem::take(&mut s.frames))
        }

        fn latest_gestures(&mut self) -> Vec<GestureData> {
            self.with(|s| std::mem::take(&mut s.gestures))
        }

        fn device_configuration(&mut self) -> DeviceConfig {
            self.with(|s| s.config.clone().unwrap_or_else(DeviceConfig::disabled))
        }

        fn set_device_configuration(&mut self, config: &DeviceConfig) {
            self.with(|s| s.config = Some(config.clone()));
        }

        fn config_status(&mut self) -> (ConfigStatus, ConfigStatus) {
            self.with(|s| s.config_status)
        }

        fn dynamic_device_info(&mut self) -> DynamicDeviceInfo {
            self.with(|s| {
                s.dynamic_reads += 1;
                DynamicDeviceInfo { transmission_period: 20, ..DynamicDeviceInfo::UNKNOWN }
            })
        }

        fn validate_intent_profile(&mut self, profile: &AppIntentProfile) -> bool {
            !profile.contains_sensor(SensorId::RotationNineDof)
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        bridge: ScriptedBridge,
        provider: DeviceProvider,
        successes: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
        statuses: Vec<ConnectionStatus>,
        events: Vec<ProviderEvent>,
    }

    impl Harness {
        fn new(kind: BridgeKind) -> Self {
            let clock = Arc::new(ManualClock::new());
            let bridge = ScriptedBridge::default();
            let mut provider =
                DeviceProvider::new(WearableContext::manual(clock.clone()), kind, Box::new(bridge.clone()));
            provider.on_initialize();
            provider.on_enable();
            Harness {
                clock,
                bridge,
                provider,
                successes: Arc::new(AtomicUsize::new(0)),
                failures: Arc::new(AtomicUsize::new(0)),
                statuses: Vec::new(),
                events: Vec::new(),
            }
        }

        fn connect(&mut self, uid: &str) {
            let (s, f) = (self.successes.clone(), self.failures.clone());
            let callbacks = ConnectCallbacks::new()
                .on_success(move || {
                    s.fetch_add(1, Ordering::SeqCst);
                })
                .on_failure(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                });
            let device = Device { uid: uid.into(), name: "Frames".into(), ..Default::default() };
            self.provider.connect_to_device(device, callbacks);
            self.collect();
        }

        fn collect(&mut self) {
            for event in self.provider.drain_events() {
                if let ProviderEvent::ConnectionStatusChanged { status, .. } = event {
                    self.statuses.push(status);
                }
                self.events.push(event);
            }
        }

        fn tick(&mut self, by: Duration) {
            self.clock.advance(by);
            self.provider.update();
            self.collect();
        }

        fn connected(kind: BridgeKind) -> Self {
            let mut h = Harness::new(kind);
            match kind {
                BridgeKind::Native => {
                    h.bridge.with(|s| s.connection = Some((ConnectionStatus::Connected, None)))
                }
                BridgeKind::Usb => h.bridge.with(|s| s.session = Some(SessionStatus::Open)),
            }
            h.connect("abc");
            h.tick(Duration::from_secs(2));
            assert_eq!(h.provider.connection_status(), ConnectionStatus::Connected);
            h.events.clear();
            h
        }
    }

    #[test]
    fn test_native_search_clamps_rssi_and_reports() {
        let mut h = Harness::new(BridgeKind::Native);
        h.bridge.with(|s| s.discovered = vec![Device { uid: "one".into(), ..Default::default() }]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.provider.search_for_devices(
            None,
            Box::new(move |devices| sink.lock().unwrap().push(devices.len())),
            false,
        );
        h.collect();
        h.tick(Duration::from_millis(100));
        assert!(seen.lock().unwrap().is_empty());
        h.tick(Duration::from_millis(200));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(h.statuses, vec![ConnectionStatus::Searching]);
        assert_eq!(h.bridge.with(|s| s.calls[0].clone()), "start_search -65");

        h.provider.stop_searching_for_devices();
        h.tick(Duration::from_secs(1));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(h.bridge.with(|s| s.calls.contains(&"stop_search".to_string())));
    }

    #[test]
    fn test_native_connect_flow() {
        let mut h = Harness::new(BridgeKind::Native);
        h.bridge.with(|s| s.product_id = ProductId(0x1234));
        h.connect("abc");
        assert!(h.bridge.with(|s| s.calls.contains(&"open_session abc".to_string())));

        h.tick(Duration::from_secs(1));
        h.bridge.with(|s| s.connection = Some((ConnectionStatus::SecurePairingRequired, None)));
        h.tick(Duration::from_secs(1));
        h.tick(Duration::from_secs(1));
        h.bridge.with(|s| s.connection = Some((ConnectionStatus::Connected, None)));
        h.tick(Duration::from_secs(1));

        assert_eq!(
            h.statuses,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::SecurePairingRequired,
                ConnectionStatus::Connected
            ]
        );
        assert_eq!(h.successes.load(Ordering::SeqCst), 1);
        let device = h.provider.connected_device().unwrap();
        assert_eq!(device.product_id, ProductId::UNDEFINED);
        assert!(device.is_sensor_available(SensorId::Gyroscope));
        assert_eq!(h.provider.core().ctx().memory.last_connected_uid().as_deref(), Some("abc"));
    }

    #[test]
    fn test_native_connect_failure_carries_message() {
        let mut h = Harness::new(BridgeKind::Native);
        h.bridge.with(|s| s.connection = Some((ConnectionStatus::Failed, Some("bond lost".into()))));
        h.connect("abc");
        h.tick(Duration::from_secs(1));
        h.tick(Duration::from_secs(1));
        assert_eq!(h.statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Failed]);
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
        assert_eq!(h.provider.core().failure_reason(), Some("bond lost"));
    }

    #[test]
    fn test_cancel_drops_callbacks() {
        let mut h = Harness::new(BridgeKind::Native);
        h.connect("abc");
        h.provider.cancel_device_connection();
        h.collect();
        h.bridge.with(|s| s.connection = Some((ConnectionStatus::Connected, None)));
        h.tick(Duration::from_secs(2));

        assert_eq!(h.statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Cancelled]);
        assert_eq!(h.successes.load(Ordering::SeqCst), 0);
        assert_eq!(h.failures.load(Ordering::SeqCst), 0);
        assert!(h.bridge.with(|s| s.calls.contains(&"cancel_connection".to_string())));

        h.provider.cancel_device_connection();
        h.collect();
        assert_eq!(h.statuses.len(), 2);
    }

    #[test]
    fn test_cancel_ignored_during_auto_reconnect_search() {
        let mut h = Harness::new(BridgeKind::Native);
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        h.provider.search_for_devices(
            None,
            Box::new(move |devices| sink.lock().unwrap().push(devices.len())),
            true,
        );
        h.collect();
        h.provider.cancel_device_connection();
        h.collect();
        h.tick(Duration::from_millis(300));
        h.tick(Duration::from_millis(300));

        assert!(!h.statuses.contains(&ConnectionStatus::Cancelled));
        assert!(!h.bridge.with(|s| s.calls.contains(&"cancel_connection".to_string())));
        assert_eq!(batches.lock().unwrap().len(), 2);
        assert!(h.provider.core().is_searching());
    }

    #[test]
    fn test_session_loss_reports_disconnect() {
        let mut h = Harness::connected(BridgeKind::Native);
        h.bridge.with(|s| s.session = Some(SessionStatus::Open));
        h.tick(Duration::from_secs(1));
        assert_eq!(h.provider.connection_status(), ConnectionStatus::Connected);

        h.bridge.with(|s| s.session = Some(SessionStatus::Closed));
        h.tick(Duration::from_secs(1));
        assert_eq!(h.statuses.last(), Some(&ConnectionStatus::Disconnected));
        assert!(h.provider.connected_device().is_none());
        assert_eq!(h.provider.cached_device_configuration(), DeviceConfig::disabled());
    }

    #[test]
    fn test_native_config_status_polling() {
        let mut h = Harness::connected(BridgeKind::Native);
        h.bridge.with(|s| s.session = Some(SessionStatus::Open));
        let config = DeviceConfig::disabled().with_sensor(SensorId::Accelerometer);
        h.provider.set_device_configuration(&config);

        h.bridge.with(|s| s.config_status = (ConfigStatus::Pending, ConfigStatus::Idle));
        h.tick(Duration::from_millis(16));
        assert!(h.events.is_empty());

        h.bridge.with(|s| s.config_status = (ConfigStatus::Success, ConfigStatus::Failure));
        h.tick(Duration::from_millis(16));
        assert_eq!(
            h.events,
            vec![ProviderEvent::ConfigurationFailed {
                sensor: ConfigStatus::Success,
                gesture: ConfigStatus::Failure,
            }]
        );

        h.bridge.with(|s| s.config_status = (ConfigStatus::Success, ConfigStatus::Success));
        h.tick(Duration::from_millis(16));
        assert_eq!(h.events.len(), 1);
        assert_eq!(h.provider.cached_device_configuration(), config);
    }

    #[test]
    fn test_frames_and_gestures_forwarded() {
        let mut h = Harness::connected(BridgeKind::Native);
        h.bridge.with(|s| {
            s.session = Some(SessionStatus::Open);
            s.frames = vec![
                SensorFrame { timestamp: 1.0, ..Default::default() },
                SensorFrame { timestamp: 1.02, ..Default::default() },
            ];
            s.gestures = vec![GestureData { timestamp: 1.0, gesture_id: GestureId::HeadNod }];
        });
        h.tick(Duration::from_millis(16));
        assert_eq!(h.provider.current_sensor_frames().len(), 2);
        assert_eq!(h.provider.last_sensor_frame().map(|f| f.timestamp), Some(1.02));
        assert!(h.events.contains(&ProviderEvent::GestureDetected(GestureId::HeadNod)));

        h.tick(Duration::from_millis(16));
        assert!(h.provider.current_sensor_frames().is_empty());
        assert!(h.provider.last_sensor_frame().is_some());
    }

    #[test]
    fn test_usb_connect_and_config() {
        let mut h = Harness::new(BridgeKind::Usb);
        h.bridge.with(|s| s.session = Some(SessionStatus::Opening));
        h.connect("usb-1");
        h.tick(Duration::from_secs(2));
        assert_eq!(h.provider.connection_status(), ConnectionStatus::Connecting);

        h.bridge.with(|s| s.session = Some(SessionStatus::Open));
        h.tick(Duration::from_secs(2));
        assert_eq!(h.provider.connection_status(), ConnectionStatus::Connected);
        assert_eq!(h.provider.id(), ProviderId::Usb);
        assert_eq!(h.provider.connected_device().unwrap().transmission_period, 20);
        h.events.clear();

        let config = DeviceConfig::disabled().with_gesture(GestureId::DoubleTap);
        h.provider.set_device_configuration(&config);
        h.tick(Duration::from_millis(16));
        assert_eq!(h.events, vec![ProviderEvent::ConfigurationSucceeded]);
        assert_eq!(h.provider.cached_device_configuration(), config);
    }

    #[test]
    fn test_usb_closed_session_fails_connect() {
        let mut h = Harness::new(BridgeKind::Usb);
        h.connect("usb-1");
        h.tick(Duration::from_secs(2));
        assert_eq!(h.provider.connection_status(), ConnectionStatus::Failed);
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_usb_dynamic_info_rate_limited() {
        let mut h = Harness::connected(BridgeKind::Usb);
        h.bridge.with(|s| s.session = Some(SessionStatus::Open));
        let before = h.bridge.with(|s| s.dynamic_reads);
        for _ in 0..10 {
            h.tick(Duration::from_millis(10));
        }
        let reads = h.bridge.with(|s| s.dynamic_reads) - before;
        assert!(reads <= 1, "read {} times", reads);
    }

    #[test]
    fn test_intent_and_config_requests_answer_immediately() {
        let mut h = Harness::connected(BridgeKind::Native);
        let verdict = Arc::new(Mutex::new(None));
        let out = verdict.clone();
        let mut profile = AppIntentProfile::new().with_sensor(SensorId::RotationNineDof);
        h.provider.request_intent_profile_validation(
            &mut profile,
            Box::new(move |valid| *out.lock().unwrap() = Some(valid)),
        );
        assert_eq!(*verdict.lock().unwrap(), Some(false));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        h.provider.request_device_configuration(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsupported_platform_finds_nothing() {
        let clock = Arc::new(ManualClock::new());
        let mut provider = DeviceProvider::native(
            WearableContext::manual(clock.clone()),
            Box::new(UnsupportedPlatform),
        );
        provider.on_initialize();
        provider.on_enable();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        provider.search_for_devices(None, Box::new(move |d| sink.lock().unwrap().push(d.len())), false);
        clock.advance(Duration::from_secs(1));
        provider.update();
        assert_eq!(*seen.lock().unwrap(), vec![0]);

        provider.connect_to_device(Device { uid: "x".into(), ..Default::default() }, ConnectCallbacks::new());
        clock.advance(Duration::from_secs(1));
        provider.update();
        assert_eq!(provider.connection_status(), ConnectionStatus::Failed);
    }
}
