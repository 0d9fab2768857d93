//! Simulated transport with an explicit connection phase machine.
//!
//! The virtual device is configured through [`DebugDeviceSettings`]. Every
//! connection attempt walks the phases below, one phase per tick, with a
//! settle delay between most of them:
//!
//! ```text
//! Idle -> Connecting -> CheckFirmware -> SecurePairing -> CheckIntents -> GenerateIntentsResponse -> Succeeded
//!                            |                 |                                |
//!                            +-> AwaitFirmwareResponse <-------------------------+
//!                            +-> Failed <------+--------------------------------+
//! ```
//!
//! Any connecting-like phase may be cancelled, which returns to `Idle`
//! without running either connect callback.

use crate::context::WearableContext;
use crate::device_config::DeviceConfig;
use crate::intent::AppIntentProfile;
use crate::provider::{ConnectCallbacks, ProviderCore, SearchCallback, WearableProvider};
use crate::settings::{self, read_env_bool};
use crate::types::{
    AlertStyle, ConfigStatus, ConnectionStatus, Device, DeviceStatus, DynamicDeviceInfo,
    FirmwareUpdateAlertOption, FirmwareUpdateInformation, GestureData, GestureFlags, GestureId,
    ProductId, ProviderId, Quaternion, SensorAccuracy, SensorFlags, SensorFrame, SensorId,
    SensorQuaternion, SensorServiceSuspendedReason, Vector3,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const GRAVITY: f32 = 9.80665;

/// Steps of a simulated connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    CheckFirmware,
    AwaitFirmwareResponse,
    SecurePairing,
    CheckIntents,
    GenerateIntentsResponse,
    Cancelled,
    ConnectingBeforeFailed,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionSimulation {
    /// The device holds still.
    None,
    /// The device spins at `spin_rate_degrees` per second around each Euler axis.
    #[default]
    ConstantRate,
}

/// Identity and behaviour of the virtual device.
#[derive(Debug, Clone)]
pub struct DebugDeviceSettings {
    pub name: String,
    pub uid: String,
    pub firmware_version: String,
    pub rssi: i32,
    pub product_id: ProductId,
    pub variant_id: u8,
    pub available_sensors: SensorFlags,
    pub available_gestures: GestureFlags,
    /// The installed firmware supports sensor streaming.
    pub firmware_sufficient: bool,
    pub firmware_update_available: bool,
    pub accept_secure_pairing: bool,
    /// Latency of config writes, config queries and intent validation.
    pub response_delay: Duration,
    pub motion: MotionSimulation,
    pub spin_rate_degrees: Vector3,
    /// Log phase transitions at info rather than debug level.
    pub verbose: bool,
}

impl DebugDeviceSettings {
    /// Defaults, with `verbose` and the response delay taken from the context and environment.
    pub fn from_context(ctx: &WearableContext) -> Self {
        DebugDeviceSettings {
            response_delay: ctx.settings.debug_response_delay,
            verbose: read_env_bool("WEARABLE_DEBUG_VERBOSE", false),
            ..Default::default()
        }
    }
}

impl Default for DebugDeviceSettings {
    fn default() -> Self {
        DebugDeviceSettings {
            name: settings::DEBUG_DEVICE_NAME.into(),
            uid: settings::EMPTY_UID.into(),
            firmware_version: settings::DEFAULT_FIRMWARE_VERSION.into(),
            rssi: 0,
            product_id: ProductId::UNDEFINED,
            variant_id: 0,
            available_sensors: SensorFlags::all(),
            available_gestures: GestureFlags::all(),
            firmware_sufficient: true,
            firmware_update_available: false,
            accept_secure_pairing: true,
            response_delay: Duration::from_millis(500),
            motion: MotionSimulation::ConstantRate,
            spin_rate_degrees: Vector3::ZERO,
            verbose: false,
        }
    }
}

pub struct DebugProvider {
    core: ProviderCore,
    device: DebugDeviceSettings,
    virtual_device: Device,
    dynamic_info: DynamicDeviceInfo,
    update_information: FirmwareUpdateInformation,
    config: DeviceConfig,
    epoch: Instant,

    next_search_time: Instant,
    connection_intent: Option<AppIntentProfile>,

    phase: ConnectionPhase,
    next_phase_time: Instant,
    failure_reason: Option<String>,

    config_success_at: Option<Instant>,
    config_failure_at: Option<Instant>,
    config_response_at: Option<Instant>,
    intent_response_at: Option<(Instant, bool)>,

    next_sensor_time: Instant,
    frame: SensorFrame,
    pending_gestures: VecDeque<GestureData>,
}

impl DebugProvider {
    pub fn new(ctx: WearableContext) -> Self {
        let device = DebugDeviceSettings::from_context(&ctx);
        Self::with_settings(ctx, device)
    }

    pub fn with_settings(ctx: WearableContext, device: DebugDeviceSettings) -> Self {
        let now = ctx.now();
        let mut provider = DebugProvider {
            core: ProviderCore::new(ctx),
            device,
            virtual_device: Device::default(),
            dynamic_info: DynamicDeviceInfo::UNKNOWN,
            update_information: FirmwareUpdateInformation::default(),
            config: DeviceConfig::disabled(),
            epoch: now,
            next_search_time: now,
            connection_intent: None,
            phase: ConnectionPhase::Idle,
            next_phase_time: now,
            failure_reason: None,
            config_success_at: None,
            config_failure_at: None,
            config_response_at: None,
            intent_response_at: None,
            next_sensor_time: now,
            frame: SensorFrame::default(),
            pending_gestures: VecDeque::new(),
        };
        provider.refresh_virtual_device();
        provider
    }

    pub fn settings(&self) -> &DebugDeviceSettings {
        &self.device
    }

    /// Changes take effect on the next tick or connection attempt.
    pub fn settings_mut(&mut self) -> &mut DebugDeviceSettings {
        &mut self.device
    }

    /// The device this transport will report during a search.
    pub fn virtual_device(&self) -> &Device {
        &self.virtual_device
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    // -- Simulation --

    pub fn simulate_disconnect(&mut self) {
        log::log!(self.level(), "Simulating a device disconnect");
        self.disconnect_from_device();
    }

    /// Queue a gesture. It is emitted with the next frame if enabled and available.
    pub fn simulate_gesture(&mut self, gesture: GestureId) {
        self.pending_gestures.push_back(GestureData {
            timestamp: self.seconds_since_epoch(self.next_sensor_time),
            gesture_id: gesture,
        });
    }

    pub fn set_device_status_flag(&mut self, flag: DeviceStatus, state: bool) {
        self.dynamic_info.device_status.set(flag, state);
    }

    pub fn simulate_sensor_service_suspended(&mut self, reason: SensorServiceSuspendedReason) {
        let status = &mut self.dynamic_info.device_status;
        status.insert(DeviceStatus::SENSOR_SERVICE_SUSPENDED);
        status.set_suspended_reason(Some(reason));
    }

    pub fn simulate_sensor_service_resumed(&mut self) {
        let status = &mut self.dynamic_info.device_status;
        status.remove(DeviceStatus::SENSOR_SERVICE_SUSPENDED);
        status.set_suspended_reason(None);
    }

    // -- Internals --

    fn level(&self) -> log::Level {
        if self.device.verbose {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    fn seconds_since_epoch(&self, t: Instant) -> f32 {
        t.saturating_duration_since(self.epoch).as_secs_f32()
    }

    fn refresh_virtual_device(&mut self) {
        let d = &mut self.virtual_device;
        d.name = self.device.name.clone();
        d.uid = self.device.uid.clone();
        d.firmware_version = self.device.firmware_version.clone();
        d.rssi = self.device.rssi;
        d.product_id = self.device.product_id;
        d.variant_id = self.device.variant_id;
        d.available_sensors = self.device.available_sensors;
        d.available_gestures = self.device.available_gestures;
        d.maximum_active_sensors = SensorId::ALL.len() as i32 + 1;
        d.apply_dynamic_info(&self.dynamic_info);
    }

    fn set_phase(&mut self, phase: ConnectionPhase, delay: Duration) {
        self.phase = phase;
        self.next_phase_time = self.core.now() + delay;
    }

    fn fail_after(&mut self, reason: &str, delay: Duration) {
        self.failure_reason = Some(reason.to_string());
        self.set_phase(ConnectionPhase::Failed, delay);
    }

    /// Profiles only declare sensors and gestures the virtual device has. Every interval is supported.
    fn check_intent_validity(&self, profile: &AppIntentProfile) -> bool {
        self.virtual_device.supports_profile(profile)
    }

    fn stop_search(&mut self, report: bool) {
        if self.core.end_search() && report {
            self.core.report_status(ConnectionStatus::Disconnected, None);
            log::log!(self.level(), "Stopped searching for devices");
        }
    }

    fn clear_pending_responses(&mut self) {
        self.config_success_at = None;
        self.config_failure_at = None;
        self.config_response_at = None;
        self.intent_response_at = None;
    }

    fn advance_phase(&mut self) {
        if self.core.is_connected() {
            return;
        }
        let delay = self.core.ctx().settings.debug_phase_delay;
        let device = self.virtual_device.clone();
        log::log!(self.level(), "Connection phase {:?}", self.phase);

        match self.phase {
            ConnectionPhase::Idle | ConnectionPhase::AwaitFirmwareResponse => {}
            ConnectionPhase::Connecting => {
                self.set_phase(ConnectionPhase::CheckFirmware, delay);
                self.core.report_status(ConnectionStatus::Connecting, Some(&device));
            }
            ConnectionPhase::CheckFirmware => {
                let status = device.device_status;
                if self.device.firmware_sufficient {
                    if status.secure_pairing_required() && !status.already_paired_to_client() {
                        self.set_phase(ConnectionPhase::SecurePairing, Duration::ZERO);
                    } else {
                        self.set_phase(ConnectionPhase::CheckIntents, delay);
                    }
                } else if self.device.firmware_update_available {
                    log::log!(self.level(), "Firmware is insufficient; a required update is available");
                    self.core.report_status(ConnectionStatus::FirmwareUpdateRequired, Some(&device));
                    self.set_phase(ConnectionPhase::AwaitFirmwareResponse, Duration::ZERO);
                } else {
                    log::error!("Firmware is insufficient and no update is available; device is unsupported");
                    self.fail_after("firmware is insufficient and no update is available", Duration::ZERO);
                }
            }
            ConnectionPhase::SecurePairing => {
                self.core.report_status(ConnectionStatus::SecurePairingRequired, Some(&device));
                if self.device.accept_secure_pairing {
                    self.set_phase(ConnectionPhase::CheckIntents, delay);
                } else {
                    log::warn!("Secure pairing was rejected");
                    self.fail_after("secure pairing was rejected", delay);
                }
            }
            ConnectionPhase::CheckIntents => {
                self.core.report_status(ConnectionStatus::Connecting, Some(&device));
                self.set_phase(ConnectionPhase::GenerateIntentsResponse, delay);
            }
            ConnectionPhase::GenerateIntentsResponse => {
                let valid = match &self.connection_intent {
                    Some(profile) => self.check_intent_validity(profile),
                    None => {
                        log::log!(self.level(), "No app intent profile given; treating intents as valid");
                        true
                    }
                };
                let update = self.device.firmware_update_available;
                match (valid, update) {
                    (true, true) => {
                        self.core.report_status(ConnectionStatus::FirmwareUpdateAvailable, Some(&device));
                        self.set_phase(ConnectionPhase::AwaitFirmwareResponse, Duration::ZERO);
                    }
                    (true, false) => self.set_phase(ConnectionPhase::Succeeded, Duration::ZERO),
                    (false, true) => {
                        log::warn!("App intent profile is not supported by the installed firmware");
                        self.core.report_status(ConnectionStatus::FirmwareUpdateRequired, Some(&device));
                        self.set_phase(ConnectionPhase::AwaitFirmwareResponse, Duration::ZERO);
                    }
                    (false, false) => {
                        log::error!("App intent profile is not supported and no update is available");
                        self.fail_after("app intent profile is not supported", Duration::ZERO);
                    }
                }
            }
            ConnectionPhase::Cancelled => {
                self.set_phase(ConnectionPhase::Idle, Duration::ZERO);
                self.core.cancel_connection(Some(&device));
            }
            ConnectionPhase::ConnectingBeforeFailed => {
                self.set_phase(ConnectionPhase::Failed, delay);
                self.core.report_status(ConnectionStatus::Connecting, Some(&device));
            }
            ConnectionPhase::Failed => {
                self.set_phase(ConnectionPhase::Idle, Duration::ZERO);
                let reason = self.failure_reason.take();
                self.core.fail_connection(Some(&device), reason);
            }
            ConnectionPhase::Succeeded => {
                self.next_sensor_time = self.core.now();
                self.set_phase(ConnectionPhase::Idle, Duration::ZERO);
                self.core.complete_connection(device);
            }
        }
    }

    fn emit_due_responses(&mut self, now: Instant) {
        if self.config_success_at.is_some_and(|t| now >= t) {
            self.config_success_at = None;
            self.core.report_config_success();
        }
        if self.config_failure_at.is_some_and(|t| now >= t) {
            self.config_failure_at = None;
            self.core.report_config_failure(ConfigStatus::Failure, ConfigStatus::Failure);
        }
        if self.config_response_at.is_some_and(|t| now >= t) {
            self.config_response_at = None;
            self.core.complete_config_request(&self.config);
        }
        if let Some((at, valid)) = self.intent_response_at {
            if now >= at {
                self.intent_response_at = None;
                self.core.complete_intent_request(valid);
            }
        }
    }

    /// Emit every frame that fell due since the last tick.
    fn emit_frames(&mut self, now: Instant) {
        while now >= self.next_sensor_time {
            let interval = self.config.update_interval;
            self.next_sensor_time += interval.duration();

            if self.dynamic_info.device_status.service_suspended() {
                self.pending_gestures.clear();
                continue;
            }

            if self.config.has_any_sensors_enabled() {
                self.frame.delta_time = interval.seconds();
                self.frame.timestamp = self.seconds_since_epoch(self.next_sensor_time);
                self.simulate_sensors();
                self.core.push_frame(self.frame);
            }

            while let Some(gesture) = self.pending_gestures.pop_front() {
                let id = gesture.gesture_id;
                if self.config.gesture_enabled(id) && self.virtual_device.is_gesture_available(id) {
                    log::log!(self.level(), "Triggering gesture {:?}", id);
                    self.core.push_gesture(gesture);
                } else {
                    log::warn!("Dropping simulated gesture {:?}: it is not enabled or not available", id);
                }
            }
        }
    }

    fn simulate_sensors(&mut self) {
        let rotation = match self.device.motion {
            MotionSimulation::ConstantRate => {
                Quaternion::from_euler_degrees(self.device.spin_rate_degrees.scale(self.frame.timestamp))
            }
            MotionSimulation::None => Quaternion::IDENTITY,
        };
        let inverse = rotation.inverse();

        if self.sensor_active(SensorId::Accelerometer) {
            self.frame.acceleration.value = inverse.rotate(Vector3::new(0.0, GRAVITY, 0.0));
            self.frame.acceleration.accuracy = SensorAccuracy::High;
        }
        if self.sensor_active(SensorId::Gyroscope) {
            let spin = match self.device.motion {
                MotionSimulation::ConstantRate => self.device.spin_rate_degrees.scale(1f32.to_radians()),
                MotionSimulation::None => Vector3::ZERO,
            };
            self.frame.angular_velocity.value = inverse.rotate(spin);
            self.frame.angular_velocity.accuracy = SensorAccuracy::High;
        }
        let sample = SensorQuaternion { value: rotation, measurement_uncertainty: 0.0 };
        if self.sensor_active(SensorId::RotationNineDof) {
            self.frame.rotation_nine_dof = sample;
        }
        if self.sensor_active(SensorId::RotationSixDof) {
            self.frame.rotation_six_dof = sample;
        }
    }

    fn sensor_active(&self, sensor: SensorId) -> bool {
        self.config.sensor_enabled(sensor) && self.virtual_device.is_sensor_available(sensor)
    }

    fn log_config_changes(&self, config: &DeviceConfig) {
        let level = self.level();
        for sensor in SensorId::ALL {
            let (old, new) = (self.config.sensor_enabled(sensor), config.sensor_enabled(sensor));
            if old != new {
                log::log!(level, "{} sensor {:?}", if new { "Starting" } else { "Stopping" }, sensor);
            }
        }
        for gesture in GestureId::ALL {
            let (old, new) = (self.config.gesture_enabled(gesture), config.gesture_enabled(gesture));
            if old != new {
                log::log!(level, "{} gesture {:?}", if new { "Enabling" } else { "Disabling" }, gesture);
            }
        }
        if self.config.update_interval != config.update_interval {
            log::log!(level, "Setting update interval to {}ms", config.update_interval.millis());
        }
    }
}

impl WearableProvider for DebugProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Debug
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
        self.connection_intent = intent.cloned();
        self.stop_search(true);
        log::log!(self.level(), "Searching for devices");
        self.core.begin_search(callback, auto_reconnect);
        self.next_search_time = self.core.now();
    }

    fn stop_searching_for_devices(&mut self) {
        self.stop_search(true);
    }

    fn connect_to_device(&mut self, device: Device, callbacks: ConnectCallbacks) {
        self.core.begin_connection(callbacks);
        self.stop_search(false);
        self.disconnect_from_device();
        self.refresh_virtual_device();
        self.failure_reason = None;
        log::log!(self.level(), "Connecting to {}", device);

        if device != self.virtual_device {
            log::warn!("The debug transport can only connect to its virtual device");
            self.failure_reason = Some(format!("unknown device {}", device.uid));
            self.set_phase(ConnectionPhase::ConnectingBeforeFailed, Duration::ZERO);
            return;
        }

        self.set_phase(ConnectionPhase::Connecting, Duration::ZERO);
        let device = self.virtual_device.clone();
        self.core.report_status(ConnectionStatus::Connecting, Some(&device));
    }

    fn cancel_device_connection(&mut self) {
        if self.core.is_searching() || !self.core.status().is_connecting() {
            return;
        }
        log::log!(self.level(), "Connection cancellation requested");
        self.set_phase(ConnectionPhase::Cancelled, Duration::ZERO);
    }

    fn disconnect_from_device(&mut self) {
        self.config.disable_all_sensors();
        self.config.disable_all_gestures();

        let Some(device) = self.core.take_connected_device() else {
            return;
        };
        log::log!(self.level(), "Disconnected from {}", device);
        self.set_phase(ConnectionPhase::Idle, Duration::ZERO);
        self.clear_pending_responses();
        self.core.report_status(ConnectionStatus::Disconnected, Some(&device));
    }

    fn firmware_update_information(&self) -> FirmwareUpdateInformation {
        self.update_information.clone()
    }

    fn select_firmware_update_option(&mut self, option: &FirmwareUpdateAlertOption) {
        let status = self.core.status();
        if !matches!(
            status,
            ConnectionStatus::FirmwareUpdateRequired | ConnectionStatus::FirmwareUpdateAvailable
        ) {
            return;
        }

        match option.style {
            AlertStyle::Affirmative => {
                log::warn!("Firmware updates cannot be applied to the debug device; cancelling the connection");
                self.set_phase(ConnectionPhase::Cancelled, Duration::ZERO);
            }
            AlertStyle::Negative if status == ConnectionStatus::FirmwareUpdateRequired => {
                log::error!("A required firmware update was skipped");
                self.fail_after("a required firmware update was skipped", Duration::ZERO);
            }
            AlertStyle::Negative => {
                log::log!(self.level(), "Optional firmware update skipped");
                self.set_phase(ConnectionPhase::Succeeded, Duration::ZERO);
            }
        }
    }

    fn set_device_configuration(&mut self, config: &DeviceConfig) {
        let at = self.core.now() + self.device.response_delay;
        if self.dynamic_info.device_status.service_suspended() {
            log::warn!("Cannot configure the device while its sensor service is suspended");
            self.config_failure_at = Some(at);
            return;
        }
        self.log_config_changes(config);
        self.config = config.clone();
        self.config_success_at = Some(at);
    }

    fn cached_device_configuration(&self) -> DeviceConfig {
        self.config.clone()
    }

    fn dynamic_device_info(&mut self) -> DynamicDeviceInfo {
        self.dynamic_info
    }

    fn set_app_focus_changed(&mut self, has_focus: bool) {
        log::log!(
            self.level(),
            "Application {} focus",
            if has_focus { "gained" } else { "lost" }
        );
    }

    fn begin_config_request(&mut self) {
        self.config_response_at = Some(self.core.now() + self.device.response_delay);
    }

    fn begin_intent_validation(&mut self, profile: &AppIntentProfile) {
        log::log!(self.level(), "Validating app intent profile {}", profile);
        let valid = self.check_intent_validity(profile);
        self.intent_response_at = Some((self.core.now() + self.device.response_delay, valid));
    }

    fn on_enable(&mut self) {
        self.core.enable();
        self.next_sensor_time = self.core.now();
        self.pending_gestures.clear();
        self.clear_pending_responses();
    }

    fn update(&mut self) {
        let now = self.core.now();
        self.refresh_virtual_device();

        if self.core.is_searching() && now >= self.next_search_time {
            self.next_search_time += self.core.ctx().settings.search_poll_interval;
            let devices = [self.virtual_device.clone()];
            self.deliver_search_results(&devices);
        }

        if self.phase != ConnectionPhase::Idle && now >= self.next_phase_time {
            self.advance_phase();
        }

        self.core.clear_batches();
        if self.core.is_connected() {
            self.emit_due_responses(now);
            self.emit_frames(now);
        }

        self.finish_update();
    }
}
