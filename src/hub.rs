//! The application-facing session.
//!
//! [`WearableSession`] owns the active transport, a cache of inactive ones,
//! and the configuration resolver. Each [`update`](WearableSession::update)
//! advances the transport, republishes its events to every subscriber in
//! order, and then lets the resolver dispatch a pending configuration write.
//!
//! Subscribers receive [`SessionEvent`]s over their own channel, so swapping
//! the active transport never loses a subscriber.

use crate::context::WearableContext;
use crate::device_config::DeviceConfig;
use crate::intent::AppIntentProfile;
use crate::provider::{ConnectCallbacks, ProviderEvent, WearableProvider};
use crate::resolver::{DeviceConfigResolver, RequirementId};
use crate::types::{
    ConfigStatus, ConnectionStatus, Device, FirmwareUpdateAlertOption, FirmwareUpdateInformation,
    GestureData, GestureId, ProviderId, SensorFrame, SensorServiceSuspendedReason,
    SensorUpdateInterval,
};
use crate::{Result, WearableError};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::time::Duration;

/// Everything a session reports to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStatusChanged {
        status: ConnectionStatus,
        device: Option<Device>,
    },
    /// Follows the status event that entered `Connected`.
    DeviceConnected(Device),
    /// Follows the status event that left `Connected`.
    DeviceDisconnected(Device),
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

impl SessionEvent {
    pub fn gesture(&self) -> Option<GestureId> {
        match self {
            SessionEvent::GestureDetected(gesture) => Some(*gesture),
            _ => None,
        }
    }

    pub fn is_gesture(&self, gesture: GestureId) -> bool {
        self.gesture() == Some(gesture)
    }

    pub fn is_double_tap(&self) -> bool {
        self.is_gesture(GestureId::DoubleTap)
    }

    pub fn is_head_nod(&self) -> bool {
        self.is_gesture(GestureId::HeadNod)
    }

    pub fn is_head_shake(&self) -> bool {
        self.is_gesture(GestureId::HeadShake)
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match self {
            SessionEvent::ConnectionStatusChanged { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<ProviderEvent> for SessionEvent {
    fn from(event: ProviderEvent) -> Self {
        match event {
            ProviderEvent::ConnectionStatusChanged { status, device } => {
                SessionEvent::ConnectionStatusChanged { status, device }
            }
            ProviderEvent::SensorsUpdated(frame) => SessionEvent::SensorsUpdated(frame),
            ProviderEvent::GestureDetected(gesture) => SessionEvent::GestureDetected(gesture),
            ProviderEvent::ConfigurationSucceeded => SessionEvent::ConfigurationSucceeded,
            ProviderEvent::ConfigurationFailed { sensor, gesture } => {
                SessionEvent::ConfigurationFailed { sensor, gesture }
            }
            ProviderEvent::SensorServiceSuspended(reason) => {
                SessionEvent::SensorServiceSuspended(reason)
            }
            ProviderEvent::SensorServiceResumed => SessionEvent::SensorServiceResumed,
            ProviderEvent::ProxyConnected => SessionEvent::ProxyConnected,
            ProviderEvent::ProxyDisconnected => SessionEvent::ProxyDisconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Receiving end of a session subscription.
///
/// Closed when the subscriber is removed or the session shuts down.
pub struct Subscription {
    id: SubscriberId,
    receiver: Receiver<SessionEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Block until the next event.
    pub fn recv(&self) -> Result<SessionEvent> {
        self.receiver
            .recv()
            .map_err(|_| WearableError::SubscriptionClosed)
    }

    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SessionEvent> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => WearableError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => WearableError::SubscriptionClosed,
        })
    }

    /// Everything queued so far, without blocking.
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Outcome of the last app intent profile validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentValidationStatus {
    Unknown,
    Validating,
    Success,
    Failure,
    /// No profile is set.
    Disabled,
}

pub struct WearableSession {
    provider: Box<dyn WearableProvider>,
    inactive: HashMap<ProviderId, Box<dyn WearableProvider>>,
    resolver: DeviceConfigResolver,

    subscribers: Vec<(SubscriberId, Sender<SessionEvent>)>,
    next_subscriber: u64,

    intent_profile: Option<AppIntentProfile>,
    intent_status: IntentValidationStatus,
    intent_tx: Sender<bool>,
    intent_rx: Receiver<bool>,

    last_status: ConnectionStatus,
    shut_down: bool,
}

impl WearableSession {
    /// Create a session around `provider`, which is initialized and enabled.
    pub fn new(ctx: WearableContext, provider: Box<dyn WearableProvider>) -> Self {
        let (intent_tx, intent_rx) = crossbeam_channel::unbounded();
        let mut session = WearableSession {
            provider,
            inactive: HashMap::new(),
            resolver: DeviceConfigResolver::new(ctx),
            subscribers: Vec::new(),
            next_subscriber: 0,
            intent_profile: None,
            intent_status: IntentValidationStatus::Disabled,
            intent_tx,
            intent_rx,
            last_status: ConnectionStatus::Disconnected,
            shut_down: false,
        };
        session.activate();
        session
    }

    // -- Providers --

    pub fn active_provider_id(&self) -> ProviderId {
        self.provider.id()
    }

    pub fn provider(&self) -> &dyn WearableProvider {
        self.provider.as_ref()
    }

    pub fn provider_mut(&mut self) -> &mut dyn WearableProvider {
        self.provider.as_mut()
    }

    /// Make `provider` the active transport.
    ///
    /// The previous one is disconnected, disabled and kept in the cache under
    /// its id, replacing any cached transport with the same id.
    pub fn set_active_provider(&mut self, provider: Box<dyn WearableProvider>) {
        let old = std::mem::replace(&mut self.provider, provider);
        self.retire(old);
        if let Some(mut stale) = self.inactive.remove(&self.provider.id()) {
            stale.on_destroy();
        }
        self.activate();
    }

    /// Switch back to a cached transport. Returns false if none has this id.
    pub fn activate_cached_provider(&mut self, id: ProviderId) -> bool {
        if self.provider.id() == id {
            return true;
        }
        match self.inactive.remove(&id) {
            Some(provider) => {
                self.set_active_provider(provider);
                true
            }
            None => false,
        }
    }

    pub fn cached_provider_ids(&self) -> Vec<ProviderId> {
        self.inactive.keys().copied().collect()
    }

    fn activate(&mut self) {
        if !self.provider.core().is_initialized() {
            self.provider.on_initialize();
        }
        self.last_status = ConnectionStatus::Disconnected;
        self.provider.on_enable();
        log::info!("Active provider is now {:?}", self.provider.id());
        self.flush_events();
    }

    fn retire(&mut self, mut old: Box<dyn WearableProvider>) {
        if old.connection_status().is_connecting() {
            old.cancel_device_connection();
        }
        if old.core().is_connected() {
            old.disconnect_from_device();
        }
        old.on_disable();
        for event in old.drain_events() {
            self.dispatch_event(event);
        }
        if self.intent_status == IntentValidationStatus::Validating {
            self.intent_status = IntentValidationStatus::Unknown;
        }
        self.inactive.insert(old.id(), old);
    }

    // -- Subscribers --

    pub fn subscribe(&mut self) -> Subscription {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.push((id, sender));
        Subscription { id, receiver }
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn publish(&mut self, event: SessionEvent) {
        self.subscribers.retain(|(id, sender)| {
            if sender.send(event.clone()).is_ok() {
                true
            } else {
                log::debug!("Removing closed subscriber {:?}", id);
                false
            }
        });
    }

    fn dispatch_event(&mut self, event: ProviderEvent) {
        let derived = match &event {
            ProviderEvent::ConnectionStatusChanged { status, device } => {
                self.track_status(*status, device.as_ref())
            }
            ProviderEvent::ConfigurationSucceeded => {
                self.resolver.on_configuration_result(true);
                None
            }
            ProviderEvent::ConfigurationFailed { .. } => {
                self.resolver.on_configuration_result(false);
                None
            }
            _ => None,
        };
        self.publish(SessionEvent::from(event));
        if let Some(derived) = derived {
            self.publish(derived);
        }
    }

    fn track_status(&mut self, status: ConnectionStatus, device: Option<&Device>) -> Option<SessionEvent> {
        let previous = std::mem::replace(&mut self.last_status, status);
        let entered = status == ConnectionStatus::Connected && previous != ConnectionStatus::Connected;
        let left = previous == ConnectionStatus::Connected && status != ConnectionStatus::Connected;
        if entered {
            self.resolver.on_device_connected();
        }
        let device = device?.clone();
        if entered {
            Some(SessionEvent::DeviceConnected(device))
        } else if left {
            Some(SessionEvent::DeviceDisconnected(device))
        } else {
            None
        }
    }

    fn flush_events(&mut self) {
        for event in self.provider.drain_events() {
            self.dispatch_event(event);
        }
    }

    // -- Connection --

    pub fn search_for_devices(
        &mut self,
        callback: impl FnMut(&[Device]) + Send + 'static,
        auto_reconnect: bool,
    ) {
        self.provider
            .search_for_devices(self.intent_profile.as_ref(), Box::new(callback), auto_reconnect);
        self.flush_events();
    }

    pub fn stop_searching_for_devices(&mut self) {
        self.provider.stop_searching_for_devices();
        self.flush_events();
    }

    pub fn connect_to_device(&mut self, device: Device, callbacks: ConnectCallbacks) {
        self.provider.connect_to_device(device, callbacks);
        self.flush_events();
    }

    pub fn cancel_device_connection(&mut self) {
        self.provider.cancel_device_connection();
        self.flush_events();
    }

    pub fn disconnect_from_device(&mut self) {
        self.provider.disconnect_from_device();
        self.flush_events();
    }

    pub fn firmware_update_information(&self) -> FirmwareUpdateInformation {
        self.provider.firmware_update_information()
    }

    pub fn select_firmware_update_option(&mut self, option: &FirmwareUpdateAlertOption) {
        self.provider.select_firmware_update_option(option);
        self.flush_events();
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.provider.connection_status()
    }

    pub fn connected_device(&self) -> Option<&Device> {
        self.provider.connected_device()
    }

    pub fn last_sensor_frame(&self) -> Option<SensorFrame> {
        self.provider.last_sensor_frame()
    }

    /// Frames received during the last update.
    pub fn current_sensor_frames(&self) -> &[SensorFrame] {
        self.provider.current_sensor_frames()
    }

    pub fn current_gesture_data(&self) -> &[GestureData] {
        self.provider.current_gesture_data()
    }

    // -- Intent --

    /// Set or clear the app intent profile used for searches and validation.
    pub fn set_intent_profile(&mut self, profile: Option<AppIntentProfile>) {
        self.intent_status = if profile.is_some() {
            IntentValidationStatus::Unknown
        } else {
            IntentValidationStatus::Disabled
        };
        self.resolver.set_intent_profile(profile.clone());
        self.intent_profile = profile;
    }

    pub fn intent_profile(&self) -> Option<&AppIntentProfile> {
        self.intent_profile.as_ref()
    }

    /// Ask the transport to validate the profile. Returns false if no profile
    /// is set or a validation is already running.
    pub fn validate_intent_profile(&mut self) -> bool {
        let Some(profile) = self.intent_profile.as_mut() else {
            log::warn!("No app intent profile is set; nothing to validate");
            self.intent_status = IntentValidationStatus::Disabled;
            return false;
        };
        if self.intent_status == IntentValidationStatus::Validating
            || self.provider.core().is_waiting_for_intent_validation()
        {
            log::error!("An app intent profile validation is already in progress");
            return false;
        }

        self.intent_status = IntentValidationStatus::Validating;
        let tx = self.intent_tx.clone();
        self.provider.request_intent_profile_validation(
            profile,
            Box::new(move |valid| {
                let _ = tx.send(valid);
            }),
        );
        self.poll_intent_result();
        true
    }

    pub fn intent_validation_status(&self) -> IntentValidationStatus {
        self.intent_status
    }

    fn poll_intent_result(&mut self) {
        while let Ok(valid) = self.intent_rx.try_recv() {
            if self.intent_status != IntentValidationStatus::Validating {
                continue;
            }
            self.intent_status = if valid {
                IntentValidationStatus::Success
            } else {
                log::warn!("The connected device does not support the app intent profile");
                IntentValidationStatus::Failure
            };
        }
    }

    // -- Configuration --

    pub fn register_requirement(&mut self, config: DeviceConfig) -> RequirementId {
        self.resolver.register_requirement(config)
    }

    pub fn update_requirement(&mut self, id: RequirementId, config: DeviceConfig) -> bool {
        self.resolver.update_requirement(id, config)
    }

    pub fn unregister_requirement(&mut self, id: RequirementId) -> bool {
        self.resolver.unregister_requirement(id)
    }

    pub fn register_override(&mut self, config: DeviceConfig) {
        self.resolver.register_override(config);
    }

    pub fn unregister_override(&mut self) {
        self.resolver.unregister_override();
    }

    pub fn set_update_interval(&mut self, interval: SensorUpdateInterval) {
        self.resolver.set_update_interval(interval);
    }

    pub fn resolver(&self) -> &DeviceConfigResolver {
        &self.resolver
    }

    /// Read the device's active configuration. Concurrent callers share one request.
    pub fn request_device_configuration(
        &mut self,
        callback: impl FnOnce(&DeviceConfig) + Send + 'static,
    ) {
        self.provider.request_device_configuration(Box::new(callback));
    }

    pub fn set_app_focus(&mut self, has_focus: bool) {
        self.provider.set_app_focus_changed(has_focus);
    }

    // -- Tick --

    /// Advance the transport, deliver its events, then dispatch configuration.
    pub fn update(&mut self) {
        if self.shut_down {
            return;
        }
        self.provider.update();
        self.flush_events();
        self.poll_intent_result();
        self.resolver.late_update(self.provider.as_mut());
    }

    /// Turn the device's sensors off, disconnect, and tear down every transport.
    ///
    /// Subscribers get the final events, then their channels close.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.provider.core().is_connected() {
            self.provider.set_device_configuration(&DeviceConfig::disabled());
            self.provider.disconnect_from_device();
        }
        self.provider.on_disable();
        self.provider.on_destroy();
        self.flush_events();

        for provider in self.inactive.values_mut() {
            provider.on_destroy();
        }
        self.subscribers.clear();
        log::info!("Wearable session shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for WearableSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
