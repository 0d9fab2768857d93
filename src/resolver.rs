//! Aggregates configuration requirements into the one config written to the device.
//!
//! Writes are debounced: a change requests a lock, the next
//! [`late_update`](DeviceConfigResolver::late_update) resolves and writes, and
//! further changes inside the lock window are coalesced into a single
//! follow-up write once the window has elapsed.

use crate::context::WearableContext;
use crate::device_config::DeviceConfig;
use crate::intent::AppIntentProfile;
use crate::provider::WearableProvider;
use crate::types::{Device, SensorUpdateInterval};
use std::collections::BTreeMap;
use std::time::Instant;

/// Handle returned by [`DeviceConfigResolver::register_requirement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequirementId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteLock {
    Unlocked,
    /// A write is due at the next late update.
    Locked { since: Instant },
    /// A write went out; waiting for the ack or the window to pass.
    Applied { since: Instant },
}

pub struct DeviceConfigResolver {
    ctx: WearableContext,
    requirements: BTreeMap<RequirementId, DeviceConfig>,
    next_requirement: u64,
    override_config: Option<DeviceConfig>,
    update_interval: SensorUpdateInterval,
    intent: Option<AppIntentProfile>,

    lock: WriteLock,
    pending_again: bool,

    final_config: DeviceConfig,
    last_violations: Vec<String>,
    /// Last config sent to the current device, cleared on reconnect or rejection.
    last_written: Option<DeviceConfig>,
    writes: usize,
}

impl DeviceConfigResolver {
    pub fn new(ctx: WearableContext) -> Self {
        DeviceConfigResolver {
            ctx,
            requirements: BTreeMap::new(),
            next_requirement: 0,
            override_config: None,
            update_interval: SensorUpdateInterval::SLOWEST,
            intent: None,
            lock: WriteLock::Unlocked,
            pending_again: false,
            final_config: DeviceConfig::disabled(),
            last_violations: Vec::new(),
            last_written: None,
            writes: 0,
        }
    }

    // -- Requirements --

    pub fn register_requirement(&mut self, config: DeviceConfig) -> RequirementId {
        let id = RequirementId(self.next_requirement);
        self.next_requirement += 1;
        self.requirements.insert(id, config);
        self.request_update();
        id
    }

    /// Replace a requirement's config. Returns false for an unknown id.
    pub fn update_requirement(&mut self, id: RequirementId, config: DeviceConfig) -> bool {
        match self.requirements.get_mut(&id) {
            Some(slot) if *slot == config => true,
            Some(slot) => {
                *slot = config;
                self.request_update();
                true
            }
            None => false,
        }
    }

    pub fn unregister_requirement(&mut self, id: RequirementId) -> bool {
        if self.requirements.remove(&id).is_none() {
            return false;
        }
        self.request_update();
        true
    }

    pub fn requirement_count(&self) -> usize {
        self.requirements.len()
    }

    /// Replace the resolved output with `config` until unregistered.
    pub fn register_override(&mut self, config: DeviceConfig) {
        self.override_config = Some(config);
        self.request_update();
    }

    pub fn unregister_override(&mut self) {
        if self.override_config.take().is_some() {
            self.request_update();
        }
    }

    pub fn is_overriding(&self) -> bool {
        self.override_config.is_some()
    }

    /// Session-wide interval preference, applied whenever any sensor is enabled.
    pub fn set_update_interval(&mut self, interval: SensorUpdateInterval) {
        if self.update_interval != interval {
            self.update_interval = interval;
            self.request_update();
        }
    }

    pub fn update_interval(&self) -> SensorUpdateInterval {
        self.update_interval
    }

    /// Profile used for the advisory intent check. `None` disables the check.
    pub fn set_intent_profile(&mut self, profile: Option<AppIntentProfile>) {
        self.intent = profile;
    }

    // -- Resolution --

    /// Combine every source into one config and correct it for `device`.
    ///
    /// Enables are OR-ed; the fastest interval among sources with a sensor
    /// enabled wins. An override replaces the combination outright.
    pub fn resolve(&mut self, device: Option<&Device>) -> DeviceConfig {
        let mut config = match &self.override_config {
            Some(config) => config.clone(),
            None => {
                let mut combined = DeviceConfig::disabled();
                for requirement in self.requirements.values() {
                    combined.merge_enables(requirement);
                    if requirement.has_any_sensors_enabled()
                        && requirement.update_interval.is_faster_than(combined.update_interval)
                    {
                        combined.update_interval = requirement.update_interval;
                    }
                }
                if combined.has_any_sensors_enabled()
                    && self.update_interval.is_faster_than(combined.update_interval)
                {
                    combined.update_interval = self.update_interval;
                }
                combined
            }
        };

        if config.has_three_or_more_sensors_enabled()
            && config.update_interval == SensorUpdateInterval::FASTEST
        {
            config.update_interval = config.update_interval.slower();
            log::warn!(
                "Three or more sensors cannot stream at {}ms; slowing to {}ms",
                SensorUpdateInterval::FASTEST.millis(),
                config.update_interval.millis()
            );
        }

        if let Some(device) = device {
            let (sensors, gestures) = config.restrict_to(device);
            for sensor in sensors {
                log::warn!("Sensor {:?} is not available on {}; disabling it", sensor, device);
            }
            for gesture in gestures {
                log::warn!("Gesture {:?} is not available on {}; disabling it", gesture, device);
            }
        }

        self.last_violations = match &self.intent {
            Some(profile) => profile.violations(&config),
            None => Vec::new(),
        };
        if !self.last_violations.is_empty() {
            log::warn!(
                "Device configuration violates the app intent profile: {}",
                self.last_violations.join("; ")
            );
        }

        self.final_config = config.clone();
        config
    }

    pub fn final_config(&self) -> &DeviceConfig {
        &self.final_config
    }

    pub fn last_violations(&self) -> &[String] {
        &self.last_violations
    }

    /// Number of configuration writes sent so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    // -- Dispatch --

    /// Ask for a write. Inside an active window this only marks a follow-up.
    pub fn request_update(&mut self) {
        let now = self.ctx.now();
        match self.lock {
            WriteLock::Locked { since } | WriteLock::Applied { since } if now > since => {
                log::debug!("Configuration change deferred to the end of the lock window");
                self.pending_again = true;
            }
            WriteLock::Applied { .. } => self.pending_again = true,
            _ => self.lock = WriteLock::Locked { since: now },
        }
    }

    pub fn is_write_pending(&self) -> bool {
        self.lock != WriteLock::Unlocked || self.pending_again
    }

    /// Drop any lock and schedule a fresh write for the new device.
    pub fn on_device_connected(&mut self) {
        self.pending_again = false;
        self.last_written = None;
        self.lock = WriteLock::Locked {
            since: self.ctx.now(),
        };
    }

    /// The device acknowledged (or rejected) the last write.
    ///
    /// A change deferred during the window keeps the lock so that the
    /// follow-up goes out when the window ends; otherwise the lock is released.
    pub fn on_configuration_result(&mut self, succeeded: bool) {
        if !succeeded {
            log::warn!("Device rejected the configuration; a corrected one may be retried");
            self.last_written = None;
        }
        if self.pending_again {
            return;
        }
        self.lock = WriteLock::Unlocked;
    }

    /// Run at the end of every tick, after the transport has been updated.
    pub fn late_update(&mut self, provider: &mut dyn WearableProvider) {
        let now = self.ctx.now();
        match self.lock {
            WriteLock::Unlocked => {}
            WriteLock::Locked { .. } => self.dispatch(provider, now),
            WriteLock::Applied { since } => {
                if now.duration_since(since) < self.ctx.settings.config_lock_window {
                    return;
                }
                if self.pending_again {
                    self.pending_again = false;
                    self.dispatch(provider, now);
                } else {
                    self.lock = WriteLock::Unlocked;
                }
            }
        }
    }

    fn dispatch(&mut self, provider: &mut dyn WearableProvider, now: Instant) {
        let Some(device) = provider.connected_device().cloned() else {
            return;
        };
        let config = self.resolve(Some(&device));
        let in_effect = match &self.last_written {
            Some(written) => written.clone(),
            None => provider.cached_device_configuration(),
        };
        if config == in_effect {
            log::trace!("Device already matches the resolved configuration");
            self.lock = if self.pending_again {
                WriteLock::Applied { since: now }
            } else {
                WriteLock::Unlocked
            };
            return;
        }
        log::debug!("Writing device configuration: {}", config);
        provider.set_device_configuration(&config);
        self.last_written = Some(config);
        self.writes += 1;
        self.lock = WriteLock::Applied { since: now };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::provider::{ConnectCallbacks, ProviderCore, SearchCallback};
    use crate::types::{
        DynamicDeviceInfo, GestureFlags, GestureId, ProviderId, SensorFlags, SensorId,
    };
    use std::sync::Arc;
    use std::time::Duration;

    /// Connected-on-demand transport that records configuration writes.
    struct Recorder {
        core: ProviderCore,
        config: DeviceConfig,
        written: Vec<DeviceConfig>,
        /// Leave `config` untouched on writes, like a bridge that refreshes it lazily.
        stale_cache: bool,
    }

    impl Recorder {
        fn connected(ctx: WearableContext, device: Device) -> Self {
            let mut core = ProviderCore::new(ctx);
            core.initialize();
            core.enable();
            core.complete_connection(device);
            Recorder {
                core,
                config: DeviceConfig::disabled(),
                written: Vec::new(),
                stale_cache: false,
            }
        }
    }

    impl WearableProvider for Recorder {
        fn id(&self) -> ProviderId {
            ProviderId::Debug
        }
        fn core(&self) -> &ProviderCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ProviderCore {
            &mut self.core
        }
        fn search_for_devices(&mut self, _: Option<&AppIntentProfile>, _: SearchCallback, _: bool) {}
        fn stop_searching_for_devices(&mut self) {}
        fn connect_to_device(&mut self, _: Device, _: ConnectCallbacks) {}
        fn cancel_device_connection(&mut self) {}
        fn disconnect_from_device(&mut self) {}
        fn set_device_configuration(&mut self, config: &DeviceConfig) {
            if !self.stale_cache {
                self.config = config.clone();
            }
            self.written.push(config.clone());
        }
        fn cached_device_configuration(&self) -> DeviceConfig {
            self.config.clone()
        }
        fn dynamic_device_info(&mut self) -> DynamicDeviceInfo {
            DynamicDeviceInfo::UNKNOWN
        }
        fn begin_config_request(&mut self) {}
        fn begin_intent_validation(&mut self, _: &AppIntentProfile) {}
        fn update(&mut self) {}
    }

    fn full_device() -> Device {
        Device {
            uid: "dev".into(),
            available_sensors: SensorFlags::all(),
            available_gestures: GestureFlags::all(),
            ..Default::default()
        }
    }

    fn rig(device: Device) -> (Arc<ManualClock>, DeviceConfigResolver, Recorder) {
        let clock = Arc::new(ManualClock::new());
        let ctx = WearableContext::manual(clock.clone());
        let resolver = DeviceConfigResolver::new(ctx.clone());
        let provider = Recorder::connected(ctx, device);
        (clock, resolver, provider)
    }

    #[test]
    fn test_or_and_fastest_interval() {
        let (_, mut resolver, _) = rig(full_device());
        resolver.register_requirement(
            DeviceConfig::disabled()
                .with_sensor(SensorId::Accelerometer)
                .with_interval(SensorUpdateInterval::EightyMs),
        );
        resolver.register_requirement(
            DeviceConfig::disabled()
                .with_sensor(SensorId::Gyroscope)
                .with_interval(SensorUpdateInterval::OneHundredSixtyMs),
        );
        resolver.register_requirement(
            DeviceConfig::disabled()
                .with_gesture(GestureId::DoubleTap)
                .with_interval(SensorUpdateInterval::TwentyMs),
        );

        let config = resolver.resolve(None);
        assert!(config.sensor_enabled(SensorId::Accelerometer));
        assert!(config.sensor_enabled(SensorId::Gyroscope));
        assert!(config.gesture_enabled(GestureId::DoubleTap));
        assert_eq!(config.update_interval, SensorUpdateInterval::EightyMs);
    }

    #[test]
    fn test_three_sensors_at_fastest_are_slowed() {
        let (_, mut resolver, _) = rig(full_device());
        resolver.register_requirement(
            DeviceConfig::disabled()
                .with_sensor(SensorId::Accelerometer)
                .with_sensor(SensorId::Gyroscope)
                .with_sensor(SensorId::RotationSixDof)
                .with_interval(SensorUpdateInterval::TwentyMs),
        );
        assert_eq!(resolver.resolve(None).update_interval, SensorUpdateInterval::FortyMs);
    }

    #[test]
    fn test_unavailable_items_are_disabled() {
        let device = Device {
            uid: "dev".into(),
            available_sensors: SensorFlags::ACCELEROMETER,
            available_gestures: GestureFlags::empty(),
            ..Default::default()
        };
        let (_, mut resolver, _) = rig(device.clone());
        resolver.register_requirement(
            DeviceConfig::disabled()
                .with_sensor(SensorId::Accelerometer)
                .with_sensor(SensorId::Gyroscope)
                .with_gesture(GestureId::HeadNod),
        );
        let config = resolver.resolve(Some(&device));
        assert!(config.sensor_enabled(SensorId::Accelerometer));
        assert!(!config.sensor_enabled(SensorId::Gyroscope));
        assert!(!config.has_any_gestures_enabled());
    }

    #[test]
    fn test_override_replaces_and_restores() {
        let (_, mut resolver, _) = rig(full_device());
        resolver.register_requirement(DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        let forced = DeviceConfig::disabled().with_gesture(GestureId::HeadShake);
        resolver.register_override(forced.clone());
        assert_eq!(resolver.resolve(None), forced);
        resolver.unregister_override();
        assert!(resolver.resolve(None).sensor_enabled(SensorId::Gyroscope));
    }

    #[test]
    fn test_session_interval_applies_with_sensors() {
        let (_, mut resolver, _) = rig(full_device());
        resolver.set_update_interval(SensorUpdateInterval::TwentyMs);
        assert_eq!(resolver.resolve(None).update_interval, SensorUpdateInterval::SLOWEST);
        resolver.register_requirement(
            DeviceConfig::disabled()
                .with_sensor(SensorId::Gyroscope)
                .with_interval(SensorUpdateInterval::OneHundredSixtyMs),
        );
        assert_eq!(resolver.resolve(None).update_interval, SensorUpdateInterval::TwentyMs);
    }

    #[test]
    fn test_intent_violations_are_advisory() {
        let (_, mut resolver, mut provider) = rig(full_device());
        resolver.set_intent_profile(Some(AppIntentProfile::new().with_sensor(SensorId::Accelerometer)));
        resolver.register_requirement(DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 1);
        assert_eq!(resolver.last_violations().len(), 2);
    }

    #[test]
    fn test_debounce_coalesces_into_one_follow_up() {
        let (clock, mut resolver, mut provider) = rig(full_device());
        let id = resolver.register_requirement(DeviceConfig::disabled().with_sensor(SensorId::Accelerometer));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 1);

        clock.advance(Duration::from_millis(50));
        resolver.update_requirement(id, DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        clock.advance(Duration::from_millis(50));
        resolver.register_requirement(DeviceConfig::disabled().with_gesture(GestureId::DoubleTap));
        resolver.on_configuration_result(true);
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 1);
        assert!(resolver.is_write_pending());

        clock.advance(Duration::from_millis(300));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 2);
        let last = &provider.written[1];
        assert!(last.sensor_enabled(SensorId::Gyroscope));
        assert!(!last.sensor_enabled(SensorId::Accelerometer));
        assert!(last.gesture_enabled(GestureId::DoubleTap));

        resolver.on_configuration_result(true);
        clock.advance(Duration::from_millis(400));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 2);
        assert!(!resolver.is_write_pending());
    }

    #[test]
    fn test_unchanged_resolution_does_not_write_twice() {
        let (clock, mut resolver, mut provider) = rig(full_device());
        let config = DeviceConfig::disabled().with_sensor(SensorId::RotationSixDof);
        let id = resolver.register_requirement(config.clone());
        resolver.late_update(&mut provider);
        resolver.on_configuration_result(true);
        let first = resolver.final_config().clone();

        clock.advance(Duration::from_secs(1));
        resolver.update_requirement(id, config);
        resolver.request_update();
        resolver.late_update(&mut provider);
        assert_eq!(resolver.final_config(), &first);
        assert_eq!(provider.written.len(), 1);
        assert!(!resolver.is_write_pending());
    }

    #[test]
    fn test_follow_up_skips_config_just_written() {
        let (clock, mut resolver, mut provider) = rig(full_device());
        provider.stale_cache = true;
        let wanted = DeviceConfig::disabled().with_sensor(SensorId::Accelerometer);
        let id = resolver.register_requirement(wanted.clone());
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 1);

        clock.advance(Duration::from_millis(50));
        resolver.update_requirement(id, DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        resolver.update_requirement(id, wanted);
        resolver.on_configuration_result(true);

        clock.advance(Duration::from_millis(300));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 1);
        assert!(!resolver.is_write_pending());
    }

    #[test]
    fn test_rejected_config_is_rewritten() {
        let (clock, mut resolver, mut provider) = rig(full_device());
        provider.stale_cache = true;
        let id = resolver.register_requirement(DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        resolver.late_update(&mut provider);
        resolver.on_configuration_result(false);

        clock.advance(Duration::from_secs(1));
        resolver.update_requirement(id, DeviceConfig::disabled().with_sensor(SensorId::Accelerometer));
        resolver.update_requirement(id, DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 2);
    }

    #[test]
    fn test_reconnect_forces_fresh_write() {
        let (clock, mut resolver, mut provider) = rig(full_device());
        resolver.register_requirement(DeviceConfig::disabled().with_sensor(SensorId::Gyroscope));
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 1);

        provider.config = DeviceConfig::disabled();
        clock.advance(Duration::from_millis(10));
        resolver.on_device_connected();
        resolver.late_update(&mut provider);
        assert_eq!(provider.written.len(), 2);
    }

    #[test]
    fn test_unknown_requirement_ids() {
        let (_, mut resolver, _) = rig(full_device());
        let id = resolver.register_requirement(DeviceConfig::disabled());
        assert!(resolver.unregister_requirement(id));
        assert!(!resolver.unregister_requirement(id));
        assert!(!resolver.update_requirement(id, DeviceConfig::disabled()));
        assert_eq!(resolver.requirement_count(), 0);
    }
}
