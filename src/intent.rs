//! Declared application intent, checked against device capability.
//!
//! Intent is advisory: a mismatch is reported and logged, never enforced.

use crate::device_config::DeviceConfig;
use crate::types::{
    Device, GestureFlags, GestureId, SensorFlags, SensorId, SensorUpdateInterval,
    UpdateIntervalFlags,
};
use std::fmt;

/// Sensors, gestures and update intervals an application says it will use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppIntentProfile {
    sensors: SensorFlags,
    gestures: GestureFlags,
    intervals: UpdateIntervalFlags,
    dirty: bool,
}

impl AppIntentProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(mut self, sensor: SensorId) -> Self {
        self.add_sensor(sensor);
        self
    }

    pub fn with_gesture(mut self, gesture: GestureId) -> Self {
        self.add_gesture(gesture);
        self
    }

    pub fn with_interval(mut self, interval: SensorUpdateInterval) -> Self {
        self.add_interval(interval);
        self
    }

    pub fn add_sensor(&mut self, sensor: SensorId) {
        self.sensors |= sensor.flag();
        self.dirty = true;
    }

    pub fn remove_sensor(&mut self, sensor: SensorId) {
        self.sensors.remove(sensor.flag());
        self.dirty = true;
    }

    pub fn add_gesture(&mut self, gesture: GestureId) {
        self.gestures |= gesture.flag();
        self.dirty = true;
    }

    pub fn remove_gesture(&mut self, gesture: GestureId) {
        self.gestures.remove(gesture.flag());
        self.dirty = true;
    }

    pub fn add_interval(&mut self, interval: SensorUpdateInterval) {
        self.intervals |= interval.flag();
        self.dirty = true;
    }

    pub fn remove_interval(&mut self, interval: SensorUpdateInterval) {
        self.intervals.remove(interval.flag());
        self.dirty = true;
    }

    pub fn sensors(&self) -> SensorFlags {
        self.sensors
    }

    pub fn gestures(&self) -> GestureFlags {
        self.gestures
    }

    pub fn intervals(&self) -> UpdateIntervalFlags {
        self.intervals
    }

    pub fn contains_sensor(&self, sensor: SensorId) -> bool {
        self.sensors.contains(sensor.flag())
    }

    pub fn contains_gesture(&self, gesture: GestureId) -> bool {
        self.gestures.contains(gesture.flag())
    }

    pub fn contains_interval(&self, interval: SensorUpdateInterval) -> bool {
        self.intervals.contains(interval.flag())
    }

    /// Set by every mutation, cleared once a validation request goes out.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// True when the device offers every sensor and gesture in the profile.
    pub fn is_supported_by(&self, device: &Device) -> bool {
        device.available_sensors.contains(self.sensors)
            && device.available_gestures.contains(self.gestures)
    }

    /// Everything `config` enables that this profile did not declare.
    pub fn violations(&self, config: &DeviceConfig) -> Vec<String> {
        let mut out = Vec::new();
        for sensor in config.enabled_sensors().sensors() {
            if !self.contains_sensor(sensor) {
                out.push(format!("sensor {:?} is not in the app intent profile", sensor));
            }
        }
        for gesture in config.enabled_gestures().gestures() {
            if !self.contains_gesture(gesture) {
                out.push(format!("gesture {:?} is not in the app intent profile", gesture));
            }
        }
        if config.has_any_sensors_enabled() && !self.contains_interval(config.update_interval) {
            out.push(format!(
                "update interval {}ms is not in the app intent profile",
                config.update_interval.millis()
            ));
        }
        out
    }
}

impl fmt::Display for AppIntentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sensors: Vec<String> = self.sensors.sensors().map(|s| format!("{:?}", s)).collect();
        let gestures: Vec<String> = self.gestures.gestures().map(|g| format!("{:?}", g)).collect();
        let intervals: Vec<String> = self
            .intervals
            .intervals()
            .map(|i| format!("{}ms", i.millis()))
            .collect();
        write!(
            f,
            "Sensors: [{}] Gestures: [{}] Intervals: [{}]",
            sensors.join(", "),
            gestures.join(", "),
            intervals.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_flag() {
        let mut profile = AppIntentProfile::new();
        assert!(!profile.is_dirty());
        profile.add_sensor(SensorId::Gyroscope);
        assert!(profile.is_dirty());
        profile.mark_clean();
        profile.remove_sensor(SensorId::Gyroscope);
        assert!(profile.is_dirty());
    }

    #[test]
    fn test_supported_by_device() {
        let device = Device {
            uid: "u".into(),
            available_sensors: SensorFlags::GYROSCOPE | SensorFlags::ACCELEROMETER,
            available_gestures: GestureFlags::DOUBLE_TAP,
            ..Default::default()
        };
        let ok = AppIntentProfile::new()
            .with_sensor(SensorId::Gyroscope)
            .with_gesture(GestureId::DoubleTap);
        let missing = ok.clone().with_gesture(GestureId::HeadShake);
        assert!(ok.is_supported_by(&device));
        assert!(!missing.is_supported_by(&device));
    }

    #[test]
    fn test_violations_are_listed() {
        let profile = AppIntentProfile::new()
            .with_sensor(SensorId::Accelerometer)
            .with_interval(SensorUpdateInterval::EightyMs);
        let config = DeviceConfig::disabled()
            .with_sensor(SensorId::Accelerometer)
            .with_sensor(SensorId::Gyroscope)
            .with_gesture(GestureId::HeadNod)
            .with_interval(SensorUpdateInterval::FortyMs);

        let violations = profile.violations(&config);
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("Gyroscope"));
        assert!(violations[1].contains("HeadNod"));
        assert!(violations[2].contains("40ms"));
    }

    #[test]
    fn test_display() {
        let profile = AppIntentProfile::new()
            .with_sensor(SensorId::RotationSixDof)
            .with_interval(SensorUpdateInterval::TwentyMs);
        assert_eq!(
            profile.to_string(),
            "Sensors: [RotationSixDof] Gestures: [] Intervals: [20ms]"
        );
    }
}
