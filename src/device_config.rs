use crate::types::{
    Device, GestureFlags, GestureId, SensorFlags, SensorId, SensorUpdateInterval,
};
use std::fmt;

/// Desired sensor and gesture activation state of a device.
///
/// Value type: cloning is a deep copy, equality compares every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceConfig {
    pub update_interval: SensorUpdateInterval,
    sensors: [bool; 4],
    gestures: [bool; 7],
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            update_interval: SensorUpdateInterval::default(),
            sensors: [false; 4],
            gestures: [false; 7],
        }
    }
}

impl DeviceConfig {
    /// Canonical "everything off" configuration at the slowest rate.
    pub fn disabled() -> DeviceConfig {
        DeviceConfig {
            update_interval: SensorUpdateInterval::SLOWEST,
            ..DeviceConfig::default()
        }
    }

    pub fn with_sensor(mut self, sensor: SensorId) -> Self {
        self.set_sensor(sensor, true);
        self
    }

    pub fn with_gesture(mut self, gesture: GestureId) -> Self {
        self.set_gesture(gesture, true);
        self
    }

    pub fn with_interval(mut self, interval: SensorUpdateInterval) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn sensor_enabled(&self, sensor: SensorId) -> bool {
        self.sensors[sensor.index()]
    }

    pub fn set_sensor(&mut self, sensor: SensorId, enabled: bool) {
        self.sensors[sensor.index()] = enabled;
    }

    pub fn gesture_enabled(&self, gesture: GestureId) -> bool {
        self.gestures[gesture.index()]
    }

    pub fn set_gesture(&mut self, gesture: GestureId, enabled: bool) {
        self.gestures[gesture.index()] = enabled;
    }

    pub fn disable_all_sensors(&mut self) {
        self.sensors = [false; 4];
    }

    pub fn disable_all_gestures(&mut self) {
        self.gestures = [false; 7];
    }

    pub fn enabled_sensors(&self) -> SensorFlags {
        SensorId::ALL
            .into_iter()
            .filter(|s| self.sensor_enabled(*s))
            .fold(SensorFlags::empty(), |acc, s| acc | s.flag())
    }

    pub fn enabled_gestures(&self) -> GestureFlags {
        GestureId::ALL
            .into_iter()
            .filter(|g| self.gesture_enabled(*g))
            .fold(GestureFlags::empty(), |acc, g| acc | g.flag())
    }

    pub fn enabled_sensor_count(&self) -> usize {
        self.sensors.iter().filter(|e| **e).count()
    }

    pub fn has_any_sensors_enabled(&self) -> bool {
        self.sensors.iter().any(|e| *e)
    }

    pub fn has_any_gestures_enabled(&self) -> bool {
        self.gestures.iter().any(|e| *e)
    }

    /// The device cannot stream three or more sensors at the fastest rate.
    pub fn has_three_or_more_sensors_enabled(&self) -> bool {
        self.enabled_sensor_count() >= 3
    }

    /// ORs every enable flag of `other` into this config. The interval is untouched.
    pub fn merge_enables(&mut self, other: &DeviceConfig) {
        for (mine, theirs) in self.sensors.iter_mut().zip(other.sensors) {
            *mine |= theirs;
        }
        for (mine, theirs) in self.gestures.iter_mut().zip(other.gestures) {
            *mine |= theirs;
        }
    }

    /// Clears everything the device does not support, returning what was removed.
    pub fn restrict_to(&mut self, device: &Device) -> (Vec<SensorId>, Vec<GestureId>) {
        let mut sensors = Vec::new();
        let mut gestures = Vec::new();
        for sensor in SensorId::ALL {
            if self.sensor_enabled(sensor) && !device.is_sensor_available(sensor) {
                self.set_sensor(sensor, false);
                sensors.push(sensor);
            }
        }
        for gesture in GestureId::ALL {
            if self.gesture_enabled(gesture) && !device.is_gesture_available(gesture) {
                self.set_gesture(gesture, false);
                gestures.push(gesture);
            }
        }
        (sensors, gestures)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interval={}ms sensors={:?} gestures={:?}",
            self.update_interval.millis(),
            self.enabled_sensors(),
            self.enabled_gestures()
        )
    }
}
