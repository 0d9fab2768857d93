//! C FFI layer for the wearable session.
//!
//! Provides an opaque handle-based API for native and game-engine hosts.
//! The generated C header is written to `include/wearable.h` by cbindgen.

use crate::context::WearableContext;
use crate::debug::DebugProvider;
use crate::device_config::DeviceConfig;
use crate::error::LastError;
use crate::hub::WearableSession;
use crate::provider::ConnectCallbacks;
use crate::proxy::ProxyProvider;
use crate::resolver::RequirementId;
use crate::types::{
    AlertStyle, ConnectionStatus, Device, GestureFlags, SensorFlags, SensorUpdateInterval,
};
use crate::WearableError;
use std::ffi::{c_char, c_int, CStr};
use std::sync::{Arc, Mutex};

static LAST_ERROR: LastError = LastError::new();

/// Opaque session handle for C consumers.
pub struct WrSession {
    session: WearableSession,
    devices: Arc<Mutex<Vec<Device>>>,
    requirement: Option<RequirementId>,
}

impl WrSession {
    fn new(session: WearableSession) -> *mut WrSession {
        Box::into_raw(Box::new(WrSession {
            session,
            devices: Arc::new(Mutex::new(Vec::new())),
            requirement: None,
        }))
    }

    fn device_at(&self, index: c_int) -> Option<Device> {
        let index = usize::try_from(index).ok()?;
        let devices = self.devices.lock().ok()?;
        devices.get(index).cloned()
    }
}

/// Discovered device in C-compatible layout.
#[repr(C)]
pub struct WrDeviceInfo {
    /// Null-terminated uid.
    pub uid: [c_char; 37],
    /// Null-terminated display name.
    pub name: [c_char; 33],
    /// Null-terminated firmware version.
    pub firmware_version: [c_char; 17],
    pub rssi: i32,
    pub product_id: u16,
    pub variant_id: u8,
    /// Sensor availability bitmap.
    pub available_sensors: u32,
    /// Gesture availability bitmap.
    pub available_gestures: u32,
}

/// Sensor frame in C-compatible layout.
#[repr(C)]
pub struct WrSensorFrame {
    /// Seconds since the stream started.
    pub timestamp: f32,
    pub delta_time: f32,
    /// [x, y, z] in m/s².
    pub acceleration: [f32; 3],
    /// [x, y, z] in rad/s.
    pub angular_velocity: [f32; 3],
    /// Quaternion [x, y, z, w].
    pub rotation_nine_dof: [f32; 4],
    /// Quaternion [x, y, z, w].
    pub rotation_six_dof: [f32; 4],
    /// Gesture wire id, 0 for none.
    pub gesture: u8,
}

fn str_to_fixed<const N: usize>(s: &str) -> [c_char; N] {
    let mut buf = [0 as c_char; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as c_char;
    }
    buf
}

fn device_info(device: &Device) -> WrDeviceInfo {
    WrDeviceInfo {
        uid: str_to_fixed(&device.uid),
        name: str_to_fixed(&device.name),
        firmware_version: str_to_fixed(&device.firmware_version),
        rssi: device.rssi,
        product_id: device.product_id.0,
        variant_id: device.variant_id,
        available_sensors: device.available_sensors.bits(),
        available_gestures: device.available_gestures.bits(),
    }
}

fn requirement_config(sensors: u32, gestures: u32, interval_ms: u32) -> DeviceConfig {
    let mut config =
        DeviceConfig::disabled().with_interval(SensorUpdateInterval::closest_to_millis(interval_ms));
    for sensor in SensorFlags::from_bits_truncate(sensors).sensors() {
        config.set_sensor(sensor, true);
    }
    for gesture in GestureFlags::from_bits_truncate(gestures).gestures() {
        config.set_gesture(gesture, true);
    }
    config
}

/// Create a session driving the simulated debug device.
#[no_mangle]
pub extern "C" fn wr_session_new_debug() -> *mut WrSession {
    let ctx = WearableContext::system();
    let provider = DebugProvider::new(ctx.clone());
    WrSession::new(WearableSession::new(ctx, Box::new(provider)))
}

/// Create a session connected to a proxy host.
/// Returns NULL on error (check wr_last_error()).
///
/// # Safety
/// `host` must be a valid null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_session_new_proxy(host: *const c_char, port: u16) -> *mut WrSession {
    if host.is_null() {
        LAST_ERROR.set(&WearableError::InvalidArgument("host is null".into()));
        return std::ptr::null_mut();
    }
    let host = CStr::from_ptr(host).to_string_lossy();

    let ctx = WearableContext::system();
    let mut provider = ProxyProvider::new(ctx.clone());
    if let Err(e) = provider.connect_tcp(&host, port) {
        LAST_ERROR.set(&e);
        return std::ptr::null_mut();
    }
    LAST_ERROR.clear();
    WrSession::new(WearableSession::new(ctx, Box::new(provider)))
}

/// Shut the session down and free it.
///
/// # Safety
/// `s` must be a pointer returned by a `wr_session_new_*` function, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_session_free(s: *mut WrSession) {
    if !s.is_null() {
        drop(Box::from_raw(s));
    }
}

/// Advance the session by one tick. Call once per frame.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_session_update(s: *mut WrSession) {
    if let Some(s) = s.as_mut() {
        s.session.update();
    }
}

/// Start searching. The device list snapshot is replaced on every result.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_search(s: *mut WrSession, auto_reconnect: bool) {
    let Some(s) = s.as_mut() else {
        return;
    };
    if let Ok(mut devices) = s.devices.lock() {
        devices.clear();
    }
    let sink = s.devices.clone();
    s.session.search_for_devices(
        move |found: &[Device]| {
            if let Ok(mut devices) = sink.lock() {
                devices.clear();
                devices.extend_from_slice(found);
            }
        },
        auto_reconnect,
    );
}

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_stop_search(s: *mut WrSession) {
    if let Some(s) = s.as_mut() {
        s.session.stop_searching_for_devices();
    }
}

/// Number of devices in the latest search result.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_device_count(s: *const WrSession) -> c_int {
    let Some(s) = s.as_ref() else {
        return 0;
    };
    s.devices.lock().map(|d| d.len() as c_int).unwrap_or(0)
}

/// Copy the device at `index` of the latest search result into `out`.
/// Returns 0 on success, -1 if the index is out of range.
///
/// # Safety
/// `s` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_device_at(
    s: *const WrSession,
    index: c_int,
    out: *mut WrDeviceInfo,
) -> c_int {
    if out.is_null() {
        return -1;
    }
    let Some(device) = s.as_ref().and_then(|s| s.device_at(index)) else {
        return -1;
    };
    out.write(device_info(&device));
    0
}

/// Connect to the device at `index` of the latest search result.
/// Returns 0 if the attempt started, -1 otherwise.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_connect(s: *mut WrSession, index: c_int) -> c_int {
    let Some(s) = s.as_mut() else {
        return -1;
    };
    match s.device_at(index) {
        Some(device) => {
            s.session.connect_to_device(device, ConnectCallbacks::new());
            LAST_ERROR.clear();
            0
        }
        None => {
            LAST_ERROR.set(&WearableError::InvalidArgument(format!(
                "no device at index {}",
                index
            )));
            -1
        }
    }
}

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_cancel_connection(s: *mut WrSession) {
    if let Some(s) = s.as_mut() {
        s.session.cancel_device_connection();
    }
}

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_disconnect(s: *mut WrSession) {
    if let Some(s) = s.as_mut() {
        s.session.disconnect_from_device();
    }
}

/// Answer a firmware update prompt: `accept` picks the affirmative option.
/// Returns 0 on success, -1 if no option of that kind is offered.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_select_firmware_option(s: *mut WrSession, accept: bool) -> c_int {
    let Some(s) = s.as_mut() else {
        return -1;
    };
    let style = if accept {
        AlertStyle::Affirmative
    } else {
        AlertStyle::Negative
    };
    let info = s.session.firmware_update_information();
    match info.options.iter().find(|o| o.style == style) {
        Some(option) => {
            s.session.select_firmware_update_option(option);
            0
        }
        None => -1,
    }
}

/// Current connection status as its numeric value.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_connection_status(s: *const WrSession) -> c_int {
    match s.as_ref() {
        Some(s) => s.session.connection_status() as c_int,
        None => ConnectionStatus::Disconnected as c_int,
    }
}

/// Copy the most recent sensor frame into `out`.
/// Returns 0 on success, -1 if no frame has arrived yet.
///
/// # Safety
/// `s` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_last_sensor_frame(s: *const WrSession, out: *mut WrSensorFrame) -> c_int {
    if out.is_null() {
        return -1;
    }
    let Some(frame) = s.as_ref().and_then(|s| s.session.last_sensor_frame()) else {
        return -1;
    };
    let q9 = frame.rotation_nine_dof.value;
    let q6 = frame.rotation_six_dof.value;
    let a = frame.acceleration.value;
    let w = frame.angular_velocity.value;
    out.write(WrSensorFrame {
        timestamp: frame.timestamp,
        delta_time: frame.delta_time,
        acceleration: [a.x, a.y, a.z],
        angular_velocity: [w.x, w.y, w.z],
        rotation_nine_dof: [q9.x, q9.y, q9.z, q9.w],
        rotation_six_dof: [q6.x, q6.y, q6.z, q6.w],
        gesture: crate::types::GestureId::to_wire(frame.gesture_id),
    });
    0
}

/// Set this handle's configuration requirement.
/// `sensors` and `gestures` are availability-style bitmaps; the interval is
/// rounded to the nearest supported one.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn wr_set_requirement(
    s: *mut WrSession,
    sensors: u32,
    gestures: u32,
    interval_ms: u32,
) {
    let Some(s) = s.as_mut() else {
        return;
    };
    let config = requirement_config(sensors, gestures, interval_ms);
    match s.requirement {
        Some(id) => {
            s.session.update_requirement(id, config);
        }
        None => s.requirement = Some(s.session.register_requirement(config)),
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next wearable API call.
#[no_mangle]
pub extern "C" fn wr_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GestureId, SensorId};

    #[test]
    fn test_null_handles_are_ignored() {
        unsafe {
            wr_session_update(std::ptr::null_mut());
            wr_search(std::ptr::null_mut(), false);
            assert_eq!(wr_device_count(std::ptr::null()), 0);
            assert_eq!(wr_connect(std::ptr::null_mut(), 0), -1);
            assert_eq!(
                wr_connection_status(std::ptr::null()),
                ConnectionStatus::Disconnected as c_int
            );
            assert!(wr_session_new_proxy(std::ptr::null(), 0).is_null());
            assert!(!wr_last_error().is_null());
        }
    }

    #[test]
    fn test_requirement_config_from_bitmaps() {
        let config = requirement_config(
            SensorFlags::GYROSCOPE.bits(),
            GestureFlags::DOUBLE_TAP.bits(),
            45,
        );
        assert!(config.sensor_enabled(SensorId::Gyroscope));
        assert!(!config.sensor_enabled(SensorId::Accelerometer));
        assert!(config.gesture_enabled(GestureId::DoubleTap));
        assert_eq!(config.update_interval, SensorUpdateInterval::FortyMs);
    }

    #[test]
    fn test_debug_session_device_list() {
        unsafe {
            let s = wr_session_new_debug();
            assert!(!s.is_null());
            wr_search(s, false);
            wr_session_update(s);
            assert_eq!(wr_device_count(s), 1);

            let mut info = std::mem::MaybeUninit::<WrDeviceInfo>::uninit();
            assert_eq!(wr_device_at(s, 0, info.as_mut_ptr()), 0);
            let info = info.assume_init();
            assert_eq!(info.available_sensors, SensorFlags::all().bits());
            assert_eq!(wr_device_at(s, 1, std::ptr::null_mut()), -1);
            assert_eq!(wr_connect(s, 5), -1);
            assert_eq!(wr_connect(s, 0), 0);
            wr_session_update(s);
            assert_eq!(wr_connection_status(s), ConnectionStatus::Connecting as c_int);
            wr_session_free(s);
        }
    }
}
