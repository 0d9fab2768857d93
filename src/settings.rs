use std::time::Duration;

// -- RSSI filter --
pub const DEFAULT_RSSI_THRESHOLD: i32 = -65;
pub const MINIMUM_RSSI_VALUE: i32 = -70;
pub const MAXIMUM_RSSI_VALUE: i32 = -30;

// -- Identity defaults --
pub const EMPTY_UID: &str = "00000000-0000-0000-0000-000000000000";
pub const DEFAULT_FIRMWARE_VERSION: &str = "0.0.0";
pub const DEBUG_DEVICE_NAME: &str = "Debug Device";

/// Clamp a requested RSSI filter into the range the radio stack accepts.
pub fn clamp_rssi(threshold: i32) -> i32 {
    threshold.clamp(MINIMUM_RSSI_VALUE, MAXIMUM_RSSI_VALUE)
}

/// Timing and threshold knobs shared by every transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// How often a running search reports discovered devices.
    pub search_poll_interval: Duration,
    /// How often a native connection attempt and the session monitor are polled.
    pub connect_poll_interval: Duration,
    /// Connection, search and monitor polling for the USB bridge.
    pub usb_connect_poll_interval: Duration,
    /// Dynamic device info polling for the USB bridge.
    pub usb_dynamic_info_interval: Duration,
    /// Minimum spacing between configuration writes.
    pub config_lock_window: Duration,
    pub auto_reconnect_timeout: Duration,
    /// Settle time between simulated connection phases.
    pub debug_phase_delay: Duration,
    /// Simulated latency of debug device responses.
    pub debug_response_delay: Duration,
    pub rssi_threshold: i32,
    pub proxy_network_timeout: Duration,
    pub proxy_keep_alive_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            search_poll_interval: Duration::from_millis(250),
            connect_poll_interval: Duration::from_secs(1),
            usb_connect_poll_interval: Duration::from_secs(2),
            usb_dynamic_info_interval: Duration::from_millis(125),
            config_lock_window: Duration::from_millis(330),
            auto_reconnect_timeout: Duration::from_secs(2),
            debug_phase_delay: Duration::from_millis(750),
            debug_response_delay: Duration::from_millis(500),
            rssi_threshold: DEFAULT_RSSI_THRESHOLD,
            proxy_network_timeout: Duration::from_secs(1),
            proxy_keep_alive_interval: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Defaults overlaid with any `WEARABLE_*` environment variables.
    ///
    /// Durations are given in milliseconds. Unparsable values keep the default.
    pub fn from_env() -> Settings {
        let d = Settings::default();
        Settings {
            search_poll_interval: read_env_millis("WEARABLE_SEARCH_POLL_MS", d.search_poll_interval),
            connect_poll_interval: read_env_millis("WEARABLE_CONNECT_POLL_MS", d.connect_poll_interval),
            usb_connect_poll_interval: read_env_millis(
                "WEARABLE_USB_CONNECT_POLL_MS",
                d.usb_connect_poll_interval,
            ),
            usb_dynamic_info_interval: read_env_millis(
                "WEARABLE_USB_DYNAMIC_INFO_MS",
                d.usb_dynamic_info_interval,
            ),
            config_lock_window: read_env_millis("WEARABLE_CONFIG_LOCK_MS", d.config_lock_window),
            auto_reconnect_timeout: read_env_millis(
                "WEARABLE_AUTO_RECONNECT_TIMEOUT_MS",
                d.auto_reconnect_timeout,
            ),
            debug_phase_delay: read_env_millis("WEARABLE_DEBUG_PHASE_DELAY_MS", d.debug_phase_delay),
            debug_response_delay: read_env_millis(
                "WEARABLE_DEBUG_RESPONSE_DELAY_MS",
                d.debug_response_delay,
            ),
            rssi_threshold: clamp_rssi(read_env_i32("WEARABLE_RSSI_THRESHOLD", d.rssi_threshold)),
            proxy_network_timeout: read_env_millis(
                "WEARABLE_PROXY_TIMEOUT_MS",
                d.proxy_network_timeout,
            ),
            proxy_keep_alive_interval: read_env_millis(
                "WEARABLE_PROXY_KEEP_ALIVE_MS",
                d.proxy_keep_alive_interval,
            ),
        }
    }
}

pub(crate) fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => {
                    log::warn!("Ignoring {}='{}' (expected a boolean)", name, v);
                    None
                }
            }
        })
        .unwrap_or(default)
}

fn read_env_i32(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().parse::<i32>() {
            Ok(n) => Some(n),
            Err(_) => {
                log::warn!("Ignoring {}='{}' (expected an integer)", name, v);
                None
            }
        })
        .unwrap_or(default)
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().parse::<u64>() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                log::warn!("Ignoring {}='{}' (expected milliseconds)", name, v);
                None
            }
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_rssi() {
        assert_eq!(clamp_rssi(-100), MINIMUM_RSSI_VALUE);
        assert_eq!(clamp_rssi(0), MAXIMUM_RSSI_VALUE);
        assert_eq!(clamp_rssi(-50), -50);
    }

    #[test]
    fn test_env_overlay() {
        std::env::set_var("WEARABLE_TEST_ONLY_MILLIS", "1500");
        std::env::set_var("WEARABLE_TEST_ONLY_BAD", "soon");
        std::env::set_var("WEARABLE_TEST_ONLY_BOOL", " Yes ");
        assert_eq!(
            read_env_millis("WEARABLE_TEST_ONLY_MILLIS", Duration::ZERO),
            Duration::from_millis(1500)
        );
        assert_eq!(
            read_env_millis("WEARABLE_TEST_ONLY_BAD", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        assert!(read_env_bool("WEARABLE_TEST_ONLY_BOOL", false));
        assert_eq!(read_env_i32("WEARABLE_TEST_ONLY_MISSING", -65), -65);
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.config_lock_window, Duration::from_millis(330));
        assert_eq!(s.rssi_threshold, -65);
        assert_eq!(s.search_poll_interval, Duration::from_millis(250));
    }
}
