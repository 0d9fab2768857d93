//! # wearable - Rust SDK core for head-worn sensor wearables
//!
//! Transport-independent session logic for audio wearables that stream motion
//! sensors and detect head gestures. Provides:
//! - A tick-driven [`WearableSession`] publishing connection, sensor and gesture events
//! - Configuration resolution across many independent requirements, with debounced writes
//! - Transports: a simulated debug device, native/USB platform bridges, and a network proxy
//! - The byte-exact proxy wire protocol, plus a [`ProxyHost`] serving a device remotely
//! - C FFI for integration with C/C++/Unity hosts
//!
//! ## Quick Start
//! ```no_run
//! use wearable::{
//!     ConnectCallbacks, DebugProvider, DeviceConfig, SensorId, SessionEvent, WearableContext,
//!     WearableSession,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! let ctx = WearableContext::system();
//! let mut session = WearableSession::new(ctx.clone(), Box::new(DebugProvider::new(ctx)));
//! let events = session.subscribe();
//! session.register_requirement(DeviceConfig::disabled().with_sensor(SensorId::RotationSixDof));
//!
//! let found = Arc::new(Mutex::new(Vec::new()));
//! let sink = found.clone();
//! session.search_for_devices(move |devices| sink.lock().unwrap().extend_from_slice(devices), false);
//!
//! loop {
//!     session.update();
//!     let device = found.lock().unwrap().first().cloned();
//!     if let Some(device) = device {
//!         session.connect_to_device(device, ConnectCallbacks::new());
//!         found.lock().unwrap().clear();
//!     }
//!     for event in events.drain() {
//!         if let SessionEvent::SensorsUpdated(frame) = event {
//!             println!("rotation: {:?}", frame.rotation_six_dof.value);
//!         }
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! ```

pub mod error;
pub mod types;
pub mod device_config;
pub mod intent;
pub mod settings;
pub mod context;
pub mod protocol;
pub mod provider;
pub mod debug;
pub mod device;
pub mod proxy;
pub mod resolver;
pub mod hub;
pub mod ffi;

pub use context::{Clock, DeviceMemory, ManualClock, SystemClock, WearableContext};
pub use debug::{DebugDeviceSettings, DebugProvider};
pub use device::{DeviceProvider, PlatformBridge, UnsupportedPlatform};
pub use device_config::DeviceConfig;
pub use error::{ProtocolError, WearableError};
pub use hub::{IntentValidationStatus, SessionEvent, Subscription, WearableSession};
pub use intent::AppIntentProfile;
pub use provider::{ConnectCallbacks, ProviderEvent, WearableProvider};
pub use proxy::{ProxyHost, ProxyProvider};
pub use resolver::{DeviceConfigResolver, RequirementId};
pub use settings::Settings;
pub use types::*;

/// Result type alias for wearable operations.
pub type Result<T> = std::result::Result<T, WearableError>;
