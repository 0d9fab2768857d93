//! Shared services handed to every transport, the resolver and the session.

use crate::settings::Settings;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source. Every timer in the crate reads time through this.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed `Clock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Used for simulation and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Remembers the uid of the last device a session connected to.
pub trait DeviceMemory: Send + Sync {
    fn last_connected_uid(&self) -> Option<String>;
    fn remember_connected_uid(&self, uid: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryDeviceMemory {
    uid: Mutex<Option<String>>,
}

impl DeviceMemory for InMemoryDeviceMemory {
    fn last_connected_uid(&self) -> Option<String> {
        self.uid.lock().ok().and_then(|uid| uid.clone())
    }

    fn remember_connected_uid(&self, uid: &str) {
        if let Ok(mut slot) = self.uid.lock() {
            *slot = Some(uid.to_string());
        }
    }
}

/// Stores the uid as a single line of text.
#[derive(Debug, Clone)]
pub struct FileDeviceMemory {
    path: PathBuf,
}

impl FileDeviceMemory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileDeviceMemory { path: path.into() }
    }
}

impl DeviceMemory for FileDeviceMemory {
    fn last_connected_uid(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn remember_connected_uid(&self, uid: &str) {
        if let Err(e) = std::fs::write(&self.path, uid) {
            log::warn!("Failed to persist last device uid to {}: {}", self.path.display(), e);
        }
    }
}

/// Constructed once at startup and cloned into each component.
#[derive(Clone)]
pub struct WearableContext {
    pub clock: Arc<dyn Clock>,
    pub memory: Arc<dyn DeviceMemory>,
    pub settings: Settings,
}

impl WearableContext {
    pub fn new(clock: Arc<dyn Clock>, memory: Arc<dyn DeviceMemory>, settings: Settings) -> Self {
        WearableContext { clock, memory, settings }
    }

    /// System clock, volatile device memory, settings from the environment.
    pub fn system() -> Self {
        WearableContext::new(
            Arc::new(SystemClock),
            Arc::new(InMemoryDeviceMemory::default()),
            Settings::from_env(),
        )
    }

    /// A context driven by `clock`, with default settings and volatile memory.
    pub fn manual(clock: Arc<ManualClock>) -> Self {
        WearableContext::new(
            clock,
            Arc::new(InMemoryDeviceMemory::default()),
            Settings::default(),
        )
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }
}

impl std::fmt::Debug for WearableContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WearableContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
