use crate::protocol::PacketType;
use std::fmt;

/// Errors that can occur in the wearable SDK core.
#[derive(Debug, thiserror::Error)]
pub enum WearableError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Incomplete packet: needed {needed} bytes, {available} available")]
    IncompletePacket { needed: usize, available: usize },

    #[error("Buffer too small: needed {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected to a proxy server")]
    NotConnectedToProxy,

    #[error("No device is currently connected")]
    DeviceNotConnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out waiting for a session event")]
    Timeout,

    #[error("The session event subscription was closed")]
    SubscriptionClosed,
}

impl WearableError {
    /// True when the stream is corrupt and the whole receive buffer must be discarded.
    pub fn is_protocol(&self) -> bool {
        matches!(self, WearableError::Protocol(_))
    }

    /// True when more bytes are needed before the packet can be decoded.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, WearableError::IncompletePacket { .. })
    }
}

/// Which end of the proxy link decoded a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRole {
    Client,
    Server,
}

impl fmt::Display for ProtocolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolRole::Client => f.write_str("client"),
            ProtocolRole::Server => f.write_str("server"),
        }
    }
}

/// Unrecoverable wire-level failures. The receive buffer is desynced.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("version mismatch: expected 0x{expected:02x}, found 0x{found:02x}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("packet {packet:?} is not valid for the {role}")]
    UnexpectedPacketType { packet: PacketType, role: ProtocolRole },

    #[error("bad packet terminator 0x{0:08x}")]
    BadTerminator(u32),

    #[error("invalid value {value} for field '{field}'")]
    InvalidField { field: &'static str, value: i64 },
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &WearableError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
