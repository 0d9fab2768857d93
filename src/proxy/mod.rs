//! Network proxy: drive a device attached to another machine.
//!
//! [`host::ProxyHost`] runs next to the device and serves one client over a
//! [`link::ProxyLink`]. [`provider::ProxyProvider`] is the client-side transport.

pub mod client;
pub mod host;
pub mod link;
pub mod provider;
pub mod server;

pub use client::{ClientEvents, ClientProtocol, ServerPacket};
pub use host::ProxyHost;
pub use link::{MemoryLink, ProxyLink, TcpLink};
pub use provider::ProxyProvider;
pub use server::{ClientPacket, ServerEvents, ServerProtocol};
