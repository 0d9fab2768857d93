//! Serve the simulated debug device to a remote proxy client over TCP.
//!
//! Usage: cargo run --example proxy_server [port]
//! Press Ctrl+C to stop.

use std::net::TcpListener;
use std::time::Duration;
use wearable::{DebugProvider, ProxyHost, WearableContext};

const DEFAULT_PORT: u16 = 35353;
const TICK: Duration = Duration::from_millis(10);

fn main() {
    env_logger::init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let listener = TcpListener::bind(("0.0.0.0", port)).unwrap_or_else(|e| {
        eprintln!("Failed to bind port {}: {}", port, e);
        std::process::exit(1);
    });
    if let Err(e) = listener.set_nonblocking(true) {
        eprintln!("Failed to make the listener non-blocking: {}", e);
        std::process::exit(1);
    }

    let ctx = WearableContext::system();
    let mut host = ProxyHost::new(Box::new(DebugProvider::new(ctx)));
    println!("Proxy host listening on port {}", port);

    loop {
        match host.accept_from(&listener) {
            Ok(true) => println!("Client attached"),
            Ok(false) => {}
            Err(e) => eprintln!("[TCP] accept error: {}", e),
        }
        host.update();
        std::thread::sleep(TICK);
    }
}
