//! Server side of the proxy: exposes a local transport to one remote client.
//!
//! The host owns any [`WearableProvider`] and ticks it. Client requests are
//! mapped onto transport calls, and the transport's status changes, frames,
//! device lists and configuration results are streamed back.

use crate::device_config::DeviceConfig;
use crate::protocol::{
    self, ProxyConnectionState, MAX_DEVICE_LIST_LEN, SERVER_TO_CLIENT_BUFFER_SIZE,
};
use crate::provider::{ConnectCallbacks, ProviderEvent, WearableProvider};
use crate::proxy::link::{ProxyLink, TcpLink};
use crate::proxy::server::{ServerEvents, ServerProtocol};
use crate::types::{ConnectionStatus, Device, GestureData, SensorFrame};
use crate::{Result, WearableError};
use crossbeam_channel::{Receiver, Sender};
use std::net::TcpListener;
use std::time::Instant;

pub struct ProxyHost {
    provider: Box<dyn WearableProvider>,
    link: Option<Box<dyn ProxyLink>>,

    receive_buffer: Vec<u8>,
    receive_index: usize,
    warned_last_packet: bool,

    outbox: Vec<u8>,
    outbox_len: usize,
    next_keep_alive: Option<Instant>,

    found_tx: Sender<Vec<Device>>,
    found_rx: Receiver<Vec<Device>>,
    config_tx: Sender<DeviceConfig>,
    config_rx: Receiver<DeviceConfig>,
    last_devices: Vec<Device>,
}

/// How a transport status is shown to proxy clients. Searching is not sent.
fn proxy_state(status: ConnectionStatus) -> Option<ProxyConnectionState> {
    match status {
        ConnectionStatus::Disconnected | ConnectionStatus::Cancelled => {
            Some(ProxyConnectionState::Disconnected)
        }
        ConnectionStatus::Searching => None,
        ConnectionStatus::Connecting
        | ConnectionStatus::AutoReconnect
        | ConnectionStatus::SecurePairingRequired
        | ConnectionStatus::FirmwareUpdateAvailable
        | ConnectionStatus::FirmwareUpdateRequired => Some(ProxyConnectionState::Connecting),
        ConnectionStatus::Connected => Some(ProxyConnectionState::Connected),
        ConnectionStatus::Failed => Some(ProxyConnectionState::Failed),
    }
}

/// Fold gestures into the frames of the same tick.
///
/// Each gesture takes the next frame that has none. Gestures left over ride
/// on a copy of the latest frame stamped with the gesture's time.
fn fold_gestures(
    frames: &[SensorFrame],
    gestures: &[GestureData],
    latest: Option<SensorFrame>,
) -> Vec<SensorFrame> {
    let mut out = frames.to_vec();
    let mut free = out.iter_mut().filter(|f| f.gesture_id.is_none());
    let mut extra = Vec::new();
    for gesture in gestures {
        match free.next() {
            Some(frame) => frame.gesture_id = Some(gesture.gesture_id),
            None => {
                let mut frame = latest.unwrap_or_default();
                frame.timestamp = gesture.timestamp;
                frame.gesture_id = Some(gesture.gesture_id);
                extra.push(frame);
            }
        }
    }
    out.extend(extra);
    out
}

impl ProxyHost {
    /// Take ownership of `provider`, initializing and enabling it if needed.
    pub fn new(mut provider: Box<dyn WearableProvider>) -> Self {
        if !provider.core().is_initialized() {
            provider.on_initialize();
        }
        if !provider.core().is_enabled() {
            provider.on_enable();
        }
        let (found_tx, found_rx) = crossbeam_channel::unbounded();
        let (config_tx, config_rx) = crossbeam_channel::unbounded();
        ProxyHost {
            provider,
            link: None,
            receive_buffer: vec![0; SERVER_TO_CLIENT_BUFFER_SIZE],
            receive_index: 0,
            warned_last_packet: false,
            outbox: vec![0; SERVER_TO_CLIENT_BUFFER_SIZE],
            outbox_len: 0,
            next_keep_alive: None,
            found_tx,
            found_rx,
            config_tx,
            config_rx,
            last_devices: Vec::new(),
        }
    }

    pub fn provider(&self) -> &dyn WearableProvider {
        self.provider.as_ref()
    }

    pub fn provider_mut(&mut self) -> &mut dyn WearableProvider {
        self.provider.as_mut()
    }

    pub fn has_client(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_connected())
    }

    /// Serve `link`, replacing any current client.
    pub fn attach_link(&mut self, link: Box<dyn ProxyLink>) {
        if let Some(mut old) = self.link.take() {
            log::info!("Replacing proxy client");
            old.close();
        }
        self.link = Some(link);
        self.receive_index = 0;
        self.outbox_len = 0;
        self.warned_last_packet = false;
        self.next_keep_alive = Some(self.provider.core().now());
    }

    /// Accept a pending connection from a non-blocking listener when no client is attached.
    pub fn accept_from(&mut self, listener: &TcpListener) -> Result<bool> {
        if self.has_client() {
            return Ok(false);
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                let timeout = self.provider.core().ctx().settings.proxy_network_timeout;
                self.attach_link(Box::new(TcpLink::from_stream(stream, timeout)?));
                log::info!("Proxy client connected from {}", addr);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn drop_client(&mut self, error: Option<WearableError>) {
        match error {
            Some(e) => log::warn!("Proxy client lost: {}", e),
            None => log::info!("Proxy client disconnected"),
        }
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.outbox_len = 0;
        self.next_keep_alive = None;
        if self.provider.core().is_searching() {
            self.provider.stop_searching_for_devices();
        }
    }

    /// Receive client requests, tick the transport, stream results back.
    pub fn update(&mut self) {
        self.receive();
        self.provider.update();
        self.forward_transport_state();
        self.send_keep_alive_if_due();
        self.flush();
    }

    fn receive(&mut self) {
        loop {
            if self.receive_index >= self.receive_buffer.len() {
                log::warn!("Proxy host receive buffer full; dumping {} bytes", self.receive_index);
                self.receive_index = 0;
            }
            let Some(link) = self.link.as_mut() else {
                return;
            };
            match link.receive(&mut self.receive_buffer[self.receive_index..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.receive_index += n;
                    self.process_receive_buffer();
                }
                Err(e) => {
                    self.drop_client(Some(e));
                    return;
                }
            }
        }
        if self.link.is_some() && !self.has_client() {
            self.drop_client(None);
        }
    }

    fn process_receive_buffer(&mut self) {
        let buffer = std::mem::take(&mut self.receive_buffer);
        let end = self.receive_index;
        let mut cursor = 0;
        let mut keep_from = end;

        while cursor < end {
            let start = cursor;
            match ServerProtocol::process_packet(&buffer[..end], &mut cursor, self) {
                Ok(()) => self.warned_last_packet = false,
                Err(e) if e.is_incomplete() => {
                    keep_from = start;
                    break;
                }
                Err(e) => {
                    if !self.warned_last_packet {
                        log::warn!("Discarding proxy host receive buffer: {}", e);
                        self.warned_last_packet = true;
                    }
                    keep_from = end;
                    break;
                }
            }
        }

        self.receive_buffer = buffer;
        self.receive_buffer.copy_within(keep_from..end, 0);
        self.receive_index = end - keep_from;
    }

    fn forward_transport_state(&mut self) {
        let lists: Vec<Vec<Device>> = self.found_rx.try_iter().collect();
        for devices in lists {
            self.queue_device_list(devices);
        }

        let frames = fold_gestures(
            self.provider.current_sensor_frames(),
            self.provider.current_gesture_data(),
            self.provider.last_sensor_frame(),
        );

        for event in self.provider.drain_events() {
            match event {
                ProviderEvent::ConnectionStatusChanged { status, device } => {
                    if let Some(state) = proxy_state(status) {
                        self.queue_connection_status(state, device);
                    }
                }
                ProviderEvent::ConfigurationSucceeded | ProviderEvent::ConfigurationFailed { .. } => {
                    let config = self.provider.cached_device_configuration();
                    self.queue(|b, i| ServerProtocol::encode_config_status(b, i, &config));
                }
                _ => {}
            }
        }

        for frame in frames {
            self.queue(|b, i| ServerProtocol::encode_sensor_frame(b, i, &frame));
        }

        let configs: Vec<DeviceConfig> = self.config_rx.try_iter().collect();
        for config in configs {
            self.queue(|b, i| ServerProtocol::encode_config_status(b, i, &config));
        }
    }

    fn queue_device_list(&mut self, mut devices: Vec<Device>) {
        if devices.len() > MAX_DEVICE_LIST_LEN {
            log::warn!(
                "Device list of {} entries truncated to {}",
                devices.len(),
                MAX_DEVICE_LIST_LEN
            );
            devices.truncate(MAX_DEVICE_LIST_LEN);
        }
        self.queue(|b, i| ServerProtocol::encode_device_list(b, i, &devices));
        self.last_devices = devices;
    }

    fn queue_connection_status(&mut self, state: ProxyConnectionState, device: Option<Device>) {
        self.queue(|b, i| ServerProtocol::encode_connection_status(b, i, state, device.as_ref()));
    }

    fn send_keep_alive_if_due(&mut self) {
        let now = self.provider.core().now();
        let Some(due) = self.next_keep_alive.filter(|t| now >= *t) else {
            return;
        };
        self.next_keep_alive = Some(due + self.provider.core().ctx().settings.proxy_keep_alive_interval);
        self.queue(protocol::encode_keep_alive);
    }

    /// Append a packet to the outbox, flushing first if it does not fit.
    fn queue(&mut self, encode: impl Fn(&mut [u8], &mut usize) -> Result<()>) {
        if self.link.is_none() {
            return;
        }
        match encode(&mut self.outbox[..], &mut self.outbox_len) {
            Ok(()) => {}
            Err(WearableError::BufferTooSmall { .. }) => {
                self.flush();
                if let Err(e) = encode(&mut self.outbox[..], &mut self.outbox_len) {
                    log::warn!("Dropping proxy packet: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to encode proxy packet: {}", e),
        }
    }

    fn flush(&mut self) {
        let len = std::mem::take(&mut self.outbox_len);
        if len == 0 {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.send(&self.outbox[..len]) {
            self.drop_client(Some(e));
        }
    }

    /// Drop the client and shut the transport down.
    pub fn shutdown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.provider.disconnect_from_device();
        self.provider.on_disable();
        self.provider.on_destroy();
    }
}

impl ServerEvents for ProxyHost {
    fn on_ping_query(&mut self) {
        self.queue(protocol::encode_ping_response);
    }

    fn on_set_rssi_filter(&mut self, threshold: i32) {
        log::debug!("Client set RSSI filter to {}", threshold);
        self.provider.core_mut().set_rssi_threshold(threshold);
    }

    fn on_initiate_device_search(&mut self) {
        let found = self.found_tx.clone();
        self.provider.search_for_devices(
            None,
            Box::new(move |devices: &[Device]| {
                let _ = found.send(devices.to_vec());
            }),
            false,
        );
    }

    fn on_stop_device_search(&mut self) {
        self.provider.stop_searching_for_devices();
    }

    fn on_connect_to_device(&mut self, uid: String) {
        let device = self
            .last_devices
            .iter()
            .find(|d| d.uid == uid)
            .cloned()
            .unwrap_or(Device { uid, ..Default::default() });
        log::info!("Client requested connection to {}", device);
        self.provider.connect_to_device(device, ConnectCallbacks::new());
    }

    fn on_disconnect_from_device(&mut self) {
        self.provider.disconnect_from_device();
    }

    fn on_query_connection_status(&mut self) {
        let state = proxy_state(self.provider.connection_status())
            .unwrap_or(ProxyConnectionState::Disconnected);
        let device = self.provider.connected_device().cloned();
        self.queue_connection_status(state, device);
    }

    fn on_set_new_config(&mut self, config: DeviceConfig) {
        self.provider.set_device_configuration(&config);
    }

    fn on_query_config(&mut self) {
        if !self.provider.core().is_connected() {
            let config = self.provider.cached_device_configuration();
            self.queue(|b, i| ServerProtocol::encode_config_status(b, i, &config));
            return;
        }
        let reply = self.config_tx.clone();
        self.provider.request_device_configuration(Box::new(move |config: &DeviceConfig| {
            let _ = reply.send(config.clone());
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, WearableContext};
    use crate::debug::{DebugDeviceSettings, DebugProvider};
    use crate::proxy::client::ClientProtocol;
    use crate::proxy::link::MemoryLink;
    use crate::proxy::provider::ProxyProvider;
    use crate::types::{GestureId, SensorId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Rig {
        clock: Arc<ManualClock>,
        host: ProxyHost,
        client: ProxyProvider,
    }

    impl Rig {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let debug = DebugProvider::with_settings(
                WearableContext::manual(clock.clone()),
                DebugDeviceSettings {
                    uid: "debug-uid".into(),
                    ..DebugDeviceSettings::default()
                },
            );
            let mut host = ProxyHost::new(Box::new(debug));
            let mut client = ProxyProvider::new(WearableContext::manual(clock.clone()));
            client.on_initialize();
            client.on_enable();

            let (a, b) = MemoryLink::pair();
            host.attach_link(Box::new(a));
            client.attach_link(Box::new(b));
            Rig { clock, host, client }
        }

        fn tick(&mut self, by: Duration) {
            self.clock.advance(by);
            self.host.update();
            self.client.update();
        }
    }

    #[test]
    fn test_fold_gestures() {
        let frames = [
            SensorFrame { timestamp: 1.0, ..Default::default() },
            SensorFrame { timestamp: 2.0, gesture_id: Some(GestureId::HeadNod), ..Default::default() },
        ];
        let gestures = [
            GestureData { timestamp: 1.0, gesture_id: GestureId::DoubleTap },
            GestureData { timestamp: 2.5, gesture_id: GestureId::HeadShake },
        ];
        let out = fold_gestures(&frames, &gestures, Some(frames[1]));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].gesture_id, Some(GestureId::DoubleTap));
        assert_eq!(out[1].gesture_id, Some(GestureId::HeadNod));
        assert_eq!(out[2].gesture_id, Some(GestureId::HeadShake));
        assert_eq!(out[2].timestamp, 2.5);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(proxy_state(ConnectionStatus::Searching), None);
        assert_eq!(
            proxy_state(ConnectionStatus::SecurePairingRequired),
            Some(ProxyConnectionState::Connecting)
        );
        assert_eq!(
            proxy_state(ConnectionStatus::Cancelled),
            Some(ProxyConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_end_to_end_over_memory_link() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut rig = Rig::new();

        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        rig.client.search_for_devices(
            None,
            Box::new(move |devices| sink.lock().unwrap().extend(devices.iter().map(|d| d.uid.clone()))),
            false,
        );
        rig.tick(Duration::from_millis(10));
        rig.tick(Duration::from_millis(10));
        assert!(found.lock().unwrap().contains(&"debug-uid".to_string()));
        assert!(rig.host.provider().core().is_searching());

        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        rig.client.connect_to_device(
            Device { uid: "debug-uid".into(), ..Default::default() },
            ConnectCallbacks::new().on_success(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        for _ in 0..40 {
            rig.tick(Duration::from_millis(250));
            if rig.client.connection_status() == ConnectionStatus::Connected {
                break;
            }
        }
        assert_eq!(rig.client.connection_status(), ConnectionStatus::Connected);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(rig.client.connected_device().map(|d| d.uid.as_str()), Some("debug-uid"));
        rig.client.drain_events();

        let config = DeviceConfig::disabled().with_sensor(SensorId::Accelerometer);
        rig.client.set_device_configuration(&config);
        let mut frames = 0;
        for _ in 0..20 {
            rig.tick(Duration::from_millis(100));
            frames += rig.client.current_sensor_frames().len();
        }
        assert!(frames > 0);
        assert_eq!(rig.client.cached_device_configuration(), config);

        rig.client.disconnect_from_device();
        rig.tick(Duration::from_millis(10));
        assert!(!rig.host.provider().core().is_connected());
    }

    #[test]
    fn test_ping_and_keep_alive() {
        let clock = Arc::new(ManualClock::new());
        let mut host = ProxyHost::new(Box::new(DebugProvider::new(WearableContext::manual(clock.clone()))));
        let (a, mut b) = MemoryLink::pair();
        host.attach_link(Box::new(a));

        let mut buf = [0u8; 16];
        let mut len = 0;
        protocol::encode_ping_query(&mut buf, &mut len).unwrap();
        b.send(&buf[..len]).unwrap();
        host.update();

        let mut incoming = [0u8; 64];
        let n = b.receive(&mut incoming).unwrap();
        let mut cursor = 0;
        let mut packets = Vec::new();
        while cursor < n {
            packets.push(ClientProtocol::decode_packet(&incoming[..n], &mut cursor).unwrap());
        }
        use crate::proxy::client::ServerPacket;
        assert_eq!(packets, vec![ServerPacket::PingResponse, ServerPacket::KeepAlive]);

        host.update();
        assert_eq!(b.receive(&mut incoming).unwrap(), 0);
        clock.advance(Duration::from_secs(1));
        host.update();
        assert_eq!(b.receive(&mut incoming).unwrap(), 6);
    }

    #[test]
    fn test_client_hangup_stops_search() {
        let clock = Arc::new(ManualClock::new());
        let mut host = ProxyHost::new(Box::new(DebugProvider::new(WearableContext::manual(clock))));
        let (a, mut b) = MemoryLink::pair();
        host.attach_link(Box::new(a));

        let mut buf = [0u8; 16];
        let mut len = 0;
        ClientProtocol::encode_initiate_device_search(&mut buf, &mut len).unwrap();
        b.send(&buf[..len]).unwrap();
        host.update();
        assert!(host.provider().core().is_searching());

        b.close();
        host.update();
        assert!(!host.has_client());
        assert!(!host.provider().core().is_searching());
    }
}
