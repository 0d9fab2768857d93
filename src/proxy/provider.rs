//! The network transport: drives a device owned by a remote proxy host.

use crate::context::WearableContext;
use crate::device_config::DeviceConfig;
use crate::intent::AppIntentProfile;
use crate::protocol::{
    self, ProxyConnectionState, CLIENT_TO_SERVER_BUFFER_SIZE, SERVER_TO_CLIENT_BUFFER_SIZE,
};
use crate::provider::{
    ConnectCallbacks, ProviderCore, ProviderEvent, SearchCallback, WearableProvider,
};
use crate::proxy::client::{ClientEvents, ClientProtocol};
use crate::proxy::link::{ProxyLink, TcpLink};
use crate::settings::clamp_rssi;
use crate::types::{
    ConnectionStatus, Device, DynamicDeviceInfo, GestureData, ProviderId, SensorFrame,
};
use crate::{Result, WearableError};

pub struct ProxyProvider {
    core: ProviderCore,
    link: Option<Box<dyn ProxyLink>>,
    /// Host of the last successful `connect_tcp`, retried on enable.
    remembered_host: Option<(String, u16)>,

    receive_buffer: Vec<u8>,
    receive_index: usize,
    warned_last_packet: bool,

    config: Option<DeviceConfig>,
    send_config_success_next_tick: bool,
    searching: bool,
    connecting: bool,
}

impl ProxyProvider {
    pub fn new(ctx: WearableContext) -> Self {
        ProxyProvider {
            core: ProviderCore::new(ctx),
            link: None,
            remembered_host: None,
            receive_buffer: vec![0; SERVER_TO_CLIENT_BUFFER_SIZE],
            receive_index: 0,
            warned_last_packet: false,
            config: None,
            send_config_success_next_tick: false,
            searching: false,
            connecting: false,
        }
    }

    pub fn is_connected_to_proxy(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_connected())
    }

    /// Open a TCP link to a proxy host. Blocks for at most the proxy network timeout.
    pub fn connect_tcp(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_connected_to_proxy() {
            return Ok(());
        }
        let timeout = self.core.ctx().settings.proxy_network_timeout;
        let link = TcpLink::connect(host, port, timeout).map_err(|e| {
            log::warn!("Failed to connect to proxy at {}:{}: {}", host, port, e);
            e
        })?;
        self.remembered_host = Some((host.to_string(), port));
        self.attach_link(Box::new(link));
        Ok(())
    }

    /// Use an already established link, replacing any current one.
    pub fn attach_link(&mut self, link: Box<dyn ProxyLink>) {
        if let Some(mut old) = self.link.take() {
            old.close();
        }
        self.link = Some(link);
        self.receive_index = 0;
        self.warned_last_packet = false;
        log::info!("Connected to proxy");
        self.core.push_event(ProviderEvent::ProxyConnected);
    }

    /// Close the link and forget the remembered host.
    pub fn disconnect_proxy(&mut self) {
        self.remembered_host = None;
        self.close_link();
    }

    fn close_link(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        link.close();
        self.drop_device_state();
        self.core.push_event(ProviderEvent::ProxyDisconnected);
    }

    fn handle_proxy_disconnect(&mut self, error: Option<WearableError>) {
        match error {
            Some(e) => log::warn!("Proxy connection lost: {}", e),
            None => log::info!("Proxy connection closed by host"),
        }
        self.close_link();
    }

    fn drop_device_state(&mut self) {
        if let Some(device) = self.core.take_connected_device() {
            self.core.report_status(ConnectionStatus::Disconnected, Some(&device));
        }
        self.config = None;
        self.send_config_success_next_tick = false;
        self.connecting = false;
        self.searching = false;
    }

    /// Encode one request and send it.
    fn transmit(&mut self, encode: impl FnOnce(&mut [u8], &mut usize) -> Result<()>) {
        let Some(link) = self.link.as_mut().filter(|l| l.is_connected()) else {
            log::warn!("Not connected to a proxy; request dropped");
            return;
        };
        let mut buffer = [0u8; CLIENT_TO_SERVER_BUFFER_SIZE];
        let mut len = 0;
        if let Err(e) = encode(&mut buffer[..], &mut len) {
            log::warn!("Failed to encode proxy request: {}", e);
            return;
        }
        if let Err(e) = link.send(&buffer[..len]) {
            self.handle_proxy_disconnect(Some(e));
        }
    }

    /// Decode every complete packet in the receive buffer.
    ///
    /// A partial packet at the end is moved to the front to be completed by
    /// the next read. A corrupt packet discards the whole buffer.
    fn process_receive_buffer(&mut self) {
        let buffer = std::mem::take(&mut self.receive_buffer);
        let end = self.receive_index;
        let mut cursor = 0;
        let mut keep_from = end;

        while cursor < end {
            let start = cursor;
            match ClientProtocol::process_packet(&buffer[..end], &mut cursor, self) {
                Ok(()) => self.warned_last_packet = false,
                Err(e) if e.is_incomplete() => {
                    keep_from = start;
                    break;
                }
                Err(e) => {
                    if !self.warned_last_packet {
                        log::warn!("Discarding proxy receive buffer: {}", e);
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

    fn receive(&mut self) {
        loop {
            if self.receive_index >= self.receive_buffer.len() {
                log::warn!("Proxy receive buffer full; dumping {} bytes", self.receive_index);
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
                    self.handle_proxy_disconnect(Some(e));
                    return;
                }
            }
        }
        if !self.is_connected_to_proxy() {
            self.handle_proxy_disconnect(None);
        }
    }
}

impl ClientEvents for ProxyProvider {
    fn on_ping_query(&mut self) {
        self.transmit(protocol::encode_ping_response);
    }

    fn on_sensor_frame(&mut self, frame: SensorFrame) {
        self.core.push_frame(frame);
        if let Some(gesture_id) = frame.gesture_id {
            self.core.push_gesture(GestureData {
                timestamp: frame.timestamp,
                gesture_id,
            });
        }
    }

    fn on_device_list(&mut self, devices: Vec<Device>) {
        // Lists nobody here asked for belong to another client's search.
        if self.searching {
            self.deliver_search_results(&devices);
        }
    }

    fn on_connection_status(&mut self, state: ProxyConnectionState, device: Option<Device>) {
        match state {
            ProxyConnectionState::Disconnected => {
                if let Some(device) = self.core.take_connected_device() {
                    self.core.report_status(ConnectionStatus::Disconnected, Some(&device));
                }
                self.config = None;
            }
            ProxyConnectionState::Connecting => {
                if let Some(device) = device {
                    self.core.report_status(ConnectionStatus::Connecting, Some(&device));
                }
            }
            ProxyConnectionState::Connected => {
                if let Some(device) = device {
                    if self.core.connected_device() != Some(&device) {
                        if !self.connecting {
                            self.core.abandon_connection();
                        }
                        self.core.complete_connection(device);
                    } else {
                        self.core.set_connected_device(Some(device));
                    }
                }
                self.connecting = false;
            }
            ProxyConnectionState::Failed => {
                self.core.take_connected_device();
                if self.connecting {
                    self.core.fail_connection(
                        device.as_ref(),
                        Some("the proxy host could not connect to the device".into()),
                    );
                } else {
                    self.core.report_status(ConnectionStatus::Failed, device.as_ref());
                }
                self.connecting = false;
            }
        }
    }

    fn on_config_status(&mut self, config: DeviceConfig) {
        self.core.complete_config_request(&config);
        self.config = Some(config);
    }
}

impl WearableProvider for ProxyProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Proxy
    }

    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProviderCore {
        &mut self.core
    }

    fn search_for_devices(
        &mut self,
        _intent: Option<&AppIntentProfile>,
        callback: SearchCallback,
        auto_reconnect: bool,
    ) {
        if auto_reconnect {
            log::debug!("Auto-reconnect is not available over the proxy; searching normally");
        }
        self.core.begin_search(callback, false);
        let threshold = clamp_rssi(self.core.ctx().settings.rssi_threshold);
        self.transmit(|buf, len| {
            ClientProtocol::encode_set_rssi_filter(buf, len, threshold)?;
            ClientProtocol::encode_initiate_device_search(buf, len)
        });
        self.searching = true;
    }

    fn stop_searching_for_devices(&mut self) {
        let was_searching = self.core.end_search() || self.searching;
        self.searching = false;
        if was_searching && self.is_connected_to_proxy() {
            self.transmit(ClientProtocol::encode_stop_device_search);
        }
    }

    fn connect_to_device(&mut self, device: Device, callbacks: ConnectCallbacks) {
        self.core.begin_connection(callbacks);
        self.transmit(|buf, len| ClientProtocol::encode_connect_to_device(buf, len, &device.uid));
        self.connecting = true;
    }

    fn cancel_device_connection(&mut self) {
        log::info!("Cancelling a device connection is not supported over the proxy");
    }

    fn disconnect_from_device(&mut self) {
        if self.is_connected_to_proxy() {
            self.transmit(ClientProtocol::encode_disconnect_from_device);
        }
        // The host's acknowledgement is not awaited.
        if let Some(device) = self.core.take_connected_device() {
            self.core.report_status(ConnectionStatus::Disconnected, Some(&device));
            self.config = None;
            self.send_config_success_next_tick = false;
        }
    }

    fn set_device_configuration(&mut self, config: &DeviceConfig) {
        self.transmit(|buf, len| ClientProtocol::encode_set_new_config(buf, len, config));
        // Retries happen on the host, so a sent write counts as applied.
        self.send_config_success_next_tick = true;
    }

    fn cached_device_configuration(&self) -> DeviceConfig {
        match &self.config {
            Some(config) => config.clone(),
            None => {
                log::debug!("No configuration received from the proxy yet");
                DeviceConfig::disabled()
            }
        }
    }

    fn dynamic_device_info(&mut self) -> DynamicDeviceInfo {
        DynamicDeviceInfo::UNKNOWN
    }

    fn begin_config_request(&mut self) {
        self.transmit(ClientProtocol::encode_query_config);
    }

    fn begin_intent_validation(&mut self, _profile: &AppIntentProfile) {
        // The wire protocol has no intent packet; the host validates on its own side.
        self.core.complete_intent_request(true);
    }

    fn on_destroy(&mut self) {
        self.disconnect_proxy();
        self.core.destroy();
    }

    fn on_enable(&mut self) {
        if self.core.is_enabled() {
            return;
        }
        if self.link.is_none() {
            if let Some((host, port)) = self.remembered_host.clone() {
                if let Err(e) = self.connect_tcp(&host, port) {
                    log::debug!("Reconnect to remembered proxy failed: {}", e);
                }
            }
        }
        self.core.enable();
        self.send_config_success_next_tick = false;
    }

    fn on_disable(&mut self) {
        if !self.core.is_enabled() {
            return;
        }
        self.stop_searching_for_devices();
        self.core.disable();
        self.close_link();
    }

    fn update(&mut self) {
        if self.link.is_none() {
            return;
        }

        self.core.clear_batches();
        if self.send_config_success_next_tick {
            self.send_config_success_next_tick = false;
            self.core.report_config_success();
        }

        self.receive();
        self.core.poll_auto_reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::proxy::link::MemoryLink;
    use crate::proxy::server::{ClientPacket, ServerProtocol};
    use crate::types::{GestureId, SensorId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Host {
        link: MemoryLink,
        pending: Vec<u8>,
    }

    impl Host {
        fn send(&mut self, encode: impl FnOnce(&mut [u8], &mut usize) -> Result<()>) {
            let mut buf = vec![0u8; SERVER_TO_CLIENT_BUFFER_SIZE];
            let mut len = 0;
            encode(&mut buf[..], &mut len).unwrap();
            self.link.send(&buf[..len]).unwrap();
        }

        fn received(&mut self) -> Vec<ClientPacket> {
            let mut buf = [0u8; 1024];
            loop {
                let n = self.link.receive(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                self.pending.extend_from_slice(&buf[..n]);
            }
            let mut cursor = 0;
            let mut packets = Vec::new();
            while cursor < self.pending.len() {
                packets.push(ServerProtocol::decode_packet(&self.pending, &mut cursor).unwrap());
            }
            self.pending.clear();
            packets
        }
    }

    fn setup() -> (ProxyProvider, Host) {
        let clock = Arc::new(ManualClock::new());
        let mut provider = ProxyProvider::new(WearableContext::manual(clock));
        provider.on_initialize();
        provider.on_enable();
        let (client, server) = MemoryLink::pair();
        provider.attach_link(Box::new(client));
        (provider, Host { link: server, pending: Vec::new() })
    }

    fn device(uid: &str) -> Device {
        Device { uid: uid.into(), name: "Remote".into(), ..Default::default() }
    }

    fn connect_remote(provider: &mut ProxyProvider, host: &mut Host) {
        provider.connect_to_device(device("abc"), ConnectCallbacks::new());
        host.send(|b, i| {
            ServerProtocol::encode_connection_status(b, i, ProxyConnectionState::Connected, Some(&device("abc")))
        });
        provider.update();
        host.received();
        provider.drain_events();
    }

    fn statuses(events: &[ProviderEvent]) -> Vec<ConnectionStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                ProviderEvent::ConnectionStatusChanged { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_search_forwards_lists_only_while_searching() {
        let (mut provider, mut host) = setup();
        assert_eq!(provider.drain_events(), vec![ProviderEvent::ProxyConnected]);

        let lists = Arc::new(Mutex::new(Vec::new()));
        let sink = lists.clone();
        provider.search_for_devices(
            None,
            Box::new(move |devices| sink.lock().unwrap().push(devices.to_vec())),
            true,
        );
        assert_eq!(
            host.received(),
            vec![ClientPacket::SetRssiFilter(-65), ClientPacket::InitiateDeviceSearch]
        );
        assert_eq!(provider.connection_status(), ConnectionStatus::Searching);

        host.send(|b, i| ServerProtocol::encode_device_list(b, i, &[device("one"), device("two")]));
        provider.update();
        assert_eq!(lists.lock().unwrap().len(), 1);
        assert_eq!(lists.lock().unwrap()[0][1].uid, "two");

        provider.stop_searching_for_devices();
        assert_eq!(host.received(), vec![ClientPacket::StopDeviceSearch]);
        host.send(|b, i| ServerProtocol::encode_device_list(b, i, &[device("one")]));
        provider.update();
        assert_eq!(lists.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_client_initiated_connect_runs_success_once() {
        let (mut provider, mut host) = setup();
        provider.drain_events();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        provider.connect_to_device(
            device("abc"),
            ConnectCallbacks::new().on_success(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(host.received(), vec![ClientPacket::ConnectToDevice("abc".into())]);

        host.send(|b, i| {
            ServerProtocol::encode_connection_status(b, i, ProxyConnectionState::Connecting, Some(&device("abc")))
        });
        host.send(|b, i| {
            ServerProtocol::encode_connection_status(b, i, ProxyConnectionState::Connected, Some(&device("abc")))
        });
        host.send(|b, i| {
            ServerProtocol::encode_connection_status(b, i, ProxyConnectionState::Connected, Some(&device("abc")))
        });
        provider.update();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            statuses(&provider.drain_events()),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(provider.connected_device().map(|d| d.uid.as_str()), Some("abc"));
    }

    #[test]
    fn test_failed_connect_runs_failure() {
        let (mut provider, mut host) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        provider.connect_to_device(
            device("abc"),
            ConnectCallbacks::new().on_failure(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        host.send(|b, i| {
            ServerProtocol::encode_connection_status(b, i, ProxyConnectionState::Failed, Some(&device("abc")))
        });
        provider.update();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(provider.connection_status(), ConnectionStatus::Failed);
        assert!(provider.core().failure_reason().is_some());
    }

    #[test]
    fn test_ping_query_is_answered() {
        let (mut provider, mut host) = setup();
        host.send(protocol::encode_ping_query);
        provider.update();
        assert_eq!(host.received(), vec![ClientPacket::PingResponse]);
    }

    #[test]
    fn test_stream_reassembled_at_every_split() {
        let frame = SensorFrame {
            timestamp: 2.5,
            gesture_id: Some(GestureId::DoubleTap),
            ..Default::default()
        };
        let config = DeviceConfig::disabled().with_sensor(SensorId::Accelerometer);
        let mut buf = vec![0u8; SERVER_TO_CLIENT_BUFFER_SIZE];
        let mut len = 0;
        ServerProtocol::encode_sensor_frame(&mut buf, &mut len, &frame).unwrap();
        protocol::encode_ping_query(&mut buf, &mut len).unwrap();
        ServerProtocol::encode_config_status(&mut buf, &mut len, &config).unwrap();
        protocol::encode_keep_alive(&mut buf, &mut len).unwrap();

        for split in 1..len {
            let (mut provider, mut host) = setup();
            connect_remote(&mut provider, &mut host);

            let mut frames = Vec::new();
            host.link.send(&buf[..split]).unwrap();
            provider.update();
            frames.extend_from_slice(provider.current_sensor_frames());
            host.link.send(&buf[split..len]).unwrap();
            provider.update();
            frames.extend_from_slice(provider.current_sensor_frames());

            assert_eq!(frames, vec![frame], "split at {}", split);
            assert_eq!(host.received(), vec![ClientPacket::PingResponse], "split at {}", split);
            assert_eq!(provider.cached_device_configuration(), config, "split at {}", split);
            assert!(!provider.warned_last_packet, "split at {}", split);
            assert_eq!(provider.receive_index, 0, "split at {}", split);
            let events = provider.drain_events();
            assert!(events.contains(&ProviderEvent::GestureDetected(GestureId::DoubleTap)));
        }
    }

    #[test]
    fn test_corrupt_packet_discards_buffer() {
        let (mut provider, mut host) = setup();
        connect_remote(&mut provider, &mut host);

        let frame = SensorFrame { timestamp: 1.0, ..Default::default() };
        let mut buf = vec![0u8; 256];
        let mut len = 0;
        ServerProtocol::encode_sensor_frame(&mut buf, &mut len, &frame).unwrap();
        buf[1] = 0x01;
        host.link.send(&buf[..len]).unwrap();
        provider.update();
        assert!(provider.current_sensor_frames().is_empty());

        host.send(|b, i| ServerProtocol::encode_sensor_frame(b, i, &frame));
        provider.update();
        assert_eq!(provider.current_sensor_frames().len(), 1);
    }

    #[test]
    fn test_config_write_and_query() {
        let (mut provider, mut host) = setup();
        connect_remote(&mut provider, &mut host);

        let config = DeviceConfig::disabled().with_sensor(SensorId::Gyroscope);
        provider.set_device_configuration(&config);
        assert_eq!(host.received(), vec![ClientPacket::SetNewConfig(config.clone())]);
        provider.update();
        assert_eq!(provider.drain_events(), vec![ProviderEvent::ConfigurationSucceeded]);

        let seen = Arc::new(Mutex::new(None));
        let out = seen.clone();
        provider.request_device_configuration(Box::new(move |c| *out.lock().unwrap() = Some(c.clone())));
        assert_eq!(host.received(), vec![ClientPacket::QueryConfig]);
        host.send(|b, i| ServerProtocol::encode_config_status(b, i, &config));
        provider.update();
        assert_eq!(seen.lock().unwrap().as_ref(), Some(&config));
        assert_eq!(provider.cached_device_configuration(), config);
    }

    #[test]
    fn test_disconnect_is_immediate() {
        let (mut provider, mut host) = setup();
        connect_remote(&mut provider, &mut host);
        provider.disconnect_from_device();
        assert_eq!(host.received(), vec![ClientPacket::DisconnectFromDevice]);
        assert_eq!(statuses(&provider.drain_events()), vec![ConnectionStatus::Disconnected]);
        assert_eq!(provider.cached_device_configuration(), DeviceConfig::disabled());
    }

    #[test]
    fn test_host_hangup_reports_proxy_disconnect() {
        let (mut provider, mut host) = setup();
        connect_remote(&mut provider, &mut host);
        host.link.close();
        provider.update();
        assert!(!provider.is_connected_to_proxy());
        let events = provider.drain_events();
        assert!(events.contains(&ProviderEvent::ProxyDisconnected));
        assert_eq!(statuses(&events), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn test_cancel_is_ignored() {
        let (mut provider, _host) = setup();
        provider.connect_to_device(device("abc"), ConnectCallbacks::new());
        provider.drain_events();
        provider.cancel_device_connection();
        assert!(provider.drain_events().is_empty());
        assert!(provider.core().has_pending_connection());
    }
}
