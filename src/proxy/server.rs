//! Server end of the proxy protocol: decodes client requests, encodes updates.

use crate::device_config::DeviceConfig;
use crate::error::{ProtocolError, ProtocolRole};
use crate::protocol::{
    decode_with, device_list_size, encode_packet, PacketType, ProxyConnectionState,
    CONNECTION_STATUS_SIZE, DEVICE_CONFIG_SIZE, DEVICE_UID_LEN, SENSOR_FRAME_SIZE,
};
use crate::types::{Device, SensorFrame};
use crate::Result;

/// A decoded client-to-server packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    KeepAlive,
    PingQuery,
    PingResponse,
    SetRssiFilter(i32),
    InitiateDeviceSearch,
    StopDeviceSearch,
    ConnectToDevice(String),
    DisconnectFromDevice,
    QueryConnectionStatus,
    SetNewConfig(DeviceConfig),
    QueryConfig,
}

/// Callbacks invoked by [`ServerProtocol::process_packet`]. All default to no-ops.
pub trait ServerEvents {
    fn on_keep_alive(&mut self) {}
    fn on_ping_query(&mut self) {}
    fn on_ping_response(&mut self) {}
    fn on_set_rssi_filter(&mut self, _threshold: i32) {}
    fn on_initiate_device_search(&mut self) {}
    fn on_stop_device_search(&mut self) {}
    fn on_connect_to_device(&mut self, _uid: String) {}
    fn on_disconnect_from_device(&mut self) {}
    fn on_query_connection_status(&mut self) {}
    fn on_set_new_config(&mut self, _config: DeviceConfig) {}
    fn on_query_config(&mut self) {}
}

pub struct ServerProtocol;

impl ServerProtocol {
    pub fn encode_sensor_frame(buffer: &mut [u8], index: &mut usize, frame: &SensorFrame) -> Result<()> {
        encode_packet(buffer, index, PacketType::SensorFrame, SENSOR_FRAME_SIZE, |w| {
            w.put_sensor_frame(frame)
        })
    }

    pub fn encode_device_list(buffer: &mut [u8], index: &mut usize, devices: &[Device]) -> Result<()> {
        encode_packet(
            buffer,
            index,
            PacketType::DeviceList,
            device_list_size(devices.len()),
            |w| {
                w.put_i32(devices.len() as i32);
                for device in devices {
                    w.put_device_info(Some(device));
                }
            },
        )
    }

    pub fn encode_connection_status(
        buffer: &mut [u8],
        index: &mut usize,
        state: ProxyConnectionState,
        device: Option<&Device>,
    ) -> Result<()> {
        encode_packet(
            buffer,
            index,
            PacketType::ConnectionStatus,
            CONNECTION_STATUS_SIZE,
            |w| {
                w.put_i32(state as i32);
                w.put_device_info(device);
            },
        )
    }

    pub fn encode_config_status(
        buffer: &mut [u8],
        index: &mut usize,
        config: &DeviceConfig,
    ) -> Result<()> {
        encode_packet(buffer, index, PacketType::ConfigStatus, DEVICE_CONFIG_SIZE, |w| {
            w.put_device_config(config)
        })
    }

    /// Decode exactly one packet and advance `index` past it.
    pub fn decode_packet(buffer: &[u8], index: &mut usize) -> Result<ClientPacket> {
        decode_with(buffer, index, |r| {
            let packet = match r.header()? {
                PacketType::KeepAlive => ClientPacket::KeepAlive,
                PacketType::PingQuery => ClientPacket::PingQuery,
                PacketType::PingResponse => ClientPacket::PingResponse,
                PacketType::SetRssiFilter => ClientPacket::SetRssiFilter(r.i32()?),
                PacketType::InitiateDeviceSearch => ClientPacket::InitiateDeviceSearch,
                PacketType::StopDeviceSearch => ClientPacket::StopDeviceSearch,
                PacketType::ConnectToDevice => {
                    ClientPacket::ConnectToDevice(r.fixed_str(DEVICE_UID_LEN)?)
                }
                PacketType::DisconnectFromDevice => ClientPacket::DisconnectFromDevice,
                PacketType::QueryConnectionStatus => ClientPacket::QueryConnectionStatus,
                PacketType::SetNewConfig => ClientPacket::SetNewConfig(r.device_config()?),
                PacketType::QueryConfig => ClientPacket::QueryConfig,
                other => {
                    return Err(ProtocolError::UnexpectedPacketType {
                        packet: other,
                        role: ProtocolRole::Server,
                    }
                    .into())
                }
            };
            r.footer()?;
            Ok(packet)
        })
    }

    /// Decode one packet and hand it to the matching callback.
    pub fn process_packet<E: ServerEvents + ?Sized>(
        buffer: &[u8],
        index: &mut usize,
        events: &mut E,
    ) -> Result<()> {
        match Self::decode_packet(buffer, index)? {
            ClientPacket::KeepAlive => events.on_keep_alive(),
            ClientPacket::PingQuery => events.on_ping_query(),
            ClientPacket::PingResponse => events.on_ping_response(),
            ClientPacket::SetRssiFilter(threshold) => events.on_set_rssi_filter(threshold),
            ClientPacket::InitiateDeviceSearch => events.on_initiate_device_search(),
            ClientPacket::StopDeviceSearch => events.on_stop_device_search(),
            ClientPacket::ConnectToDevice(uid) => events.on_connect_to_device(uid),
            ClientPacket::DisconnectFromDevice => events.on_disconnect_from_device(),
            ClientPacket::QueryConnectionStatus => events.on_query_connection_status(),
            ClientPacket::SetNewConfig(config) => events.on_set_new_config(config),
            ClientPacket::QueryConfig => events.on_query_config(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::client::{ClientProtocol, ServerPacket};
    use crate::protocol::SERVER_TO_CLIENT_BUFFER_SIZE;

    #[test]
    fn test_server_packet_rejected_by_server() {
        let mut buf = [0u8; SERVER_TO_CLIENT_BUFFER_SIZE];
        let mut len = 0;
        ServerProtocol::encode_config_status(&mut buf, &mut len, &DeviceConfig::default()).unwrap();
        let mut cursor = 0;
        let err = ServerProtocol::decode_packet(&buf[..len], &mut cursor).unwrap_err();
        assert!(matches!(
            err,
            crate::WearableError::Protocol(ProtocolError::UnexpectedPacketType {
                packet: PacketType::ConfigStatus,
                role: ProtocolRole::Server,
            })
        ));
    }

    #[test]
    fn test_connection_status_reaches_client() {
        let device = Device {
            uid: crate::settings::EMPTY_UID.into(),
            name: "Corey's Device".into(),
            rssi: -40,
            ..Default::default()
        };
        let mut buf = [0u8; SERVER_TO_CLIENT_BUFFER_SIZE];
        let mut len = 0;
        ServerProtocol::encode_connection_status(
            &mut buf,
            &mut len,
            ProxyConnectionState::Connected,
            Some(&device),
        )
        .unwrap();
        assert_eq!(len, 2 + 103 + 4);

        let mut cursor = 0;
        match ClientProtocol::decode_packet(&buf[..len], &mut cursor).unwrap() {
            ServerPacket::ConnectionStatus { state, device: Some(d) } => {
                assert_eq!(state, ProxyConnectionState::Connected);
                assert_eq!(d.name, "Corey's Device");
                assert_eq!(d.rssi, -40);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[derive(Default)]
    struct Recorder {
        connects: Vec<String>,
        searches: usize,
    }

    impl ServerEvents for Recorder {
        fn on_initiate_device_search(&mut self) {
            self.searches += 1;
        }

        fn on_connect_to_device(&mut self, uid: String) {
            self.connects.push(uid);
        }
    }

    #[test]
    fn test_process_packet_dispatch() {
        let mut buf = [0u8; 128];
        let mut len = 0;
        ClientProtocol::encode_initiate_device_search(&mut buf, &mut len).unwrap();
        ClientProtocol::encode_connect_to_device(&mut buf, &mut len, "abc").unwrap();
        ClientProtocol::encode_disconnect_from_device(&mut buf, &mut len).unwrap();

        let mut events = Recorder::default();
        let mut cursor = 0;
        while cursor < len {
            ServerProtocol::process_packet(&buf[..len], &mut cursor, &mut events).unwrap();
        }
        assert_eq!(events.searches, 1);
        assert_eq!(events.connects, vec!["abc".to_string()]);
    }
}
