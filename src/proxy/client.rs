//! Client end of the proxy protocol: decodes server packets, encodes requests.

use crate::device_config::DeviceConfig;
use crate::error::{ProtocolError, ProtocolRole};
use crate::protocol::{
    decode_with, encode_packet, PacketType, ProxyConnectionState, DEVICE_CONFIG_SIZE,
    DEVICE_CONNECT_SIZE, DEVICE_UID_LEN, RSSI_FILTER_SIZE,
};
use crate::types::{Device, SensorFrame};
use crate::Result;

/// A decoded server-to-client packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    KeepAlive,
    PingQuery,
    PingResponse,
    SensorFrame(SensorFrame),
    DeviceList(Vec<Device>),
    ConnectionStatus {
        state: ProxyConnectionState,
        device: Option<Device>,
    },
    ConfigStatus(DeviceConfig),
}

/// Callbacks invoked by [`ClientProtocol::process_packet`], one per packet.
///
/// Every method defaults to doing nothing.
pub trait ClientEvents {
    fn on_keep_alive(&mut self) {}
    fn on_ping_query(&mut self) {}
    fn on_ping_response(&mut self) {}
    fn on_sensor_frame(&mut self, _frame: SensorFrame) {}
    fn on_device_list(&mut self, _devices: Vec<Device>) {}
    fn on_connection_status(&mut self, _state: ProxyConnectionState, _device: Option<Device>) {}
    fn on_config_status(&mut self, _config: DeviceConfig) {}
}

pub struct ClientProtocol;

impl ClientProtocol {
    pub fn encode_set_rssi_filter(buffer: &mut [u8], index: &mut usize, threshold: i32) -> Result<()> {
        encode_packet(buffer, index, PacketType::SetRssiFilter, RSSI_FILTER_SIZE, |w| {
            w.put_i32(threshold)
        })
    }

    pub fn encode_initiate_device_search(buffer: &mut [u8], index: &mut usize) -> Result<()> {
        encode_packet(buffer, index, PacketType::InitiateDeviceSearch, 0, |_| {})
    }

    pub fn encode_stop_device_search(buffer: &mut [u8], index: &mut usize) -> Result<()> {
        encode_packet(buffer, index, PacketType::StopDeviceSearch, 0, |_| {})
    }

    pub fn encode_connect_to_device(buffer: &mut [u8], index: &mut usize, uid: &str) -> Result<()> {
        encode_packet(buffer, index, PacketType::ConnectToDevice, DEVICE_CONNECT_SIZE, |w| {
            w.put_fixed_str(uid, DEVICE_UID_LEN)
        })
    }

    pub fn encode_disconnect_from_device(buffer: &mut [u8], index: &mut usize) -> Result<()> {
        encode_packet(buffer, index, PacketType::DisconnectFromDevice, 0, |_| {})
    }

    pub fn encode_query_connection_status(buffer: &mut [u8], index: &mut usize) -> Result<()> {
        encode_packet(buffer, index, PacketType::QueryConnectionStatus, 0, |_| {})
    }

    pub fn encode_set_new_config(
        buffer: &mut [u8],
        index: &mut usize,
        config: &DeviceConfig,
    ) -> Result<()> {
        encode_packet(buffer, index, PacketType::SetNewConfig, DEVICE_CONFIG_SIZE, |w| {
            w.put_device_config(config)
        })
    }

    pub fn encode_query_config(buffer: &mut [u8], index: &mut usize) -> Result<()> {
        encode_packet(buffer, index, PacketType::QueryConfig, 0, |_| {})
    }

    /// Decode exactly one packet and advance `index` past it.
    ///
    /// On any error the cursor is left where it was.
    pub fn decode_packet(buffer: &[u8], index: &mut usize) -> Result<ServerPacket> {
        decode_with(buffer, index, |r| {
            let packet = match r.header()? {
                PacketType::KeepAlive => ServerPacket::KeepAlive,
                PacketType::PingQuery => ServerPacket::PingQuery,
                PacketType::PingResponse => ServerPacket::PingResponse,
                PacketType::SensorFrame => ServerPacket::SensorFrame(r.sensor_frame()?),
                PacketType::DeviceList => ServerPacket::DeviceList(r.device_list()?),
                PacketType::ConnectionStatus => {
                    let (state, device) = r.connection_status()?;
                    ServerPacket::ConnectionStatus { state, device }
                }
                PacketType::ConfigStatus => ServerPacket::ConfigStatus(r.device_config()?),
                other => {
                    return Err(ProtocolError::UnexpectedPacketType {
                        packet: other,
                        role: ProtocolRole::Client,
                    }
                    .into())
                }
            };
            r.footer()?;
            Ok(packet)
        })
    }

    /// Decode one packet and hand it to the matching callback.
    pub fn process_packet<E: ClientEvents + ?Sized>(
        buffer: &[u8],
        index: &mut usize,
        events: &mut E,
    ) -> Result<()> {
        match Self::decode_packet(buffer, index)? {
            ServerPacket::KeepAlive => events.on_keep_alive(),
            ServerPacket::PingQuery => events.on_ping_query(),
            ServerPacket::PingResponse => events.on_ping_response(),
            ServerPacket::SensorFrame(frame) => events.on_sensor_frame(frame),
            ServerPacket::DeviceList(devices) => events.on_device_list(devices),
            ServerPacket::ConnectionStatus { state, device } => {
                events.on_connection_status(state, device)
            }
            ServerPacket::ConfigStatus(config) => events.on_config_status(config),
        }
        Ok(())
    }
}
