//! Wire codec for the network proxy transport.
//!
//! Every packet is `[type u8][version u8][payload][terminator i32]`, all
//! multi-byte fields little-endian with 1-byte packing. Payloads are fixed
//! layout; device lists and configs carry a count sub-header followed by
//! fixed-size records.
//!
//! Decoders take the filled part of a receive buffer and a cursor. They fail
//! with [`WearableError::IncompletePacket`] when the bytes run out, leaving the
//! cursor untouched, and with [`WearableError::Protocol`] when the stream is
//! corrupt. Encoders check capacity up front and write nothing on failure.

use crate::device_config::DeviceConfig;
use crate::error::ProtocolError;
use crate::types::{
    Device, DeviceStatus, GestureFlags, GestureId, ProductId, Quaternion, SensorAccuracy,
    SensorFlags, SensorFrame, SensorId, SensorQuaternion, SensorUpdateInterval, SensorVector,
    Vector3,
};
use crate::{Result, WearableError};

// -- Framing --
pub const PROTOCOL_VERSION: u8 = 0x07;
pub const TERMINATOR: u32 = 0x424F_5345;
pub const HEADER_SIZE: usize = 2;
pub const FOOTER_SIZE: usize = 4;

// -- Fixed string widths --
pub const DEVICE_UID_LEN: usize = 36;
pub const DEVICE_NAME_LEN: usize = 32;
pub const FIRMWARE_VERSION_LEN: usize = 16;

// -- Payload geometry --
pub const SENSOR_FRAME_SIZE: usize = 84;
pub const DEVICE_INFO_SIZE: usize = 99;
pub const DEVICE_LIST_HEADER_SIZE: usize = 4;
pub const CONNECTION_STATUS_SIZE: usize = 4 + DEVICE_INFO_SIZE;
pub const DEVICE_CONFIG_HEADER_SIZE: usize = 12;
pub const CONFIG_RECORD_SIZE: usize = 2;
pub const DEVICE_CONFIG_SIZE: usize = DEVICE_CONFIG_HEADER_SIZE
    + CONFIG_RECORD_SIZE * (SensorId::ALL.len() + GestureId::ALL.len());
pub const RSSI_FILTER_SIZE: usize = 4;
pub const DEVICE_CONNECT_SIZE: usize = DEVICE_UID_LEN;

// -- Buffer sizing --
pub const SERVER_TO_CLIENT_BUFFER_SIZE: usize = 8192;
pub const CLIENT_TO_SERVER_BUFFER_SIZE: usize = 256;

/// Largest device list that fits one server-to-client buffer.
pub const MAX_DEVICE_LIST_LEN: usize = (SERVER_TO_CLIENT_BUFFER_SIZE
    - HEADER_SIZE
    - DEVICE_LIST_HEADER_SIZE
    - FOOTER_SIZE)
    / DEVICE_INFO_SIZE;

/// Packet type codes.
///
/// `0x00..=0x2F` flow both ways, `0x01..=0x11` only server to client and
/// `0x70..=0x7F` only client to server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    KeepAlive = 0x00,
    PingQuery = 0x20,
    PingResponse = 0x21,

    SensorFrame = 0x01,
    DeviceList = 0x02,
    ConnectionStatus = 0x06,
    ConfigStatus = 0x11,

    SetRssiFilter = 0x71,
    InitiateDeviceSearch = 0x72,
    StopDeviceSearch = 0x73,
    ConnectToDevice = 0x74,
    DisconnectFromDevice = 0x75,
    QueryConnectionStatus = 0x76,
    SetNewConfig = 0x7E,
    QueryConfig = 0x7F,
}

impl PacketType {
    pub fn from_u8(code: u8) -> Option<PacketType> {
        use PacketType::*;
        Some(match code {
            0x00 => KeepAlive,
            0x20 => PingQuery,
            0x21 => PingResponse,
            0x01 => SensorFrame,
            0x02 => DeviceList,
            0x06 => ConnectionStatus,
            0x11 => ConfigStatus,
            0x71 => SetRssiFilter,
            0x72 => InitiateDeviceSearch,
            0x73 => StopDeviceSearch,
            0x74 => ConnectToDevice,
            0x75 => DisconnectFromDevice,
            0x76 => QueryConnectionStatus,
            0x7E => SetNewConfig,
            0x7F => QueryConfig,
            _ => return None,
        })
    }

    pub fn is_bidirectional(self) -> bool {
        matches!(
            self,
            PacketType::KeepAlive | PacketType::PingQuery | PacketType::PingResponse
        )
    }

    pub fn is_server_to_client(self) -> bool {
        matches!(
            self,
            PacketType::SensorFrame
                | PacketType::DeviceList
                | PacketType::ConnectionStatus
                | PacketType::ConfigStatus
        )
    }

    pub fn is_client_to_server(self) -> bool {
        !self.is_bidirectional() && !self.is_server_to_client()
    }
}

/// Connection state as carried by the ConnectionStatus packet.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ProxyConnectionState {
    pub fn from_i32(value: i32) -> Option<ProxyConnectionState> {
        match value {
            0 => Some(ProxyConnectionState::Disconnected),
            1 => Some(ProxyConnectionState::Connecting),
            2 => Some(ProxyConnectionState::Connected),
            3 => Some(ProxyConnectionState::Failed),
            _ => None,
        }
    }
}

/// Sequential little-endian writer over a pre-sized region.
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.put(&v.to_le_bytes());
    }

    /// ASCII, truncated to `width`, null padded. Non-ASCII chars become `?`.
    pub fn put_fixed_str(&mut self, value: &str, width: usize) {
        let start = self.pos;
        for (i, ch) in value.chars().take(width).enumerate() {
            self.buf[start + i] = if ch.is_ascii() { ch as u8 } else { b'?' };
        }
        let written = value.chars().take(width).count();
        self.buf[start + written..start + width].fill(0);
        self.pos += width;
    }

    pub fn put_vector(&mut self, v: &SensorVector) {
        self.put_f32(v.value.x);
        self.put_f32(v.value.y);
        self.put_f32(v.value.z);
        self.put_i32(v.accuracy as i32);
    }

    pub fn put_quaternion(&mut self, q: &SensorQuaternion) {
        self.put_f32(q.value.x);
        self.put_f32(q.value.y);
        self.put_f32(q.value.z);
        self.put_f32(q.value.w);
        self.put_f32(q.measurement_uncertainty);
    }

    pub fn put_sensor_frame(&mut self, frame: &SensorFrame) {
        self.put_f32(frame.timestamp);
        self.put_f32(frame.delta_time);
        self.put_vector(&frame.acceleration);
        self.put_vector(&frame.angular_velocity);
        self.put_quaternion(&frame.rotation_nine_dof);
        self.put_quaternion(&frame.rotation_six_dof);
        self.put_i32(GestureId::to_wire(frame.gesture_id) as i32);
    }

    /// A missing device is written as an all-empty record.
    pub fn put_device_info(&mut self, device: Option<&Device>) {
        let empty = Device::default();
        let device = device.unwrap_or(&empty);
        self.put_fixed_str(&device.uid, DEVICE_UID_LEN);
        self.put_fixed_str(&device.name, DEVICE_NAME_LEN);
        self.put_fixed_str(&device.firmware_version, FIRMWARE_VERSION_LEN);
        self.put_i32(device.rssi);
        self.put_u16(device.product_id.0);
        self.put_u8(device.variant_id);
        self.put_u32(device.available_sensors.bits());
        self.put_u32(device.available_gestures.bits());
    }

    pub fn put_device_config(&mut self, config: &DeviceConfig) {
        self.put_i32(SensorId::ALL.len() as i32);
        self.put_i32(GestureId::ALL.len() as i32);
        self.put_i32(config.update_interval as i32);
        for sensor in SensorId::ALL {
            self.put_u8(sensor as u8);
            self.put_u8(config.sensor_enabled(sensor) as u8);
        }
        for gesture in GestureId::ALL {
            self.put_u8(gesture as u8);
            self.put_u8(config.gesture_enabled(gesture) as u8);
        }
    }
}

/// Sequential little-endian reader over the filled part of a buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Reader { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WearableError::IncompletePacket {
                needed: end,
                available: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn fixed_str(&mut self, width: usize) -> Result<String> {
        Ok(extract_string(self.take(width)?))
    }

    pub fn header(&mut self) -> Result<PacketType> {
        let code = self.u8()?;
        let version = self.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            }
            .into());
        }
        PacketType::from_u8(code).ok_or_else(|| ProtocolError::UnknownPacketType(code).into())
    }

    pub fn footer(&mut self) -> Result<()> {
        let terminator = self.u32()?;
        if terminator != TERMINATOR {
            return Err(ProtocolError::BadTerminator(terminator).into());
        }
        Ok(())
    }

    fn accuracy(&mut self) -> Result<SensorAccuracy> {
        let raw = self.i32()?;
        SensorAccuracy::from_i32(raw).ok_or_else(|| invalid("accuracy", raw))
    }

    fn vector(&mut self) -> Result<SensorVector> {
        let value = Vector3::new(self.f32()?, self.f32()?, self.f32()?);
        Ok(SensorVector {
            value,
            accuracy: self.accuracy()?,
        })
    }

    fn quaternion(&mut self) -> Result<SensorQuaternion> {
        let value = Quaternion::new(self.f32()?, self.f32()?, self.f32()?, self.f32()?);
        Ok(SensorQuaternion {
            value,
            measurement_uncertainty: self.f32()?,
        })
    }

    pub fn sensor_frame(&mut self) -> Result<SensorFrame> {
        let timestamp = self.f32()?;
        let delta_time = self.f32()?;
        let acceleration = self.vector()?;
        let angular_velocity = self.vector()?;
        let rotation_nine_dof = self.quaternion()?;
        let rotation_six_dof = self.quaternion()?;
        let raw_gesture = self.i32()?;
        let gesture_id = match raw_gesture {
            0 => None,
            v => Some(
                u8::try_from(v)
                    .ok()
                    .and_then(GestureId::from_u8)
                    .ok_or_else(|| invalid("gesture_id", v))?,
            ),
        };
        Ok(SensorFrame {
            timestamp,
            delta_time,
            acceleration,
            angular_velocity,
            rotation_nine_dof,
            rotation_six_dof,
            gesture_id,
        })
    }

    pub fn device_info(&mut self) -> Result<Device> {
        Ok(Device {
            uid: self.fixed_str(DEVICE_UID_LEN)?,
            name: self.fixed_str(DEVICE_NAME_LEN)?,
            firmware_version: self.fixed_str(FIRMWARE_VERSION_LEN)?,
            rssi: self.i32()?,
            product_id: ProductId(self.u16()?),
            variant_id: self.u8()?,
            available_sensors: SensorFlags::from_bits_truncate(self.u32()?),
            available_gestures: GestureFlags::from_bits_truncate(self.u32()?),
            device_status: DeviceStatus::empty(),
            ..Device::default()
        })
    }

    pub fn device_list(&mut self) -> Result<Vec<Device>> {
        let count = self.i32()?;
        let count = usize::try_from(count)
            .ok()
            .filter(|c| *c <= MAX_DEVICE_LIST_LEN)
            .ok_or_else(|| invalid("device_count", count))?;
        let mut devices = Vec::with_capacity(count);
        for _ in 0..count {
            devices.push(self.device_info()?);
        }
        Ok(devices)
    }

    pub fn connection_status(&mut self) -> Result<(ProxyConnectionState, Option<Device>)> {
        let raw = self.i32()?;
        let state = ProxyConnectionState::from_i32(raw).ok_or_else(|| invalid("state", raw))?;
        let device = self.device_info()?;
        let device = match state {
            ProxyConnectionState::Failed => None,
            _ => Some(device),
        };
        Ok((state, device))
    }

    pub fn device_config(&mut self) -> Result<DeviceConfig> {
        let sensor_count = self.i32()?;
        let gesture_count = self.i32()?;
        let raw_interval = self.i32()?;
        let sensor_count = usize::try_from(sensor_count)
            .ok()
            .filter(|c| *c <= SensorId::ALL.len())
            .ok_or_else(|| invalid("sensor_count", sensor_count))?;
        let gesture_count = usize::try_from(gesture_count)
            .ok()
            .filter(|c| *c <= GestureId::ALL.len())
            .ok_or_else(|| invalid("gesture_count", gesture_count))?;
        let interval = SensorUpdateInterval::from_i32(raw_interval)
            .ok_or_else(|| invalid("update_interval", raw_interval))?;

        let mut config = DeviceConfig::disabled().with_interval(interval);
        for _ in 0..sensor_count {
            let id = self.u8()?;
            let enabled = self.u8()? != 0;
            let sensor = SensorId::from_u8(id).ok_or_else(|| invalid("sensor_id", id as i32))?;
            config.set_sensor(sensor, enabled);
        }
        for _ in 0..gesture_count {
            let id = self.u8()?;
            let enabled = self.u8()? != 0;
            let gesture = GestureId::from_u8(id).ok_or_else(|| invalid("gesture_id", id as i32))?;
            config.set_gesture(gesture, enabled);
        }
        Ok(config)
    }
}

fn invalid(field: &'static str, value: i32) -> WearableError {
    ProtocolError::InvalidField {
        field,
        value: value as i64,
    }
    .into()
}

fn ensure_capacity(buffer: &[u8], index: usize, len: usize) -> Result<()> {
    let available = buffer.len().saturating_sub(index);
    if len > available {
        return Err(WearableError::BufferTooSmall {
            needed: len,
            available,
        });
    }
    Ok(())
}

/// Write `len` bytes at `index` via `body`, advancing the cursor only on success.
pub(crate) fn encode_with(
    buffer: &mut [u8],
    index: &mut usize,
    len: usize,
    body: impl FnOnce(&mut Writer<'_>),
) -> Result<()> {
    ensure_capacity(buffer, *index, len)?;
    let mut writer = Writer {
        buf: &mut buffer[*index..*index + len],
        pos: 0,
    };
    body(&mut writer);
    debug_assert_eq!(writer.pos, len, "payload length mismatch");
    *index += len;
    Ok(())
}

/// Frame a complete packet: header, payload of `payload_len` bytes, footer.
pub(crate) fn encode_packet(
    buffer: &mut [u8],
    index: &mut usize,
    packet_type: PacketType,
    payload_len: usize,
    payload: impl FnOnce(&mut Writer<'_>),
) -> Result<()> {
    encode_with(buffer, index, HEADER_SIZE + payload_len + FOOTER_SIZE, |w| {
        w.put_u8(packet_type as u8);
        w.put_u8(PROTOCOL_VERSION);
        payload(w);
        w.put_u32(TERMINATOR);
    })
}

/// Run `body` from `index`, committing the cursor only if it succeeds.
pub(crate) fn decode_with<T>(
    buffer: &[u8],
    index: &mut usize,
    body: impl FnOnce(&mut Reader<'_>) -> Result<T>,
) -> Result<T> {
    let mut reader = Reader::at(buffer, *index);
    let value = body(&mut reader)?;
    *index = reader.position();
    Ok(value)
}

/// Extract a null-padded ASCII string. Trailing NULs are stripped.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    data[..end]
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

pub fn encode_header(buffer: &mut [u8], index: &mut usize, packet_type: PacketType) -> Result<()> {
    encode_with(buffer, index, HEADER_SIZE, |w| {
        w.put_u8(packet_type as u8);
        w.put_u8(PROTOCOL_VERSION);
    })
}

/// Decode a header, checking the version before the type code.
pub fn decode_header(buffer: &[u8], index: &mut usize) -> Result<PacketType> {
    decode_with(buffer, index, |r| r.header())
}

/// Entry point of every role decoder: the header is all that identifies a packet.
pub fn decode_packet_type(buffer: &[u8], index: &mut usize) -> Result<PacketType> {
    decode_header(buffer, index)
}

pub fn encode_footer(buffer: &mut [u8], index: &mut usize) -> Result<()> {
    encode_with(buffer, index, FOOTER_SIZE, |w| w.put_u32(TERMINATOR))
}

pub fn decode_footer(buffer: &[u8], index: &mut usize) -> Result<()> {
    decode_with(buffer, index, |r| r.footer())
}

pub fn encode_keep_alive(buffer: &mut [u8], index: &mut usize) -> Result<()> {
    encode_packet(buffer, index, PacketType::KeepAlive, 0, |_| {})
}

pub fn encode_ping_query(buffer: &mut [u8], index: &mut usize) -> Result<()> {
    encode_packet(buffer, index, PacketType::PingQuery, 0, |_| {})
}

pub fn encode_ping_response(buffer: &mut [u8], index: &mut usize) -> Result<()> {
    encode_packet(buffer, index, PacketType::PingResponse, 0, |_| {})
}

pub fn encode_fixed_string(
    buffer: &mut [u8],
    index: &mut usize,
    value: &str,
    width: usize,
) -> Result<()> {
    encode_with(buffer, index, width, |w| w.put_fixed_str(value, width))
}

pub fn decode_fixed_string(buffer: &[u8], index: &mut usize, width: usize) -> Result<String> {
    decode_with(buffer, index, |r| r.fixed_str(width))
}

pub fn encode_sensor_frame(buffer: &mut [u8], index: &mut usize, frame: &SensorFrame) -> Result<()> {
    encode_with(buffer, index, SENSOR_FRAME_SIZE, |w| w.put_sensor_frame(frame))
}

pub fn decode_sensor_frame(buffer: &[u8], index: &mut usize) -> Result<SensorFrame> {
    decode_with(buffer, index, |r| r.sensor_frame())
}

pub fn device_list_size(count: usize) -> usize {
    DEVICE_LIST_HEADER_SIZE + count * DEVICE_INFO_SIZE
}

pub fn encode_device_list(buffer: &mut [u8], index: &mut usize, devices: &[Device]) -> Result<()> {
    encode_with(buffer, index, device_list_size(devices.len()), |w| {
        w.put_i32(devices.len() as i32);
        for device in devices {
            w.put_device_info(Some(device));
        }
    })
}

pub fn decode_device_list(buffer: &[u8], index: &mut usize) -> Result<Vec<Device>> {
    decode_with(buffer, index, |r| r.device_list())
}

pub fn encode_connection_status(
    buffer: &mut [u8],
    index: &mut usize,
    state: ProxyConnectionState,
    device: Option<&Device>,
) -> Result<()> {
    encode_with(buffer, index, CONNECTION_STATUS_SIZE, |w| {
        w.put_i32(state as i32);
        w.put_device_info(device);
    })
}

pub fn decode_connection_status(
    buffer: &[u8],
    index: &mut usize,
) -> Result<(ProxyConnectionState, Option<Device>)> {
    decode_with(buffer, index, |r| r.connection_status())
}

pub fn encode_device_config(
    buffer: &mut [u8],
    index: &mut usize,
    config: &DeviceConfig,
) -> Result<()> {
    encode_with(buffer, index, DEVICE_CONFIG_SIZE, |w| w.put_device_config(config))
}

pub fn decode_device_config(buffer: &[u8], index: &mut usize) -> Result<DeviceConfig> {
    decode_with(buffer, index, |r| r.device_config())
}
