use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Mul;

/// Sensors a wearable may carry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorId {
    Accelerometer = 0,
    Gyroscope = 1,
    RotationNineDof = 2,
    RotationSixDof = 3,
}

impl SensorId {
    pub const ALL: [SensorId; 4] = [
        SensorId::Accelerometer,
        SensorId::Gyroscope,
        SensorId::RotationNineDof,
        SensorId::RotationSixDof,
    ];

    pub fn from_u8(value: u8) -> Option<SensorId> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn flag(self) -> SensorFlags {
        SensorFlags::from_bits_truncate(1 << self as u32)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Gestures a wearable may detect. "No gesture" is `Option::None`, wire value 0.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GestureId {
    DoubleTap = 1,
    HeadNod = 2,
    HeadShake = 3,
    TouchAndHold = 4,
    Input = 5,
    Affirmative = 6,
    Negative = 7,
}

impl GestureId {
    pub const ALL: [GestureId; 7] = [
        GestureId::DoubleTap,
        GestureId::HeadNod,
        GestureId::HeadShake,
        GestureId::TouchAndHold,
        GestureId::Input,
        GestureId::Affirmative,
        GestureId::Negative,
    ];

    /// Maps a wire value to a gesture. Zero and unknown values yield `None`.
    pub fn from_u8(value: u8) -> Option<GestureId> {
        match value {
            0 => None,
            v => Self::ALL.get(v as usize - 1).copied(),
        }
    }

    pub fn to_wire(gesture: Option<GestureId>) -> u8 {
        gesture.map_or(0, |g| g as u8)
    }

    pub fn flag(self) -> GestureFlags {
        GestureFlags::from_bits_truncate(1 << (self as u32 - 1))
    }

    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }
}

/// Rate at which the device streams sensor frames.
///
/// Variants are ordered slowest to fastest, so `a > b` means `a` is faster.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum SensorUpdateInterval {
    ThreeHundredTwentyMs = 0,
    OneHundredSixtyMs = 1,
    #[default]
    EightyMs = 2,
    FortyMs = 3,
    TwentyMs = 4,
}

impl SensorUpdateInterval {
    pub const ALL: [SensorUpdateInterval; 5] = [
        SensorUpdateInterval::ThreeHundredTwentyMs,
        SensorUpdateInterval::OneHundredSixtyMs,
        SensorUpdateInterval::EightyMs,
        SensorUpdateInterval::FortyMs,
        SensorUpdateInterval::TwentyMs,
    ];

    pub const SLOWEST: SensorUpdateInterval = SensorUpdateInterval::ThreeHundredTwentyMs;
    pub const FASTEST: SensorUpdateInterval = SensorUpdateInterval::TwentyMs;

    pub fn from_i32(value: i32) -> Option<SensorUpdateInterval> {
        usize::try_from(value)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn millis(self) -> u32 {
        match self {
            SensorUpdateInterval::ThreeHundredTwentyMs => 320,
            SensorUpdateInterval::OneHundredSixtyMs => 160,
            SensorUpdateInterval::EightyMs => 80,
            SensorUpdateInterval::FortyMs => 40,
            SensorUpdateInterval::TwentyMs => 20,
        }
    }

    pub fn seconds(self) -> f32 {
        self.millis() as f32 / 1000.0
    }

    pub fn duration(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.millis() as u64)
    }

    /// The closest interval to an arbitrary period, as reported by bridges that speak milliseconds.
    pub fn closest_to_millis(millis: u32) -> SensorUpdateInterval {
        Self::ALL
            .iter()
            .copied()
            .min_by_key(|i| i.millis().abs_diff(millis))
            .unwrap_or_default()
    }

    pub fn is_faster_than(self, other: SensorUpdateInterval) -> bool {
        self > other
    }

    /// One step slower, saturating at the slowest interval.
    pub fn slower(self) -> SensorUpdateInterval {
        match self {
            SensorUpdateInterval::TwentyMs => SensorUpdateInterval::FortyMs,
            SensorUpdateInterval::FortyMs => SensorUpdateInterval::EightyMs,
            SensorUpdateInterval::EightyMs => SensorUpdateInterval::OneHundredSixtyMs,
            _ => SensorUpdateInterval::ThreeHundredTwentyMs,
        }
    }

    pub fn flag(self) -> UpdateIntervalFlags {
        UpdateIntervalFlags::from_bits_truncate(1 << self as u32)
    }
}

/// Calibration quality reported alongside vector samples.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SensorAccuracy {
    #[default]
    Unreliable = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl SensorAccuracy {
    pub fn from_i32(value: i32) -> Option<SensorAccuracy> {
        match value {
            0 => Some(SensorAccuracy::Unreliable),
            1 => Some(SensorAccuracy::Low),
            2 => Some(SensorAccuracy::Medium),
            3 => Some(SensorAccuracy::High),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Set of sensors, as carried in device capability records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SensorFlags: u32 {
        const ACCELEROMETER     = 1 << 0;
        const GYROSCOPE         = 1 << 1;
        const ROTATION_NINE_DOF = 1 << 2;
        const ROTATION_SIX_DOF  = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Set of gestures, as carried in device capability records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GestureFlags: u32 {
        const DOUBLE_TAP     = 1 << 0;
        const HEAD_NOD       = 1 << 1;
        const HEAD_SHAKE     = 1 << 2;
        const TOUCH_AND_HOLD = 1 << 3;
        const INPUT          = 1 << 4;
        const AFFIRMATIVE    = 1 << 5;
        const NEGATIVE       = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Set of update intervals, used by intent profiles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateIntervalFlags: u32 {
        const THREE_HUNDRED_TWENTY_MS = 1 << 0;
        const ONE_HUNDRED_SIXTY_MS    = 1 << 1;
        const EIGHTY_MS               = 1 << 2;
        const FORTY_MS                = 1 << 3;
        const TWENTY_MS               = 1 << 4;
    }
}

impl SensorFlags {
    pub fn sensors(self) -> impl Iterator<Item = SensorId> {
        SensorId::ALL.into_iter().filter(move |s| self.contains(s.flag()))
    }
}

impl GestureFlags {
    pub fn gestures(self) -> impl Iterator<Item = GestureId> {
        GestureId::ALL.into_iter().filter(move |g| self.contains(g.flag()))
    }
}

impl UpdateIntervalFlags {
    pub fn intervals(self) -> impl Iterator<Item = SensorUpdateInterval> {
        SensorUpdateInterval::ALL
            .into_iter()
            .filter(move |i| self.contains(i.flag()))
    }
}

bitflags::bitflags! {
    /// Runtime status word of a connected device.
    ///
    /// Bits 12..=15 carry the reason the sensor service is suspended.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceStatus: u16 {
        const SECURE_PAIRING_REQUIRED    = 1 << 0;
        const ALREADY_PAIRED_TO_CLIENT   = 1 << 1;
        const SENSOR_SERVICE_SUSPENDED   = 1 << 2;
        const MUSIC_SHARING_ACTIVE       = 1 << 12;
        const MULTIPOINT_CONNECTION      = 1 << 13;
        const VOICE_ASSISTANT_IN_USE     = 1 << 14;
        const UNKNOWN_SUSPENSION_REASON  = 1 << 15;
    }
}

impl DeviceStatus {
    const REASON_MASK: DeviceStatus = DeviceStatus::MUSIC_SHARING_ACTIVE
        .union(DeviceStatus::MULTIPOINT_CONNECTION)
        .union(DeviceStatus::VOICE_ASSISTANT_IN_USE)
        .union(DeviceStatus::UNKNOWN_SUSPENSION_REASON);

    pub fn service_suspended(self) -> bool {
        self.contains(DeviceStatus::SENSOR_SERVICE_SUSPENDED)
    }

    pub fn secure_pairing_required(self) -> bool {
        self.contains(DeviceStatus::SECURE_PAIRING_REQUIRED)
    }

    pub fn already_paired_to_client(self) -> bool {
        self.contains(DeviceStatus::ALREADY_PAIRED_TO_CLIENT)
    }

    /// Flags set now that were clear in `previous`.
    pub fn rising_edges(self, previous: DeviceStatus) -> DeviceStatus {
        self & !previous
    }

    /// Flags clear now that were set in `previous`.
    pub fn falling_edges(self, previous: DeviceStatus) -> DeviceStatus {
        previous & !self
    }

    pub fn suspended_reason(self) -> SensorServiceSuspendedReason {
        if self.contains(DeviceStatus::MUSIC_SHARING_ACTIVE) {
            SensorServiceSuspendedReason::MusicSharingActive
        } else if self.contains(DeviceStatus::MULTIPOINT_CONNECTION) {
            SensorServiceSuspendedReason::MultipointConnectionActive
        } else if self.contains(DeviceStatus::VOICE_ASSISTANT_IN_USE) {
            SensorServiceSuspendedReason::VoiceAssistantInUse
        } else {
            SensorServiceSuspendedReason::UnknownReason
        }
    }

    /// Replace the suspension reason bits, or clear them with `None`.
    pub fn set_suspended_reason(&mut self, reason: Option<SensorServiceSuspendedReason>) {
        self.remove(Self::REASON_MASK);
        if let Some(reason) = reason {
            self.insert(reason.flag());
        }
    }
}

/// Why the device stopped streaming sensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorServiceSuspendedReason {
    MusicSharingActive,
    MultipointConnectionActive,
    VoiceAssistantInUse,
    UnknownReason,
}

impl SensorServiceSuspendedReason {
    fn flag(self) -> DeviceStatus {
        match self {
            SensorServiceSuspendedReason::MusicSharingActive => DeviceStatus::MUSIC_SHARING_ACTIVE,
            SensorServiceSuspendedReason::MultipointConnectionActive => {
                DeviceStatus::MULTIPOINT_CONNECTION
            }
            SensorServiceSuspendedReason::VoiceAssistantInUse => DeviceStatus::VOICE_ASSISTANT_IN_USE,
            SensorServiceSuspendedReason::UnknownReason => DeviceStatus::UNKNOWN_SUSPENSION_REASON,
        }
    }
}

/// Hardware product identifier. Unknown values are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProductId(pub u16);

impl ProductId {
    pub const UNDEFINED: ProductId = ProductId(0);
    pub const FRAMES: ProductId = ProductId(0x402C);
    pub const QUIET_COMFORT_35_TWO: ProductId = ProductId(0x4020);
    pub const NOISE_CANCELLING_HEADPHONES_700: ProductId = ProductId(0x4024);

    pub fn product_type(self) -> ProductType {
        match self {
            ProductId::FRAMES => ProductType::Frames,
            ProductId::QUIET_COMFORT_35_TWO => ProductType::QuietComfort35Two,
            ProductId::NOISE_CANCELLING_HEADPHONES_700 => ProductType::NoiseCancellingHeadphones700,
            _ => ProductType::Unknown,
        }
    }

    pub fn is_known(self) -> bool {
        self.product_type() != ProductType::Unknown
    }

    /// Unknown ids collapse to `UNDEFINED`, as done after a session opens.
    pub fn normalized(self) -> ProductId {
        if self.is_known() {
            self
        } else {
            ProductId::UNDEFINED
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductType {
    Unknown,
    Frames,
    QuietComfort35Two,
    NoiseCancellingHeadphones700,
}

/// Hardware variant, only meaningful together with a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantType {
    Unknown,
    FramesAlto,
    FramesRondo,
}

impl VariantType {
    pub fn from_ids(product: ProductId, variant: u8) -> VariantType {
        match (product.product_type(), variant) {
            (ProductType::Frames, 1) => VariantType::FramesAlto,
            (ProductType::Frames, 2) => VariantType::FramesRondo,
            _ => VariantType::Unknown,
        }
    }
}

/// Coarse bucket of a received signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
    Full,
}

impl SignalStrength {
    pub fn from_rssi(rssi: i32) -> SignalStrength {
        if rssi > -35 {
            SignalStrength::Full
        } else if rssi > -45 {
            SignalStrength::Strong
        } else if rssi > -55 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        }
    }
}

/// Externally observed state of the connection to a device.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected = 0,
    Searching = 1,
    Connecting = 2,
    SecurePairingRequired = 3,
    FirmwareUpdateAvailable = 4,
    FirmwareUpdateRequired = 5,
    Connected = 6,
    Failed = 7,
    Cancelled = 8,
    AutoReconnect = 9,
}

impl ConnectionStatus {
    /// States from which a connection attempt may be cancelled.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::AutoReconnect
                | ConnectionStatus::SecurePairingRequired
                | ConnectionStatus::FirmwareUpdateAvailable
                | ConnectionStatus::FirmwareUpdateRequired
        )
    }

    pub fn from_i32(value: i32) -> Option<ConnectionStatus> {
        use ConnectionStatus::*;
        [
            Disconnected,
            Searching,
            Connecting,
            SecurePairingRequired,
            FirmwareUpdateAvailable,
            FirmwareUpdateRequired,
            Connected,
            Failed,
            Cancelled,
            AutoReconnect,
        ]
        .into_iter()
        .find(|s| *s as i32 == value)
    }
}

/// Progress of a configuration write as reported by a device bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConfigStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Failure,
}

impl ConfigStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, ConfigStatus::Success | ConfigStatus::Failure)
    }
}

/// Identifies a transport implementation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    Debug = 0,
    WearableDevice = 1,
    Usb = 3,
    Proxy = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const UP: Vector3 = Vector3 { x: 0.0, y: 1.0, z: 0.0 };
    pub const RIGHT: Vector3 = Vector3 { x: 1.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Vector3 {
        Vector3 { x, y, z }
    }

    pub fn scale(self, k: f32) -> Vector3 {
        Vector3::new(self.x * k, self.y * k, self.z * k)
    }
}

/// Rotation quaternion in `[x, y, z, w]` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Quaternion {
        Quaternion { x, y, z, w }
    }

    fn axis_angle(axis: Vector3, degrees: f32) -> Quaternion {
        let (s, c) = (degrees.to_radians() * 0.5).sin_cos();
        Quaternion::new(axis.x * s, axis.y * s, axis.z * s, c)
    }

    /// Euler angles in degrees, applied Z then X then Y.
    pub fn from_euler_degrees(euler: Vector3) -> Quaternion {
        let qx = Quaternion::axis_angle(Vector3::RIGHT, euler.x);
        let qy = Quaternion::axis_angle(Vector3::UP, euler.y);
        let qz = Quaternion::axis_angle(Vector3::new(0.0, 0.0, 1.0), euler.z);
        qy * qx * qz
    }

    pub fn inverse(self) -> Quaternion {
        Quaternion::new(-self.x, -self.y, -self.z, self.w)
    }

    pub fn rotate(self, v: Vector3) -> Vector3 {
        let p = self * Quaternion::new(v.x, v.y, v.z, 0.0) * self.inverse();
        Vector3::new(p.x, p.y, p.z)
    }
}

impl Mul for Quaternion {
    type Output = Quaternion;

    fn mul(self, r: Quaternion) -> Quaternion {
        Quaternion::new(
            self.w * r.x + self.x * r.w + self.y * r.z - self.z * r.y,
            self.w * r.y - self.x * r.z + self.y * r.w + self.z * r.x,
            self.w * r.z + self.x * r.y - self.y * r.x + self.z * r.w,
            self.w * r.w - self.x * r.x - self.y * r.y - self.z * r.z,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorVector {
    pub value: Vector3,
    pub accuracy: SensorAccuracy,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorQuaternion {
    pub value: Quaternion,
    /// Estimated error in degrees.
    pub measurement_uncertainty: f32,
}

/// One timestamped sample from the device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorFrame {
    /// Seconds since the stream started.
    pub timestamp: f32,
    /// Seconds since the previous frame.
    pub delta_time: f32,
    pub acceleration: SensorVector,
    pub angular_velocity: SensorVector,
    pub rotation_nine_dof: SensorQuaternion,
    pub rotation_six_dof: SensorQuaternion,
    pub gesture_id: Option<GestureId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureData {
    pub timestamp: f32,
    pub gesture_id: GestureId,
}

/// Identity and capability snapshot of a wearable.
///
/// Two devices are equal when their uids match, whatever the other fields say.
#[derive(Debug, Clone, Default)]
pub struct Device {
    pub uid: String,
    pub name: String,
    pub firmware_version: String,
    pub rssi: i32,
    /// Resolved once a session is open.
    pub product_id: ProductId,
    /// Resolved once a session is open.
    pub variant_id: u8,
    pub available_sensors: SensorFlags,
    pub available_gestures: GestureFlags,
    pub device_status: DeviceStatus,
    pub transmission_period: i32,
    pub maximum_payload_per_transmission_period: i32,
    pub maximum_active_sensors: i32,
    pub is_connected: bool,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uid)
    }
}

impl Device {
    pub fn signal_strength(&self) -> SignalStrength {
        SignalStrength::from_rssi(self.rssi)
    }

    pub fn product_type(&self) -> ProductType {
        self.product_id.product_type()
    }

    pub fn variant_type(&self) -> VariantType {
        VariantType::from_ids(self.product_id, self.variant_id)
    }

    pub fn is_sensor_available(&self, sensor: SensorId) -> bool {
        self.available_sensors.contains(sensor.flag())
    }

    pub fn is_gesture_available(&self, gesture: GestureId) -> bool {
        self.available_gestures.contains(gesture.flag())
    }

    pub fn supports_profile(&self, profile: &crate::intent::AppIntentProfile) -> bool {
        profile.is_supported_by(self)
    }

    /// Folds a fresh dynamic-info reading into the snapshot.
    pub fn apply_dynamic_info(&mut self, info: &DynamicDeviceInfo) {
        self.device_status = info.device_status;
        self.transmission_period = info.transmission_period;
    }
}

/// Device state that may change at any time during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicDeviceInfo {
    pub device_status: DeviceStatus,
    /// Milliseconds, or -1 when unknown.
    pub transmission_period: i32,
}

impl DynamicDeviceInfo {
    pub const UNKNOWN: DynamicDeviceInfo = DynamicDeviceInfo {
        device_status: DeviceStatus::empty(),
        transmission_period: -1,
    };
}

impl Default for DynamicDeviceInfo {
    fn default() -> Self {
        DynamicDeviceInfo::UNKNOWN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertStyle {
    Affirmative,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpdateAlertOption {
    pub style: AlertStyle,
    pub title: String,
}

/// Choices presented to the user when the device reports a firmware update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpdateInformation {
    pub title: String,
    pub message: String,
    pub options: Vec<FirmwareUpdateAlertOption>,
}

impl Default for FirmwareUpdateInformation {
    fn default() -> Self {
        FirmwareUpdateInformation {
            title: "Firmware update".into(),
            message: "A firmware update is available for this device.".into(),
            options: vec![
                FirmwareUpdateAlertOption {
                    style: AlertStyle::Affirmative,
                    title: "Update".into(),
                },
                FirmwareUpdateAlertOption {
                    style: AlertStyle::Negative,
                    title: "Skip".into(),
                },
            ],
        }
    }
}
