use std::fmt;

use crate::error::DiscoveryError;

/// A 6-byte Bluetooth device address, stored in wire (little-endian) order.
///
/// `Display` prints it the conventional way, most significant byte first:
///
/// ```
/// # use ecg_ble::types::Address;
/// let addr = Address([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
/// assert_eq!(addr.to_string(), "11:22:33:44:55:66");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{g:02X}:{e:02X}:{d:02X}:{c:02X}:{b:02X}:{a:02X}")
    }
}

/// Link-layer address type reported with every advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl AddressType {
    pub fn from_u8(raw: u8) -> Self {
        if raw == 0 {
            AddressType::Public
        } else {
            AddressType::Random
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            AddressType::Public => 0,
            AddressType::Random => 1,
        }
    }
}

/// A peripheral picked out of the advertisement stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peripheral {
    pub address: Address,
    pub address_type: AddressType,
}

/// Span of attribute handles belonging to one GATT service.
///
/// `end == 0` is the "not found" sentinel; the range only becomes valid once
/// a group-found event for the target service has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleRange {
    pub start: u16,
    pub end: u16,
}

impl HandleRange {
    pub fn is_valid(&self) -> bool {
        self.end > 0 && self.start <= self.end
    }
}

/// Attribute handles discovered inside the ECG service.  `0` means unset.
///
/// The three handles fill in table order: the CCC descriptor that follows the
/// measurement value, then the switch characteristic.  The setters in
/// [`crate::discovery::Discovery`] refuse to record a handle whose
/// predecessor is still unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicHandles {
    /// Value handle of the ECG measurement characteristic.
    pub measurement: u16,
    /// CCC descriptor of the measurement characteristic.
    pub ccc: u16,
    /// Value handle of the vendor switch characteristic.
    pub switch: u16,
}

/// Phase of the scan → connect → discover → listen sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    /// Scanning; no connection attempt in flight.
    #[default]
    Standby,
    /// `gap_connect_direct` issued, waiting for the link to be established.
    Connecting,
    /// Primary-service search running.
    FindingServices,
    /// Attribute search inside the ECG service running.
    FindingAttributes,
    /// Notifications enabled; sample payloads are flowing.
    Listening,
    /// The link dropped.  Scanning resumes.
    Disconnected,
    /// Discovery gave up after exhausting its retries.  Terminal.
    Failed,
}

impl DiscoveryState {
    /// `true` while no connection is held or being attempted.
    pub fn is_idle(self) -> bool {
        matches!(self, DiscoveryState::Standby | DiscoveryState::Disconnected)
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryState::Standby => "standby",
            DiscoveryState::Connecting => "connecting",
            DiscoveryState::FindingServices => "finding services",
            DiscoveryState::FindingAttributes => "finding attributes",
            DiscoveryState::Listening => "listening",
            DiscoveryState::Disconnected => "disconnected",
            DiscoveryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One decoded notification: two ECG values and, in counter mode, the
/// packet counter that preceded them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EcgSample {
    /// Little-endian packet counter from bytes 0–1.  `None` unless counter
    /// mode is enabled.
    pub counter: Option<u16>,
    /// ECG values in payload order.
    pub values: [f32; 2],
}

/// Result of one packet-loss observation window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketLossReport {
    /// `last − first + 1 − window`.  Negative when counters repeated.
    pub lost: i64,
    /// First counter of the window.
    pub first: u16,
    /// Last counter of the window.
    pub last: u16,
    /// The raw counters, in arrival order.
    pub counters: Vec<u16>,
}

/// All events emitted by [`crate::collector::EcgCollector`].
///
/// Consumers receive these through the `mpsc::Receiver` returned by
/// [`crate::collector::EcgCollector::start`].  The channel is lossy under
/// back-pressure; the sample buffer on the handle is the authoritative record
/// of decoded values.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// The discovery state machine moved to a new state.
    StateChanged(DiscoveryState),
    /// The link to the sensor is up.
    Connected(Address),
    /// One decoded notification.
    Sample(EcgSample),
    /// A packet-counter window completed (counter mode only).
    PacketLoss(PacketLossReport),
    /// A completed procedure did not yield the expected handle.
    Stalled(DiscoveryError),
    /// Discovery gave up.  No further commands will be issued.
    Failed(DiscoveryError),
    /// The link was lost.  `reason` is the radio's error code.
    Disconnected { address: Address, reason: u16 },
}
