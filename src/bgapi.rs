//! BGAPI wire codec for the subset of the BLE radio protocol the collector uses.
//!
//! Every packet starts with a 4-byte header:
//!
//! ```text
//! byte 0 : bit 7 = event flag, bits 3..6 = technology (0 = BLE), bits 0..2 = length high bits
//! byte 1 : length low byte (payload bytes only)
//! byte 2 : class ID
//! byte 3 : command / event ID
//! ```
//!
//! Payload integers are little-endian.  Variable-length arrays (`uint8array`)
//! carry a one-byte length prefix; device addresses are 6 bytes, LE.
//!
//! Commands are answered by a response packet with the same class/ID and the
//! event flag clear.  The collector only observes responses for logging; all
//! state changes are driven by events.

use std::time::{Duration, Instant};

use crate::error::DecodeError;
use crate::types::{Address, AddressType};

/// Packet header length in bytes.
pub const HEADER_LEN: usize = 4;

/// Longest payload the 11-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 0x7FF;

/// How long a partially received packet may sit before it is discarded.
pub const DEFAULT_PARSER_TIMEOUT: Duration = Duration::from_secs(1);

mod class {
    pub const CONNECTION: u8 = 0x03;
    pub const ATTCLIENT: u8 = 0x04;
    pub const GAP: u8 = 0x06;
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Commands the collector sends to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `connection_disconnect`
    ConnectionDisconnect { connection: u8 },
    /// `gap_set_mode`; `(0, 0)` stops advertising.
    GapSetMode { discover: u8, connect: u8 },
    /// `gap_discover`: start scanning.
    GapDiscover { mode: u8 },
    /// `gap_connect_direct`
    GapConnectDirect {
        address: Address,
        address_type: AddressType,
        conn_interval_min: u16,
        conn_interval_max: u16,
        timeout: u16,
        latency: u16,
    },
    /// `gap_end_procedure`: stop scanning or a pending connect.
    GapEndProcedure,
    /// `gap_set_scan_parameters`
    GapSetScanParameters {
        scan_interval: u16,
        scan_window: u16,
        active: u8,
    },
    /// `attclient_read_by_group_type`: list groups of type `uuid` (LE wire form).
    ReadByGroupType {
        connection: u8,
        start: u16,
        end: u16,
        uuid: Vec<u8>,
    },
    /// `attclient_find_information`: list every attribute handle and type in range.
    FindInformation { connection: u8, start: u16, end: u16 },
    /// `attclient_attribute_write`
    AttributeWrite {
        connection: u8,
        handle: u16,
        data: Vec<u8>,
    },
}

impl Command {
    fn class_id(&self) -> (u8, u8) {
        match self {
            Command::ConnectionDisconnect { .. } => (class::CONNECTION, 0x00),
            Command::ReadByGroupType { .. } => (class::ATTCLIENT, 0x01),
            Command::FindInformation { .. } => (class::ATTCLIENT, 0x03),
            Command::AttributeWrite { .. } => (class::ATTCLIENT, 0x05),
            Command::GapSetMode { .. } => (class::GAP, 0x01),
            Command::GapDiscover { .. } => (class::GAP, 0x02),
            Command::GapConnectDirect { .. } => (class::GAP, 0x03),
            Command::GapEndProcedure => (class::GAP, 0x04),
            Command::GapSetScanParameters { .. } => (class::GAP, 0x07),
        }
    }

    /// Connection handle the command is addressed to, if any.
    pub fn connection(&self) -> Option<u8> {
        match self {
            Command::ConnectionDisconnect { connection }
            | Command::ReadByGroupType { connection, .. }
            | Command::FindInformation { connection, .. }
            | Command::AttributeWrite { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    /// BGAPI name of the command, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConnectionDisconnect { .. } => "connection_disconnect",
            Command::GapSetMode { .. } => "gap_set_mode",
            Command::GapDiscover { .. } => "gap_discover",
            Command::GapConnectDirect { .. } => "gap_connect_direct",
            Command::GapEndProcedure => "gap_end_procedure",
            Command::GapSetScanParameters { .. } => "gap_set_scan_parameters",
            Command::ReadByGroupType { .. } => "attclient_read_by_group_type",
            Command::FindInformation { .. } => "attclient_find_information",
            Command::AttributeWrite { .. } => "attclient_attribute_write",
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Command::ConnectionDisconnect { connection } => p.push(*connection),
            Command::GapSetMode { discover, connect } => p.extend([*discover, *connect]),
            Command::GapDiscover { mode } => p.push(*mode),
            Command::GapConnectDirect {
                address,
                address_type,
                conn_interval_min,
                conn_interval_max,
                timeout,
                latency,
            } => {
                p.extend_from_slice(&address.0);
                p.push(address_type.as_u8());
                for v in [conn_interval_min, conn_interval_max, timeout, latency] {
                    p.extend_from_slice(&v.to_le_bytes());
                }
            }
            Command::GapEndProcedure => {}
            Command::GapSetScanParameters {
                scan_interval,
                scan_window,
                active,
            } => {
                p.extend_from_slice(&scan_interval.to_le_bytes());
                p.extend_from_slice(&scan_window.to_le_bytes());
                p.push(*active);
            }
            Command::ReadByGroupType {
                connection,
                start,
                end,
                uuid,
            } => {
                p.push(*connection);
                p.extend_from_slice(&start.to_le_bytes());
                p.extend_from_slice(&end.to_le_bytes());
                push_array(&mut p, uuid);
            }
            Command::FindInformation {
                connection,
                start,
                end,
            } => {
                p.push(*connection);
                p.extend_from_slice(&start.to_le_bytes());
                p.extend_from_slice(&end.to_le_bytes());
            }
            Command::AttributeWrite {
                connection,
                handle,
                data,
            } => {
                p.push(*connection);
                p.extend_from_slice(&handle.to_le_bytes());
                push_array(&mut p, data);
            }
        }
        p
    }

    /// Serialise the command into a complete BGAPI packet.
    ///
    /// In *packet mode* (radios configured for UART flow without hardware
    /// handshake) every packet is preceded by one byte holding its total length.
    ///
    /// ```
    /// # use ecg_ble::bgapi::Command;
    /// assert_eq!(Command::GapDiscover { mode: 1 }.encode(false), vec![0x00, 0x01, 0x06, 0x02, 0x01]);
    /// ```
    pub fn encode(&self, packet_mode: bool) -> Vec<u8> {
        let (class, id) = self.class_id();
        let payload = self.payload();
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
        if packet_mode {
            out.push((HEADER_LEN + payload.len()) as u8);
        }
        out.extend(header(false, payload.len(), class, id));
        out.extend(payload);
        out
    }
}

fn push_array(p: &mut Vec<u8>, data: &[u8]) {
    p.push(data.len() as u8);
    p.extend_from_slice(data);
}

fn header(is_event: bool, len: usize, class: u8, id: u8) -> [u8; HEADER_LEN] {
    let flag = if is_event { 0x80 } else { 0x00 };
    [flag | ((len >> 8) as u8 & 0x07), len as u8, class, id]
}

// ── Packets ──────────────────────────────────────────────────────────────────

/// A framed packet as read off the serial line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub is_event: bool,
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Serialise back into wire bytes (used by the simulator and tests).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = header(self.is_event, self.payload.len(), self.class, self.id).to_vec();
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode an event packet.
    ///
    /// Returns `Ok(None)` for responses and for events the collector does not
    /// handle, and [`DecodeError::TruncatedPacket`] when a known event's
    /// payload is too short.
    pub fn decode_event(&self) -> Result<Option<Event>, DecodeError> {
        if !self.is_event {
            return Ok(None);
        }
        let mut r = FieldReader::new(self);
        let event = match (self.class, self.id) {
            (class::CONNECTION, 0x00) => Event::ConnectionStatus {
                connection: r.u8()?,
                flags: r.u8()?,
                address: r.address()?,
                address_type: AddressType::from_u8(r.u8()?),
                conn_interval: r.u16()?,
                timeout: r.u16()?,
                latency: r.u16()?,
                bonding: r.u8()?,
            },
            (class::CONNECTION, 0x04) => Event::ConnectionDisconnected {
                connection: r.u8()?,
                reason: r.u16()?,
            },
            (class::ATTCLIENT, 0x01) => Event::ProcedureCompleted {
                connection: r.u8()?,
                result: r.u16()?,
                handle: r.u16()?,
            },
            (class::ATTCLIENT, 0x02) => Event::GroupFound {
                connection: r.u8()?,
                start: r.u16()?,
                end: r.u16()?,
                uuid: r.array()?,
            },
            (class::ATTCLIENT, 0x04) => Event::FindInformationFound {
                connection: r.u8()?,
                handle: r.u16()?,
                uuid: r.array()?,
            },
            (class::ATTCLIENT, 0x05) => Event::AttributeValue {
                connection: r.u8()?,
                handle: r.u16()?,
                value_type: r.u8()?,
                value: r.array()?,
            },
            (class::GAP, 0x00) => Event::ScanResponse {
                rssi: r.u8()? as i8,
                packet_type: r.u8()?,
                sender: r.address()?,
                address_type: AddressType::from_u8(r.u8()?),
                bond: r.u8()?,
                data: r.array()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Sequential little-endian field reader over a packet payload.
struct FieldReader<'a> {
    packet: &'a Packet,
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(packet: &'a Packet) -> Self {
        Self { packet, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let packet: &'a Packet = self.packet;
        let payload = packet.payload.as_slice();
        if self.pos + n > payload.len() {
            return Err(DecodeError::TruncatedPacket {
                class: self.packet.class,
                id: self.packet.id,
                offset: self.pos,
            });
        }
        let out = &payload[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn address(&mut self) -> Result<Address, DecodeError> {
        let b = self.take(6)?;
        let mut addr = [0u8; 6];
        addr.copy_from_slice(b);
        Ok(Address(addr))
    }

    fn array(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Radio events consumed by the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `gap_scan_response`: one advertisement or scan response.
    ScanResponse {
        rssi: i8,
        packet_type: u8,
        sender: Address,
        address_type: AddressType,
        bond: u8,
        data: Vec<u8>,
    },
    /// `connection_status`: link established or its parameters changed.
    ConnectionStatus {
        connection: u8,
        flags: u8,
        address: Address,
        address_type: AddressType,
        conn_interval: u16,
        timeout: u16,
        latency: u16,
        bonding: u8,
    },
    /// `connection_disconnected`
    ConnectionDisconnected { connection: u8, reason: u16 },
    /// `attclient_group_found`: one service from a read-by-group-type search.
    GroupFound {
        connection: u8,
        start: u16,
        end: u16,
        uuid: Vec<u8>,
    },
    /// `attclient_find_information_found`: one attribute from a find-information search.
    FindInformationFound {
        connection: u8,
        handle: u16,
        uuid: Vec<u8>,
    },
    /// `attclient_procedure_completed`: shared by every attclient procedure.
    ProcedureCompleted {
        connection: u8,
        result: u16,
        handle: u16,
    },
    /// `attclient_attribute_value`: read result, notification or indication.
    AttributeValue {
        connection: u8,
        handle: u16,
        value_type: u8,
        value: Vec<u8>,
    },
}

impl Event {
    /// Encode the event as a radio would send it.
    pub fn to_packet(&self) -> Packet {
        let mut p = Vec::new();
        let (class, id) = match self {
            Event::ScanResponse {
                rssi,
                packet_type,
                sender,
                address_type,
                bond,
                data,
            } => {
                p.extend([*rssi as u8, *packet_type]);
                p.extend_from_slice(&sender.0);
                p.extend([address_type.as_u8(), *bond]);
                push_array(&mut p, data);
                (class::GAP, 0x00)
            }
            Event::ConnectionStatus {
                connection,
                flags,
                address,
                address_type,
                conn_interval,
                timeout,
                latency,
                bonding,
            } => {
                p.extend([*connection, *flags]);
                p.extend_from_slice(&address.0);
                p.push(address_type.as_u8());
                for v in [conn_interval, timeout, latency] {
                    p.extend_from_slice(&v.to_le_bytes());
                }
                p.push(*bonding);
                (class::CONNECTION, 0x00)
            }
            Event::ConnectionDisconnected { connection, reason } => {
                p.push(*connection);
                p.extend_from_slice(&reason.to_le_bytes());
                (class::CONNECTION, 0x04)
            }
            Event::GroupFound {
                connection,
                start,
                end,
                uuid,
            } => {
                p.push(*connection);
                p.extend_from_slice(&start.to_le_bytes());
                p.extend_from_slice(&end.to_le_bytes());
                push_array(&mut p, uuid);
                (class::ATTCLIENT, 0x02)
            }
            Event::FindInformationFound {
                connection,
                handle,
                uuid,
            } => {
                p.push(*connection);
                p.extend_from_slice(&handle.to_le_bytes());
                push_array(&mut p, uuid);
                (class::ATTCLIENT, 0x04)
            }
            Event::ProcedureCompleted {
                connection,
                result,
                handle,
            } => {
                p.push(*connection);
                p.extend_from_slice(&result.to_le_bytes());
                p.extend_from_slice(&handle.to_le_bytes());
                (class::ATTCLIENT, 0x01)
            }
            Event::AttributeValue {
                connection,
                handle,
                value_type,
                value,
            } => {
                p.push(*connection);
                p.extend_from_slice(&handle.to_le_bytes());
                p.push(*value_type);
                push_array(&mut p, value);
                (class::ATTCLIENT, 0x05)
            }
        };
        Packet {
            is_event: true,
            class,
            id,
            payload: p,
        }
    }
}

// ── Stream reassembly ────────────────────────────────────────────────────────

/// Incrementally assembles BGAPI packets from a raw serial byte stream.
///
/// Bytes are fed one at a time with [`PacketReader::push`]; a complete
/// [`Packet`] is returned as soon as its last payload byte arrives.  A first
/// byte whose technology bits are not BLE cannot start a packet and is
/// dropped so the reader can re-synchronise on garbage.
///
/// A packet that stops arriving half-way is abandoned by
/// [`PacketReader::check_timeout`] once it is older than the configured
/// timeout, mirroring the radio library's parser-timeout condition.
///
/// ```
/// # use std::time::Instant;
/// # use ecg_ble::bgapi::PacketReader;
/// let mut reader = PacketReader::default();
/// let now = Instant::now();
/// let bytes = [0x80, 0x03, 0x03, 0x04, 0x02, 0x13, 0x00];
/// let mut out = None;
/// for b in bytes {
///     out = reader.push(b, now);
/// }
/// assert_eq!(out.unwrap().payload, vec![0x02, 0x13, 0x00]);
/// ```
pub struct PacketReader {
    buffer: Vec<u8>,
    expected: usize,
    started: Option<Instant>,
    timeout: Duration,
}

impl PacketReader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            expected: 0,
            started: None,
            timeout,
        }
    }

    /// Feed one byte.  Returns a packet when `byte` completes one.
    pub fn push(&mut self, byte: u8, now: Instant) -> Option<Packet> {
        if self.buffer.is_empty() {
            // Technology type must be BLE (0); anything else is line noise.
            if byte & 0x78 != 0 {
                log::debug!("BGAPI: dropping stray byte 0x{byte:02x}");
                return None;
            }
            self.started = Some(now);
        }
        self.buffer.push(byte);

        if self.buffer.len() == 2 {
            self.expected = HEADER_LEN + (((self.buffer[0] & 0x07) as usize) << 8 | byte as usize);
        }
        if self.buffer.len() >= HEADER_LEN && self.buffer.len() == self.expected {
            let packet = Packet {
                is_event: self.buffer[0] & 0x80 != 0,
                class: self.buffer[2],
                id: self.buffer[3],
                payload: self.buffer[HEADER_LEN..].to_vec(),
            };
            self.reset();
            return Some(packet);
        }
        None
    }

    /// Discard a partial packet older than the timeout.
    ///
    /// Returns `true` if something was discarded.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        match self.started {
            Some(started) if now.duration_since(started) > self.timeout => {
                log::debug!(
                    "BGAPI: discarding {} byte partial packet after timeout",
                    self.buffer.len()
                );
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// `true` while a packet is partially received.
    pub fn in_progress(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.expected = 0;
        self.started = None;
    }
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new(DEFAULT_PARSER_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(reader: &mut PacketReader, bytes: &[u8], now: Instant) -> Vec<Packet> {
        bytes.iter().filter_map(|&b| reader.push(b, now)).collect()
    }

    #[test]
    fn connect_direct_layout() {
        let cmd = Command::GapConnectDirect {
            address: Address([1, 2, 3, 4, 5, 6]),
            address_type: AddressType::Public,
            conn_interval_min: 0x20,
            conn_interval_max: 0x30,
            timeout: 0x100,
            latency: 0,
        };
        assert_eq!(
            cmd.encode(false),
            vec![
                0x00, 0x0f, 0x06, 0x03, // header
                1, 2, 3, 4, 5, 6, 0x00, // address, type
                0x20, 0x00, 0x30, 0x00, 0x00, 0x01, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn group_type_read_carries_length_prefixed_uuid() {
        let cmd = Command::ReadByGroupType {
            connection: 2,
            start: 0x0001,
            end: 0xFFFF,
            uuid: vec![0x00, 0x28],
        };
        assert_eq!(
            cmd.encode(false),
            vec![0x00, 0x08, 0x04, 0x01, 0x02, 0x01, 0x00, 0xff, 0xff, 0x02, 0x00, 0x28]
        );
    }

    #[test]
    fn packet_mode_prefixes_total_length() {
        let bytes = Command::GapEndProcedure.encode(true);
        assert_eq!(bytes, vec![0x04, 0x00, 0x00, 0x06, 0x04]);
    }

    #[test]
    fn events_survive_the_wire() {
        let event = Event::ScanResponse {
            rssi: -60,
            packet_type: 4,
            sender: Address([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]),
            address_type: AddressType::Random,
            bond: 0xff,
            data: vec![0x03, 0x09, b'h', b'i'],
        };
        let mut reader = PacketReader::default();
        let packets = feed(&mut reader, &event.to_packet().to_bytes(), Instant::now());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].decode_event().unwrap(), Some(event));
    }

    #[test]
    fn reader_handles_back_to_back_packets_and_noise() {
        let a = Event::ProcedureCompleted {
            connection: 0,
            result: 0,
            handle: 0x25,
        }
        .to_packet()
        .to_bytes();
        let b = Event::ConnectionDisconnected {
            connection: 0,
            reason: 0x0213,
        }
        .to_packet()
        .to_bytes();
        let mut stream = vec![0x7f];
        stream.extend(&a);
        stream.extend(&b);

        let mut reader = PacketReader::default();
        let packets = feed(&mut reader, &stream, Instant::now());
        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[1].decode_event().unwrap(),
            Some(Event::ConnectionDisconnected {
                connection: 0,
                reason: 0x0213
            })
        );
    }

    #[test]
    fn stalled_partial_packet_times_out() {
        let mut reader = PacketReader::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(feed(&mut reader, &[0x80, 0x05, 0x04], t0).is_empty());
        assert!(reader.in_progress());
        assert!(!reader.check_timeout(t0 + Duration::from_millis(50)));
        assert!(reader.check_timeout(t0 + Duration::from_millis(150)));
        assert!(!reader.in_progress());
    }

    #[test]
    fn truncated_event_is_reported() {
        let packet = Packet {
            is_event: true,
            class: 0x04,
            id: 0x05,
            payload: vec![0x00, 0x25],
        };
        assert_eq!(
            packet.decode_event(),
            Err(DecodeError::TruncatedPacket {
                class: 0x04,
                id: 0x05,
                offset: 1
            })
        );
    }

    #[test]
    fn responses_and_unknown_events_are_not_decoded() {
        let response = Packet {
            is_event: false,
            class: 0x06,
            id: 0x02,
            payload: vec![0x00, 0x00],
        };
        assert_eq!(response.decode_event(), Ok(None));
        let unknown = Packet {
            is_event: true,
            class: 0x00,
            id: 0x00,
            payload: vec![],
        };
        assert_eq!(unknown.decode_event(), Ok(None));
    }

    #[test]
    fn only_attribute_and_link_commands_name_a_connection() {
        let write = Command::AttributeWrite {
            connection: 2,
            handle: 0x13,
            data: vec![0x01, 0x00],
        };
        assert_eq!(write.connection(), Some(2));
        assert_eq!(
            Command::ConnectionDisconnect { connection: 0 }.connection(),
            Some(0)
        );
        assert_eq!(Command::GapDiscover { mode: 1 }.connection(), None);
        assert_eq!(Command::GapEndProcedure.connection(), None);
    }
}
