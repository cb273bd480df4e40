//! GATT UUIDs, radio parameters, and wire-format helpers for the ECG sensor.
//!
//! The sensor's vendor UUIDs all live in the namespace
//! `f000XXXX-0451-4000-b000-000000000000`.  Standard attribute types
//! (primary service, CCC descriptor) are 16-bit UUIDs expanded against the
//! Bluetooth base UUID.

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Advertised complete local name of the sensor.
///
/// Used as the scan filter: only peripherals whose advertisement carries this
/// exact name (AD type `0x09`) are connected to.
pub const DEFAULT_DEVICE_NAME: &str = "ECGICGMONITOR";

/// Vendor GATT service carrying the ECG measurement and switch characteristics.
pub const ECG_SERVICE_UUID: Uuid = Uuid::from_u128(0xf000aa10_0451_4000_b000_000000000000);

// ── Characteristics ───────────────────────────────────────────────────────────

/// ECG measurement characteristic.  Pushes sample payloads as notifications
/// once its CCC descriptor has been written with [`NOTIFICATIONS_ENABLE`].
pub const ECG_MEASUREMENT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa11_0451_4000_b000_000000000000);

/// ECG switch characteristic.  The sensor front-end is powered down by
/// default; writing [`SWITCH_ON`] here starts the acquisition.
pub const ECG_SWITCH_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa12_0451_4000_b000_000000000000);

/// `0x2800` — attribute type of a primary service declaration.
pub const PRIMARY_SERVICE_UUID: u16 = 0x2800;

/// `0x2902` — Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: u16 = 0x2902;

/// Value written to the switch characteristic to power the ECG front-end on.
pub const SWITCH_ON: [u8; 1] = [0x01];

/// CCC value enabling notifications (little-endian `0x0001`).
pub const NOTIFICATIONS_ENABLE: [u8; 2] = [0x01, 0x00];

// ── Advertising & link parameters ─────────────────────────────────────────────

/// AD type of the "complete local name" field.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Connection-status flag bits that mean "connected" (bit 0) and
/// "connection completed" (bit 2).  Both must be set.
pub const CONNECTION_ESTABLISHED_MASK: u8 = 0x05;

/// Minimum connection interval requested by `gap_connect_direct` (× 1.25 ms).
pub const CONNECTION_INTERVAL_MIN: u16 = 0x20;

/// Maximum connection interval requested by `gap_connect_direct` (× 1.25 ms).
pub const CONNECTION_INTERVAL_MAX: u16 = 0x30;

/// Supervision timeout requested by `gap_connect_direct` (× 10 ms).
pub const SUPERVISION_TIMEOUT: u16 = 0x100;

/// Slave latency requested by `gap_connect_direct`.
pub const SLAVE_LATENCY: u16 = 0;

/// Scan interval and window (× 0.625 ms) used by `gap_set_scan_parameters`.
pub const SCAN_INTERVAL: u16 = 0xC8;
pub const SCAN_WINDOW: u16 = 0xC8;

/// Active scanning, so scan responses carrying the local name are requested.
pub const SCAN_ACTIVE: u8 = 1;

/// `gap_discover` mode: generic discoverable peripherals.
pub const DISCOVER_GENERIC: u8 = 1;

/// First and last attribute handles searched during service discovery.
pub const FIRST_HANDLE: u16 = 0x0001;
pub const LAST_HANDLE: u16 = 0xFFFF;

// ── Sample payload layout ─────────────────────────────────────────────────────

/// Byte offsets of the two 3-byte ECG fragments inside a notification.
///
/// ```text
/// [0..2]   packet counter (u16 LE, counter mode only)
/// [5..8]   ECG value 0
/// [14..17] ECG value 1
/// ```
pub const ECG_VALUE_OFFSETS: [usize; 2] = [5, 14];

/// Stored length of one ECG value (a 4-byte float with one byte omitted).
pub const ECG_FRAGMENT_LEN: usize = 3;

/// Shortest notification that carries both ECG values.
pub const SAMPLE_PAYLOAD_MIN_LEN: usize = 17;

// ── Buffering ─────────────────────────────────────────────────────────────────

/// Number of ECG values kept in the rolling sample buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Number of packet counters collected before a packet-loss report.
pub const LOSS_WINDOW: usize = 250;

// ── UUID wire helpers ─────────────────────────────────────────────────────────

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Mask selecting the part of a UUID that the 16/32-bit short forms share
/// with the base UUID.
const BASE_MASK: u128 = (1 << 96) - 1;

/// Expand a 16-bit SIG-assigned UUID against the Bluetooth base UUID.
///
/// ```
/// # use ecg_ble::protocol::uuid16;
/// assert_eq!(uuid16(0x2902).to_string(), "00002902-0000-1000-8000-00805f9b34fb");
/// ```
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Interpret a UUID as carried in BGAPI packets.
///
/// The radio transmits UUIDs little-endian: 2 bytes for 16-bit, 4 bytes for
/// 32-bit, 16 bytes for full 128-bit UUIDs.  Any other length is not a UUID
/// and yields `None`.
pub fn uuid_from_wire(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => {
            let short = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Some(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
        }
        16 => {
            let mut be = [0u8; 16];
            for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
                *dst = *src;
            }
            Some(Uuid::from_bytes(be))
        }
        _ => None,
    }
}

/// Encode a UUID the way BGAPI expects it: the shortest little-endian form.
///
/// UUIDs derived from the base UUID with a 16-bit value shrink to 2 bytes;
/// everything else is sent as 16 reversed bytes.
///
/// ```
/// # use ecg_ble::protocol::{uuid16, uuid_to_wire, PRIMARY_SERVICE_UUID};
/// assert_eq!(uuid_to_wire(&uuid16(PRIMARY_SERVICE_UUID)), vec![0x00, 0x28]);
/// ```
pub fn uuid_to_wire(uuid: &Uuid) -> Vec<u8> {
    let value = uuid.as_u128();
    if value & BASE_MASK == BLUETOOTH_BASE_UUID && (value >> 96) <= 0xFFFF {
        return ((value >> 96) as u16).to_le_bytes().to_vec();
    }
    let mut bytes = uuid.as_bytes().to_vec();
    bytes.reverse();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_uuid_round_trips_through_wire_order() {
        let wire = uuid_to_wire(&ECG_SERVICE_UUID);
        assert_eq!(wire.len(), 16);
        // Least significant byte first.
        assert_eq!(wire[0], 0x00);
        assert_eq!(&wire[12..], &[0x10, 0xaa, 0x00, 0xf0]);
        assert_eq!(uuid_from_wire(&wire), Some(ECG_SERVICE_UUID));
    }

    #[test]
    fn short_uuids_expand_against_base() {
        assert_eq!(
            uuid_from_wire(&[0x02, 0x29]),
            Some(uuid16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID))
        );
        assert_eq!(uuid_to_wire(&uuid16(0x2902)), vec![0x02, 0x29]);
        assert_eq!(uuid_from_wire(&[0x0d, 0x18, 0x00, 0x00]), Some(uuid16(0x180d)));
    }

    #[test]
    fn odd_lengths_are_not_uuids() {
        assert_eq!(uuid_from_wire(&[]), None);
        assert_eq!(uuid_from_wire(&[1, 2, 3]), None);
    }
}
