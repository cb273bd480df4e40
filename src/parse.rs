//! Binary decoders for advertisement and ECG notification payloads.
//!
//! All public functions in this module are pure (no I/O, no allocation beyond
//! the returned collections) and are safe to call from any async or sync context.
//!
//! | Function | Input | Output |
//! |---|---|---|
//! | [`decode_advertisement_fields`] | raw AD payload | length-prefixed [`AdField`]s |
//! | [`advertised_names`] | decoded fields | complete local names (type `0x09`) |
//! | [`decode_ecg_fragment`] | 3 stored bytes | one `f32` ECG value |
//! | [`decode_sample`] | notification payload | [`EcgSample`] |

use crate::error::DecodeError;
use crate::protocol::{
    AD_TYPE_COMPLETE_LOCAL_NAME, ECG_FRAGMENT_LEN, ECG_VALUE_OFFSETS, SAMPLE_PAYLOAD_MIN_LEN,
};
use crate::types::EcgSample;

// ── Advertisements ───────────────────────────────────────────────────────────

/// One advertisement data structure: `[len, ad_type, data[len - 1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdField {
    pub ad_type: u8,
    pub data: Vec<u8>,
}

/// Split an advertisement payload into its length-prefixed fields.
///
/// Each field starts with a length byte counting the type byte and the data
/// that follow it.  Zero length bytes are padding and are skipped.  A length
/// that runs past the end of the buffer is a [`DecodeError::TruncatedAdField`].
///
/// ```
/// # use ecg_ble::parse::decode_advertisement_fields;
/// let fields = decode_advertisement_fields(&[0x02, 0x01, 0x06, 0x03, 0x09, b'h', b'i']).unwrap();
/// assert_eq!(fields.len(), 2);
/// assert_eq!(fields[1].data, b"hi");
/// ```
pub fn decode_advertisement_fields(data: &[u8]) -> Result<Vec<AdField>, DecodeError> {
    let mut fields = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 {
            i += 1;
            continue;
        }
        let remaining = data.len() - i - 1;
        if len > remaining {
            return Err(DecodeError::TruncatedAdField {
                offset: i,
                len,
                remaining,
            });
        }
        fields.push(AdField {
            ad_type: data[i + 1],
            data: data[i + 2..i + 1 + len].to_vec(),
        });
        i += len + 1;
    }
    Ok(fields)
}

/// Collect every complete local name (AD type `0x09`) among `fields`.
///
/// Names are decoded as UTF-8; invalid sequences are replaced rather than
/// rejected, since the name is only ever compared against the target.
pub fn advertised_names(fields: &[AdField]) -> Vec<String> {
    fields
        .iter()
        .filter(|f| f.ad_type == AD_TYPE_COMPLETE_LOCAL_NAME)
        .map(|f| String::from_utf8_lossy(&f.data).into_owned())
        .collect()
}

// ── ECG values ───────────────────────────────────────────────────────────────

/// Which byte of the 4-byte IEEE-754 value the sensor leaves off the wire.
///
/// The three stored bytes always arrive low byte first.  The firmware is
/// documented to drop the most significant byte (assumed zero), but the
/// vendor's reference collector reassembles the value with the zero byte in
/// the least significant position instead.  Both readings are supported; the
/// format is lossy either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentLayout {
    /// `bits = b2 << 16 | b1 << 8 | b0`; the omitted high byte is zero.
    #[default]
    HighByteOmitted,
    /// `bits = b2 << 24 | b1 << 16 | b0 << 8`; the omitted low byte is zero.
    LowByteOmitted,
}

/// Rebuild one ECG value from its three stored bytes.
///
/// For [`FragmentLayout::HighByteOmitted`] the bytes are reversed into
/// big-endian order behind a zero pad byte and parsed as a big-endian `f32`.
/// Every 3-byte input maps to some `f32` (possibly NaN); this never panics.
///
/// ```
/// # use ecg_ble::parse::{decode_ecg_fragment, FragmentLayout};
/// assert_eq!(decode_ecg_fragment([0x00, 0xc0, 0x3f], FragmentLayout::LowByteOmitted), 1.5);
/// ```
pub fn decode_ecg_fragment(bytes: [u8; ECG_FRAGMENT_LEN], layout: FragmentLayout) -> f32 {
    let [b0, b1, b2] = bytes;
    match layout {
        FragmentLayout::HighByteOmitted => f32::from_be_bytes([0x00, b2, b1, b0]),
        FragmentLayout::LowByteOmitted => f32::from_be_bytes([b2, b1, b0, 0x00]),
    }
}

/// Store `value` the way the sensor does, dropping the byte `layout` omits.
///
/// Inverse of [`decode_ecg_fragment`] for every value whose omitted byte is
/// zero.  Used by the simulator and by tests.
pub fn encode_ecg_fragment(value: f32, layout: FragmentLayout) -> [u8; ECG_FRAGMENT_LEN] {
    let [b3, b2, b1, b0] = value.to_be_bytes();
    match layout {
        FragmentLayout::HighByteOmitted => [b0, b1, b2],
        FragmentLayout::LowByteOmitted => [b1, b2, b3],
    }
}

/// Read the little-endian packet counter from the first two payload bytes.
///
/// Returns `None` if `data` is shorter than 2 bytes.
pub fn decode_packet_counter(data: &[u8]) -> Option<u16> {
    match data {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Decode an ECG measurement notification into an [`EcgSample`].
///
/// Layout (see [`crate::protocol::ECG_VALUE_OFFSETS`]):
///
/// | Bytes | Field | Notes |
/// |---|---|---|
/// | 0–1 | packet counter | u16 LE, only read when `counter_mode` is set |
/// | 5–7 | ECG value 0 | 3-byte fragment |
/// | 14–16 | ECG value 1 | 3-byte fragment |
///
/// Returns [`DecodeError::ShortSample`] if `data` is shorter than 17 bytes.
pub fn decode_sample(
    data: &[u8],
    counter_mode: bool,
    layout: FragmentLayout,
) -> Result<EcgSample, DecodeError> {
    if data.len() < SAMPLE_PAYLOAD_MIN_LEN {
        return Err(DecodeError::ShortSample {
            len: data.len(),
            needed: SAMPLE_PAYLOAD_MIN_LEN,
        });
    }

    let value = |off: usize| {
        decode_ecg_fragment([data[off], data[off + 1], data[off + 2]], layout)
    };

    Ok(EcgSample {
        counter: if counter_mode {
            decode_packet_counter(data)
        } else {
            None
        },
        values: [value(ECG_VALUE_OFFSETS[0]), value(ECG_VALUE_OFFSETS[1])],
    })
}

/// Build a notification payload as the sensor would send it.
///
/// The result is 20 bytes long; bytes that carry no decoded field are zero.
pub fn encode_sample(counter: u16, values: [f32; 2], layout: FragmentLayout) -> Vec<u8> {
    let mut payload = vec![0u8; 20];
    payload[..2].copy_from_slice(&counter.to_le_bytes());
    for (&off, &v) in ECG_VALUE_OFFSETS.iter().zip(values.iter()) {
        payload[off..off + ECG_FRAGMENT_LEN].copy_from_slice(&encode_ecg_fragment(v, layout));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_field(name: &str) -> Vec<u8> {
        let mut field = vec![name.len() as u8 + 1, AD_TYPE_COMPLETE_LOCAL_NAME];
        field.extend_from_slice(name.as_bytes());
        field
    }

    #[test]
    fn advertisement_names_are_extracted() {
        let mut data = vec![0x02, 0x01, 0x06];
        data.extend(name_field("ECGICGMONITOR"));
        data.extend([0x03, 0x03, 0x0d, 0x18]);

        let fields = decode_advertisement_fields(&data).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(advertised_names(&fields), vec!["ECGICGMONITOR".to_string()]);
    }

    #[test]
    fn zero_padding_is_skipped() {
        let mut data = name_field("abc");
        data.extend([0, 0, 0]);
        let fields = decode_advertisement_fields(&data).unwrap();
        assert_eq!(advertised_names(&fields), vec!["abc".to_string()]);
    }

    #[test]
    fn truncated_field_is_an_error() {
        let data = [0x02, 0x01, 0x06, 0x09, 0x09, b'E'];
        assert_eq!(
            decode_advertisement_fields(&data),
            Err(DecodeError::TruncatedAdField {
                offset: 3,
                len: 9,
                remaining: 2
            })
        );
    }

    #[test]
    fn type_only_field_has_empty_data() {
        let fields = decode_advertisement_fields(&[0x01, 0x09]).unwrap();
        assert_eq!(advertised_names(&fields), vec![String::new()]);
    }

    #[test]
    fn high_byte_omitted_round_trip() {
        for bits in [0x0000_0001u32, 0x0012_3456, 0x00ff_ffff, 0x0080_0000] {
            let v = f32::from_bits(bits);
            let stored = encode_ecg_fragment(v, FragmentLayout::HighByteOmitted);
            let back = decode_ecg_fragment(stored, FragmentLayout::HighByteOmitted);
            assert_eq!(back.to_bits(), bits);
        }
    }

    #[test]
    fn high_byte_omitted_reverses_stored_bytes() {
        let v = decode_ecg_fragment([0x56, 0x34, 0x12], FragmentLayout::HighByteOmitted);
        assert_eq!(v.to_bits(), 0x0012_3456);
    }

    #[test]
    fn low_byte_omitted_round_trip() {
        for v in [1.5f32, -0.25, 0.0, 1024.0, -3.0e-3_f32] {
            let v = f32::from_bits(v.to_bits() & 0xffff_ff00);
            let stored = encode_ecg_fragment(v, FragmentLayout::LowByteOmitted);
            assert_eq!(decode_ecg_fragment(stored, FragmentLayout::LowByteOmitted), v);
        }
    }

    #[test]
    fn decoding_any_fragment_does_not_panic() {
        for hi in (0..=255u8).step_by(7) {
            for mid in (0..=255u8).step_by(5) {
                for lo in [0u8, 1, 0x7f, 0x80, 0xff] {
                    let _ = decode_ecg_fragment([lo, mid, hi], FragmentLayout::HighByteOmitted);
                    let _ = decode_ecg_fragment([lo, mid, hi], FragmentLayout::LowByteOmitted);
                }
            }
        }
        let _ = decode_ecg_fragment([0xff, 0xff, 0xff], FragmentLayout::LowByteOmitted);
    }

    #[test]
    fn sample_values_come_from_fixed_offsets() {
        let mut data = vec![0u8; 20];
        data[0] = 0x34;
        data[1] = 0x12;
        data[5..8].copy_from_slice(&[0x00, 0xc0, 0x3f]); // 1.5
        data[14..17].copy_from_slice(&[0x00, 0x80, 0xbe]); // -0.25

        let s = decode_sample(&data, true, FragmentLayout::LowByteOmitted).unwrap();
        assert_eq!(s.counter, Some(0x1234));
        assert_eq!(s.values, [1.5, -0.25]);

        let s = decode_sample(&data, false, FragmentLayout::LowByteOmitted).unwrap();
        assert_eq!(s.counter, None);
    }

    #[test]
    fn encoded_sample_decodes_back() {
        let payload = encode_sample(7, [1.5, -2.0], FragmentLayout::LowByteOmitted);
        let s = decode_sample(&payload, true, FragmentLayout::LowByteOmitted).unwrap();
        assert_eq!(s.counter, Some(7));
        assert_eq!(s.values, [1.5, -2.0]);
    }

    #[test]
    fn short_sample_is_rejected() {
        assert_eq!(
            decode_sample(&[0u8; 16], false, FragmentLayout::default()),
            Err(DecodeError::ShortSample { len: 16, needed: 17 })
        );
        assert!(decode_sample(&[0u8; 17], false, FragmentLayout::default()).is_ok());
    }

    #[test]
    fn packet_counter_is_little_endian() {
        assert_eq!(decode_packet_counter(&[0x01, 0x02, 0xff]), Some(0x0201));
        assert_eq!(decode_packet_counter(&[0x01]), None);
    }
}
