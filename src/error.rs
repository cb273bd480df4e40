use thiserror::Error;

use crate::types::DiscoveryState;

/// A payload that could not be decoded.  The offending unit is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("advertisement field at offset {offset} claims {len} bytes but only {remaining} remain")]
    TruncatedAdField {
        offset: usize,
        len: usize,
        remaining: usize,
    },

    #[error("sample payload is {len} bytes, need at least {needed}")]
    ShortSample { len: usize, needed: usize },

    #[error("packet {class:#04x}/{id:#04x} truncated at byte {offset}")]
    TruncatedPacket { class: u8, id: u8, offset: usize },
}

/// Discovery did not make progress.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// A procedure completed without yielding the handle the next step needs.
    /// The state machine stays put until its phase deadline retries it.
    #[error("{missing} not found while {state}")]
    Stalled {
        state: DiscoveryState,
        missing: &'static str,
    },

    /// The phase deadline expired `attempts` times.
    #[error("discovery failed while {state} after {attempts} attempts")]
    Failed {
        state: DiscoveryState,
        attempts: u32,
    },
}

/// Top-level error type of the collector.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("BGAPI parser timed out; make sure the radio is in a known idle state")]
    TransportTimeout,

    #[error("transport closed")]
    TransportClosed,

    #[error("cannot open serial port {port} at {baud} baud: {source}")]
    SerialOpen {
        port: String,
        baud: u32,
        #[source]
        source: serialport::Error,
    },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::TruncatedAdField {
            offset: 3,
            len: 9,
            remaining: 4,
        };
        assert_eq!(
            err.to_string(),
            "advertisement field at offset 3 claims 9 bytes but only 4 remain"
        );

        let err = DecodeError::TruncatedPacket {
            class: 4,
            id: 5,
            offset: 3,
        };
        assert_eq!(err.to_string(), "packet 0x04/0x05 truncated at byte 3");

        let err = DiscoveryError::Stalled {
            state: DiscoveryState::FindingAttributes,
            missing: "ECG switch characteristic",
        };
        assert_eq!(
            err.to_string(),
            "ECG switch characteristic not found while finding attributes"
        );

        let err: CollectorError = DiscoveryError::Failed {
            state: DiscoveryState::FindingServices,
            attempts: 3,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "discovery failed while finding services after 3 attempts"
        );
    }
}
