//! Advertisement filtering: pick the sensor out of the scan-response stream.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::bgapi::Command;
use crate::error::DecodeError;
use crate::parse::{advertised_names, decode_advertisement_fields};
use crate::protocol::{
    CONNECTION_INTERVAL_MAX, CONNECTION_INTERVAL_MIN, SLAVE_LATENCY, SUPERVISION_TIMEOUT,
};
use crate::types::{Address, AddressType, Peripheral};

/// Matches advertisements against a target local name and remembers every
/// peripheral it has already picked.
///
/// A peripheral is reported once, on the first advertisement that carries the
/// target name; repeats from the same address are ignored until
/// [`Scanner::forget`] is called for it.
#[derive(Debug, Clone)]
pub struct Scanner {
    target_name: String,
    known: BTreeSet<Address>,
}

impl Scanner {
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            known: BTreeSet::new(),
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Inspect one scan response.
    ///
    /// Returns the peripheral if this is the first advertisement from `sender`
    /// that carries the target name.  Malformed advertisement data is a
    /// [`DecodeError`]; the caller skips it.
    pub fn on_scan_response(
        &mut self,
        sender: Address,
        address_type: AddressType,
        data: &[u8],
    ) -> Result<Option<Peripheral>, DecodeError> {
        let fields = decode_advertisement_fields(data)?;
        let names = advertised_names(&fields);
        if !names.iter().any(|n| *n == self.target_name) {
            return Ok(None);
        }
        if !self.known.insert(sender) {
            debug!("scanner: {sender} already seen, ignoring");
            return Ok(None);
        }
        info!("scanner: found {} at {sender}", self.target_name);
        Ok(Some(Peripheral {
            address: sender,
            address_type,
        }))
    }

    /// Drop `address` from the known set so its next advertisement matches again.
    pub fn forget(&mut self, address: &Address) {
        self.known.remove(address);
    }

    /// Addresses picked so far.
    pub fn known(&self) -> impl Iterator<Item = &Address> {
        self.known.iter()
    }
}

/// `gap_connect_direct` to `peripheral` with the fixed link parameters.
pub fn connect_command(peripheral: &Peripheral) -> Command {
    Command::GapConnectDirect {
        address: peripheral.address,
        address_type: peripheral.address_type,
        conn_interval_min: CONNECTION_INTERVAL_MIN,
        conn_interval_max: CONNECTION_INTERVAL_MAX,
        timeout: SUPERVISION_TIMEOUT,
        latency: SLAVE_LATENCY,
    }
}
