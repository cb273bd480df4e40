//! GATT discovery state machine.
//!
//! Drives one peripheral from "connect requested" to "notifications enabled":
//!
//! ```text
//! Standby ─connect─▶ Connecting ─status 0x05─▶ FindingServices ─completed─▶
//!     FindingAttributes ─completed─▶ Listening
//! ```
//!
//! Service search and attribute search both finish with the same
//! `attclient_procedure_completed` event, so the handler branches on the
//! current [`DiscoveryState`] rather than on anything in the event itself.
//!
//! The machine performs no I/O.  Every transition returns the commands to
//! send as [`Outgoing`] values; a command that must wait (the CCC write after
//! the sensor switch) carries its delay instead of the machine sleeping.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::bgapi::Command;
use crate::error::DiscoveryError;
use crate::protocol::{
    uuid16, uuid_from_wire, uuid_to_wire, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
    CONNECTION_ESTABLISHED_MASK, ECG_MEASUREMENT_CHARACTERISTIC, ECG_SERVICE_UUID,
    ECG_SWITCH_CHARACTERISTIC, FIRST_HANDLE, LAST_HANDLE, NOTIFICATIONS_ENABLE,
    PRIMARY_SERVICE_UUID, SWITCH_ON,
};
use crate::scanner::connect_command;
use crate::types::{Address, CharacteristicHandles, DiscoveryState, HandleRange, Peripheral};

/// A command produced by a transition, to be sent after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub command: Command,
    pub delay: Duration,
}

impl Outgoing {
    pub fn now(command: Command) -> Self {
        Self {
            command,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration, command: Command) -> Self {
        Self { command, delay }
    }
}

/// Parameters of the discovery sequence.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Service searched for with the primary-service group read.
    pub service: Uuid,
    /// Characteristic whose notifications carry ECG samples.
    pub measurement: Uuid,
    /// Characteristic that powers the sensor on.
    pub switch: Uuid,
    /// Pause between the switch write and the CCC write.
    pub switch_settle: Duration,
    /// How long one phase may run before it is re-issued.
    pub procedure_timeout: Duration,
    /// Total tries per phase before giving up.
    pub max_attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service: ECG_SERVICE_UUID,
            measurement: ECG_MEASUREMENT_CHARACTERISTIC,
            switch: ECG_SWITCH_CHARACTERISTIC,
            switch_settle: Duration::from_millis(200),
            procedure_timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Everything learned about the current peripheral.
#[derive(Debug, Clone)]
struct Session {
    peripheral: Peripheral,
    connection: Option<u8>,
    range: HandleRange,
    handles: CharacteristicHandles,
}

/// The discovery state machine for a single peripheral connection.
pub struct Discovery {
    config: DiscoveryConfig,
    state: DiscoveryState,
    session: Option<Session>,
    /// When the current phase is retried.  `None` outside the discovery phases.
    deadline: Option<Instant>,
    /// Tries of the current phase so far, the first one included.
    attempts: u32,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            state: DiscoveryState::Standby,
            session: None,
            deadline: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn peripheral(&self) -> Option<Peripheral> {
        self.session.as_ref().map(|s| s.peripheral)
    }

    /// Connection handle, once the link is established.
    pub fn connection(&self) -> Option<u8> {
        self.session.as_ref().and_then(|s| s.connection)
    }

    /// Handle range of the ECG service (`end == 0` until found).
    pub fn range(&self) -> HandleRange {
        self.session.as_ref().map(|s| s.range).unwrap_or_default()
    }

    pub fn handles(&self) -> CharacteristicHandles {
        self.session.as_ref().map(|s| s.handles).unwrap_or_default()
    }

    /// `true` when no connection attempt is in flight.
    pub fn can_connect(&self) -> bool {
        self.state.is_idle()
    }

    fn owns(&self, connection: u8) -> bool {
        self.connection() == Some(connection)
    }

    fn enter(&mut self, state: DiscoveryState, now: Instant) {
        debug!("discovery: {} → {state}", self.state);
        self.state = state;
        self.attempts = 1;
        self.deadline = match state {
            DiscoveryState::Connecting
            | DiscoveryState::FindingServices
            | DiscoveryState::FindingAttributes => Some(now + self.config.procedure_timeout),
            _ => None,
        };
    }

    // ── Connecting ───────────────────────────────────────────────────────────

    /// Start connecting to `peripheral`.
    ///
    /// Refused (no commands) while another attempt is in flight.
    pub fn connect(&mut self, peripheral: Peripheral, now: Instant) -> Vec<Outgoing> {
        if !self.can_connect() {
            warn!(
                "discovery: connect to {} refused while {}",
                peripheral.address, self.state
            );
            return vec![];
        }
        self.session = Some(Session {
            peripheral,
            connection: None,
            range: HandleRange::default(),
            handles: CharacteristicHandles::default(),
        });
        self.enter(DiscoveryState::Connecting, now);
        vec![Outgoing::now(connect_command(&peripheral))]
    }

    /// Handle `connection_status`.
    ///
    /// Only a status with both the "connected" and "completed" bits set, for
    /// the peripheral being connected, moves the machine on.  Later status
    /// updates (bonding, encryption) are ignored.
    pub fn on_connection_status(
        &mut self,
        connection: u8,
        flags: u8,
        address: Address,
        now: Instant,
    ) -> Vec<Outgoing> {
        if flags & CONNECTION_ESTABLISHED_MASK != CONNECTION_ESTABLISHED_MASK {
            debug!("discovery: connection {connection} status flags {flags:#04x}, not established");
            return vec![];
        }
        if self.state != DiscoveryState::Connecting {
            debug!("discovery: connection {connection} status while {}, ignoring", self.state);
            return vec![];
        }
        let Some(session) = self.session.as_mut() else {
            return vec![];
        };
        if session.peripheral.address != address {
            warn!(
                "discovery: status for {address} while connecting to {}",
                session.peripheral.address
            );
            return vec![];
        }
        session.connection = Some(connection);
        info!("Connected to {address}");
        self.enter(DiscoveryState::FindingServices, now);
        vec![Outgoing::now(service_search(connection))]
    }

    // ── Finding services ─────────────────────────────────────────────────────

    /// Handle `attclient_group_found`.
    ///
    /// Records the range of the target service.  Several groups arrive per
    /// search; unrelated services are skipped.  If the target service shows
    /// up twice with different ranges the latest one is kept.
    pub fn on_group_found(&mut self, connection: u8, start: u16, end: u16, uuid: &[u8]) {
        if self.state != DiscoveryState::FindingServices || !self.owns(connection) {
            return;
        }
        if uuid_from_wire(uuid) != Some(self.config.service) {
            return;
        }
        let service = self.config.service;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let found = HandleRange { start, end };
        if session.range.is_valid() && session.range != found {
            warn!(
                "discovery: service {service} reported again with range {start}..{end} (was {}..{}); keeping the latest",
                session.range.start, session.range.end
            );
        }
        info!("Found attribute group for service {service}: start={start}, end={end}");
        session.range = found;
    }

    // ── Finding attributes ───────────────────────────────────────────────────

    /// Handle `attclient_find_information_found`.
    ///
    /// Handles fill in attribute-table order.  The CCC descriptor is taken
    /// only once the measurement value is known (the first `0x2902` after it
    /// belongs to it), and the switch only once the CCC is known.
    pub fn on_information_found(&mut self, connection: u8, handle: u16, uuid: &[u8]) {
        if self.state != DiscoveryState::FindingAttributes || !self.owns(connection) {
            return;
        }
        let Some(uuid) = uuid_from_wire(uuid) else {
            return;
        };
        let (measurement, switch) = (self.config.measurement, self.config.switch);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let h = &mut session.handles;

        if uuid == measurement {
            info!("Found ECG measurement attribute {uuid}: handle={handle}");
            h.measurement = handle;
        } else if uuid == uuid16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID) {
            if h.measurement > 0 && h.ccc == 0 {
                info!("Found CCC descriptor: handle={handle}");
                h.ccc = handle;
            }
        } else if uuid == switch {
            if h.ccc > 0 {
                info!("Found ECG switch attribute {uuid}: handle={handle}");
                h.switch = handle;
            } else {
                debug!("discovery: switch at {handle} before measurement CCC, skipped");
            }
        }
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Handle `attclient_procedure_completed`.
    ///
    /// The meaning depends on the current state:
    ///
    /// | State | Meaning | Next |
    /// |---|---|---|
    /// | `FindingServices` | service search done | attribute search in the service range |
    /// | `FindingAttributes` | attribute search done | switch on, then enable notifications |
    /// | anything else | write acknowledged | nothing |
    ///
    /// A search that finished without the handle the next step needs returns
    /// [`DiscoveryError::Stalled`] and leaves the state unchanged.
    pub fn on_procedure_completed(
        &mut self,
        connection: u8,
        now: Instant,
    ) -> Result<Vec<Outgoing>, DiscoveryError> {
        if !self.owns(connection) {
            return Ok(vec![]);
        }
        let (range, handles) = (self.range(), self.handles());

        match self.state {
            DiscoveryState::FindingServices => {
                if !range.is_valid() {
                    return Err(DiscoveryError::Stalled {
                        state: self.state,
                        missing: "ECG service",
                    });
                }
                info!("Found ECG service {}", self.config.service);
                self.enter(DiscoveryState::FindingAttributes, now);
                Ok(vec![Outgoing::now(Command::FindInformation {
                    connection,
                    start: range.start,
                    end: range.end,
                })])
            }
            DiscoveryState::FindingAttributes => {
                if handles.switch == 0 {
                    return Err(DiscoveryError::Stalled {
                        state: self.state,
                        missing: "ECG switch characteristic",
                    });
                }
                info!("Found ECG switch; enabling ECG stream");
                self.enter(DiscoveryState::Listening, now);
                Ok(vec![
                    Outgoing::now(Command::AttributeWrite {
                        connection,
                        handle: handles.switch,
                        data: SWITCH_ON.to_vec(),
                    }),
                    Outgoing::after(
                        self.config.switch_settle,
                        Command::AttributeWrite {
                            connection,
                            handle: handles.ccc,
                            data: NOTIFICATIONS_ENABLE.to_vec(),
                        },
                    ),
                ])
            }
            _ => Ok(vec![]),
        }
    }

    // ── Timeouts ─────────────────────────────────────────────────────────────

    /// Retry the current phase if its deadline has passed.
    ///
    /// The phase's request is re-issued with its partial results cleared.
    /// Once `max_attempts` tries have timed out the machine moves to
    /// [`DiscoveryState::Failed`] and [`DiscoveryError::Failed`] is returned.
    pub fn poll_timeout(&mut self, now: Instant) -> Result<Vec<Outgoing>, DiscoveryError> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Ok(vec![]),
        }

        if self.attempts >= self.config.max_attempts {
            let err = DiscoveryError::Failed {
                state: self.state,
                attempts: self.attempts,
            };
            error!("{err}");
            self.state = DiscoveryState::Failed;
            self.deadline = None;
            return Err(err);
        }

        self.attempts += 1;
        self.deadline = Some(now + self.config.procedure_timeout);
        warn!(
            "discovery: {} timed out, retrying (attempt {}/{})",
            self.state, self.attempts, self.config.max_attempts
        );

        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            return Ok(vec![]);
        };
        let commands = match (state, session.connection) {
            (DiscoveryState::Connecting, _) => vec![
                Outgoing::now(Command::GapEndProcedure),
                Outgoing::now(connect_command(&session.peripheral)),
            ],
            (DiscoveryState::FindingServices, Some(connection)) => {
                session.range = HandleRange::default();
                vec![Outgoing::now(service_search(connection))]
            }
            (DiscoveryState::FindingAttributes, Some(connection)) => {
                session.handles = CharacteristicHandles::default();
                vec![Outgoing::now(Command::FindInformation {
                    connection,
                    start: session.range.start,
                    end: session.range.end,
                })]
            }
            _ => vec![],
        };
        Ok(commands)
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Handle `connection_disconnected`.
    ///
    /// Clears the session and returns the peripheral that was lost.  Ignored
    /// for other connections and once discovery has failed.
    pub fn on_disconnected(&mut self, connection: u8) -> Option<Peripheral> {
        if self.state == DiscoveryState::Failed || !self.owns(connection) {
            return None;
        }
        let session = self.session.take()?;
        info!("Disconnected from {}", session.peripheral.address);
        self.state = DiscoveryState::Disconnected;
        self.deadline = None;
        self.attempts = 0;
        Some(session.peripheral)
    }

    /// `true` if `(connection, handle)` is the measurement value of this session.
    pub fn is_measurement(&self, connection: u8, handle: u16) -> bool {
        self.session.as_ref().is_some_and(|s| {
            s.connection == Some(connection)
                && s.handles.measurement != 0
                && s.handles.measurement == handle
        })
    }
}

/// Primary-service group read over the whole handle space.
fn service_search(connection: u8) -> Command {
    Command::ReadByGroupType {
        connection,
        start: FIRST_HANDLE,
        end: LAST_HANDLE,
        uuid: uuid_to_wire(&uuid16(PRIMARY_SERVICE_UUID)),
    }
}
