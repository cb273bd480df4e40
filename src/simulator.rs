//! A fake BGAPI radio with an ECG sensor in range.
//!
//! Answers the collector's commands over a [`ChannelTransport`] the way a
//! real radio would and, once the sensor is switched on and notifications are
//! enabled, streams a synthetic PQRST waveform.  Used by the `--simulate`
//! mode of the binaries and by the integration tests.

use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::bgapi::{Command, Event};
use crate::parse::{encode_sample, FragmentLayout};
use crate::protocol::{
    uuid16, uuid_to_wire, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID, DEFAULT_DEVICE_NAME,
    ECG_MEASUREMENT_CHARACTERISTIC, ECG_SERVICE_UUID, ECG_SWITCH_CHARACTERISTIC,
    NOTIFICATIONS_ENABLE, PRIMARY_SERVICE_UUID, SWITCH_ON,
};
use crate::transport::{ChannelTransport, RadioEnd};
use crate::types::{Address, AddressType};

const CONNECTION: u8 = 0;

/// Service table of the simulated sensor: `(start, end, uuid)`.
fn services() -> Vec<(u16, u16, Vec<u8>)> {
    vec![
        (0x0001, 0x000b, uuid_to_wire(&uuid16(0x1800))),
        (0x000c, 0x000f, uuid_to_wire(&uuid16(0x1801))),
        (0x0023, 0x002c, uuid_to_wire(&ECG_SERVICE_UUID)),
    ]
}

const MEASUREMENT_HANDLE: u16 = 0x0025;
const CCC_HANDLE: u16 = 0x0026;
const SWITCH_HANDLE: u16 = 0x0029;

/// Attribute table of the ECG service: `(handle, uuid)`.
fn attributes() -> Vec<(u16, Vec<u8>)> {
    let short = |u: u16| uuid_to_wire(&uuid16(u));
    vec![
        (0x0023, short(PRIMARY_SERVICE_UUID)),
        (0x0024, short(0x2803)),
        (MEASUREMENT_HANDLE, uuid_to_wire(&ECG_MEASUREMENT_CHARACTERISTIC)),
        (CCC_HANDLE, short(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)),
        (0x0027, short(0x2901)),
        (0x0028, short(0x2803)),
        (SWITCH_HANDLE, uuid_to_wire(&ECG_SWITCH_CHARACTERISTIC)),
        (0x002a, short(0x2901)),
        (0x002b, short(0x2803)),
        (0x002c, short(0x2901)),
    ]
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Local name the sensor advertises.
    pub name: String,
    pub address: Address,
    /// How the sensor stores its values.  The collector must decode with the
    /// same layout.
    pub layout: FragmentLayout,
    /// Time between notifications (two values each).
    pub interval: Duration,
    /// Heart rate of the synthetic waveform.
    pub bpm: f64,
    /// Skip every n-th notification (its counter is still consumed).
    pub drop_every: Option<u16>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.into(),
            address: Address([0x5a, 0x3c, 0x12, 0xb4, 0x59, 0x68]),
            layout: FragmentLayout::LowByteOmitted,
            interval: Duration::from_millis(20),
            bpm: 72.0,
            drop_every: None,
        }
    }
}

/// One heartbeat as a sum of Gaussian bumps, in millivolts.
///
/// `phase` is the position inside the beat, `0.0..1.0`.
pub fn ecg_waveform(phase: f64) -> f32 {
    // (amplitude, centre, width) for P, Q, R, S, T.
    const WAVES: [(f64, f64, f64); 5] = [
        (0.15, 0.20, 0.025),
        (-0.10, 0.36, 0.010),
        (1.00, 0.40, 0.012),
        (-0.25, 0.44, 0.012),
        (0.30, 0.65, 0.040),
    ];
    WAVES
        .iter()
        .map(|&(a, mu, sigma)| a * (-((phase - mu) / sigma).powi(2) / 2.0).exp())
        .sum::<f64>() as f32
}

/// The simulated radio.  Drive it with [`SimulatedRadio::run`].
pub struct SimulatedRadio {
    radio: RadioEnd,
    config: SimulatorConfig,
    connected: bool,
    switched_on: bool,
    notifying: bool,
    counter: u16,
    /// Waveform position in samples since streaming started.
    sample_index: u64,
}

impl SimulatedRadio {
    pub fn new(radio: RadioEnd, config: SimulatorConfig) -> Self {
        Self {
            radio,
            config,
            connected: false,
            switched_on: false,
            notifying: false,
            counter: 0,
            sample_index: 0,
        }
    }

    /// Create a transport, spawn a radio on its far end and return the transport.
    pub fn spawn(config: SimulatorConfig) -> (ChannelTransport, JoinHandle<()>) {
        let (transport, radio) = ChannelTransport::pair();
        let task = tokio::spawn(SimulatedRadio::new(radio, config).run());
        (transport, task)
    }

    pub fn streaming(&self) -> bool {
        self.connected && self.switched_on && self.notifying
    }

    /// Serve commands until the collector drops its transport.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                command = self.radio.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if self.streaming() && !self.notify() {
                        break;
                    }
                }
            }
        }
        debug!("simulator: collector gone, stopping");
    }

    /// React to one command.  Returns `false` once the collector is gone.
    fn on_command(&mut self, command: Command) -> bool {
        debug!("simulator: {}", command.name());
        let events = match command {
            Command::GapDiscover { .. } => self.advertise(),
            Command::GapConnectDirect { address, .. } if address == self.config.address => {
                self.connected = true;
                info!("simulator: connected");
                vec![Event::ConnectionStatus {
                    connection: CONNECTION,
                    flags: 0x05,
                    address,
                    address_type: AddressType::Public,
                    conn_interval: 0x30,
                    timeout: 0x100,
                    latency: 0,
                    bonding: 0xff,
                }]
            }
            Command::ReadByGroupType { connection, .. } if self.connected => {
                let mut events: Vec<Event> = services()
                    .into_iter()
                    .map(|(start, end, uuid)| Event::GroupFound {
                        connection,
                        start,
                        end,
                        uuid,
                    })
                    .collect();
                events.push(completed(connection));
                events
            }
            Command::FindInformation {
                connection,
                start,
                end,
            } if self.connected => {
                let mut events: Vec<Event> = attributes()
                    .into_iter()
                    .filter(|(handle, _)| (start..=end).contains(handle))
                    .map(|(handle, uuid)| Event::FindInformationFound {
                        connection,
                        handle,
                        uuid,
                    })
                    .collect();
                events.push(completed(connection));
                events
            }
            Command::AttributeWrite {
                connection,
                handle,
                data,
            } if self.connected => {
                match handle {
                    SWITCH_HANDLE => self.switched_on = data == SWITCH_ON,
                    CCC_HANDLE => self.notifying = data == NOTIFICATIONS_ENABLE,
                    _ => {}
                }
                if self.streaming() {
                    info!("simulator: streaming ECG");
                }
                vec![completed(connection)]
            }
            Command::ConnectionDisconnect { .. } => {
                self.connected = false;
                self.switched_on = false;
                self.notifying = false;
                vec![]
            }
            _ => vec![],
        };
        events.into_iter().all(|e| self.radio.emit(e))
    }

    /// Scan responses: a bystander first, then the sensor.
    fn advertise(&self) -> Vec<Event> {
        let scan_response = |sender: Address, name: &str| {
            let mut data = vec![0x02, 0x01, 0x06, name.len() as u8 + 1, 0x09];
            data.extend_from_slice(name.as_bytes());
            Event::ScanResponse {
                rssi: -58,
                packet_type: 4,
                sender,
                address_type: AddressType::Public,
                bond: 0xff,
                data,
            }
        };
        vec![
            scan_response(Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]), "Thermometer"),
            scan_response(self.config.address, &self.config.name),
        ]
    }

    /// Send the next notification.  Returns `false` once the collector is gone.
    fn notify(&mut self) -> bool {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let rate = 2.0 / self.config.interval.as_secs_f64();
        let beat = 60.0 / self.config.bpm;
        let mut values = [0.0f32; 2];
        for v in &mut values {
            let t = self.sample_index as f64 / rate;
            *v = ecg_waveform((t / beat).fract());
            self.sample_index += 1;
        }

        if let Some(n) = self.config.drop_every.filter(|&n| n > 0) {
            if counter % n == n - 1 {
                return true;
            }
        }
        self.radio.emit(Event::AttributeValue {
            connection: CONNECTION,
            handle: MEASUREMENT_HANDLE,
            value_type: 1,
            value: encode_sample(counter, values, self.config.layout),
        })
    }
}

fn completed(connection: u8) -> Event {
    Event::ProcedureCompleted {
        connection,
        result: 0,
        handle: 0,
    }
}
