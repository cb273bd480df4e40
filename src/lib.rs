//! # ecg-ble
//!
//! Async Rust driver that uses a BGAPI serial BLE radio (BLE112-class dongle)
//! to find an ECG sensor, walk its GATT table, switch it on and stream its
//! measurements.
//!
//! ## How a session runs
//!
//! 1. The radio is reset and an active scan is started.
//! 2. The first advertisement carrying the target name (default
//!    `"ECGICGMONITOR"`) triggers a direct connection.
//! 3. The ECG service is located with a primary-service group read, then its
//!    attributes are listed to find the measurement value, its CCC descriptor
//!    and the sensor switch.
//! 4. The switch is written `0x01`; 200 ms later the CCC is written `0x0001`.
//! 5. Every notification carries two ECG values (and optionally a packet
//!    counter); they land in a bounded buffer and on the event channel.
//!
//! A phase that stalls is re-issued after a deadline and gives up after a
//! few tries.  A dropped link sends the collector back to scanning.
//!
//! ## Quick start
//!
//! ```no_run
//! use ecg_ble::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransport::open(&SerialConfig::default())?;
//!     let (mut rx, handle, _task) = EcgCollector::new(CollectorConfig::default()).start(transport);
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             CollectorEvent::Sample(s) => println!("ECG: {:?}", s.values),
//!             CollectorEvent::Failed(e) => {
//!                 eprintln!("{e}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     handle.stop();
//!     Ok(())
//! }
//! ```
//!
//! No radio at hand?  [`simulator::SimulatedRadio::spawn`] returns a
//! transport backed by a fake sensor.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`collector`] | The collector task, its handle and the event dispatcher |
//! | [`discovery`] | GATT discovery state machine |
//! | [`scanner`] | Advertisement filtering by local name |
//! | [`sink`] | Sample buffer and packet-loss tracking |
//! | [`transport`] | Serial and in-memory transports |
//! | [`bgapi`] | BGAPI command encoding, event decoding, packet framing |
//! | [`parse`] | Advertisement fields and ECG sample payloads |
//! | [`protocol`] | UUIDs, handles, link parameters and payload layout |
//! | [`types`] | Addresses, states, samples and collector events |
//! | [`config`] | Collector and serial-port settings |
//! | [`error`] | Error types |
//! | [`simulator`] | Fake radio with a synthetic ECG sensor |

pub mod bgapi;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod scanner;
pub mod simulator;
pub mod sink;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use ecg_ble::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() {
/// let (transport, _radio) = SimulatedRadio::spawn(SimulatorConfig::default());
/// let config = CollectorConfig {
///     fragment_layout: FragmentLayout::LowByteOmitted,
///     ..CollectorConfig::default()
/// };
/// let (mut rx, _handle, _task) = EcgCollector::new(config).start(transport);
/// while let Some(ev) = rx.recv().await {
///     if let CollectorEvent::Sample(s) = ev {
///         println!("{:?}", s.values);
///     }
/// }
/// # }
/// ```
pub mod prelude {
    // ── Collector ─────────────────────────────────────────────────────────────
    pub use crate::collector::{CollectorHandle, EcgCollector};
    pub use crate::config::{CollectorConfig, SerialConfig};
    pub use crate::error::{CollectorError, DecodeError, DiscoveryError};
    pub use crate::transport::{ChannelTransport, SerialTransport, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::parse::FragmentLayout;
    pub use crate::sink::SampleBuffer;
    pub use crate::types::{
        Address, CollectorEvent, DiscoveryState, EcgSample, PacketLossReport, Peripheral,
    };

    // ── Simulation ────────────────────────────────────────────────────────────
    pub use crate::simulator::{SimulatedRadio, SimulatorConfig};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        DEFAULT_DEVICE_NAME, ECG_MEASUREMENT_CHARACTERISTIC, ECG_SERVICE_UUID,
        ECG_SWITCH_CHARACTERISTIC,
    };
}
