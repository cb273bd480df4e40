use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use ecg_ble::collector::EcgCollector;
use ecg_ble::config::{CollectorConfig, SerialConfig};
use ecg_ble::parse::FragmentLayout;
use ecg_ble::protocol::DEFAULT_DEVICE_NAME;
use ecg_ble::simulator::{SimulatedRadio, SimulatorConfig};
use ecg_ble::transport::{SerialTransport, Transport};
use ecg_ble::types::CollectorEvent;

/// ECG collector for a BGAPI serial BLE radio.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Serial port device name
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Packet mode (prefix API packets with <length> byte)
    #[arg(short = 'k', long)]
    packet: bool,

    /// Debug mode (log raw RX/TX API packets at debug level)
    #[arg(short, long)]
    debug: bool,

    /// Counter mode (read the packet counter and report lost packets)
    #[arg(short, long)]
    counter: bool,

    /// Advertised name of the sensor
    #[arg(long, default_value = DEFAULT_DEVICE_NAME)]
    name: String,

    /// Decode ECG values with the zero byte in the low position.
    ///
    /// This is the layout the vendor's own collector uses. Without it, values
    /// from real hardware decode as subnormal floats and print as +0.00.
    #[arg(long)]
    low_byte_omitted: bool,

    /// Talk to a simulated sensor instead of a serial radio
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug (with --debug) to see every BGAPI packet, e.g.:
    //   RUST_LOG=ecg_ble=debug cargo run -- --debug
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut config = CollectorConfig {
        target_name: args.name.clone(),
        counter_mode: args.counter,
        fragment_layout: if args.low_byte_omitted {
            FragmentLayout::LowByteOmitted
        } else {
            FragmentLayout::HighByteOmitted
        },
        ..CollectorConfig::default()
    };

    if args.simulate {
        // The simulated sensor only produces meaningful values in this layout.
        config.fragment_layout = FragmentLayout::LowByteOmitted;
        let (transport, _radio) = SimulatedRadio::spawn(SimulatorConfig {
            name: args.name.clone(),
            layout: config.fragment_layout,
            ..SimulatorConfig::default()
        });
        info!("Using simulated radio");
        return stream(transport, config).await;
    }

    let serial = SerialConfig {
        port: args.port.clone(),
        baud: args.baud,
        packet_mode: args.packet,
        debug: args.debug,
        ..SerialConfig::default()
    };
    let transport = match SerialTransport::open(&serial) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("\n================================================================");
            eprintln!("Port error (name='{}', baud='{}'): {e}", serial.port, serial.baud);
            eprintln!("================================================================");
            std::process::exit(2);
        }
    };
    stream(transport, config).await
}

/// Run the collector until Ctrl-C or until it stops by itself.
async fn stream<T: Transport + 'static>(transport: T, config: CollectorConfig) -> Result<()> {
    info!("Scanning for BLE peripherals...");
    let (mut rx, handle, task) = EcgCollector::new(config).start(transport);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                handle.stop();
                println!("Goodbye!");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
        }
    }

    task.await??;
    info!("Event loop finished – exiting.");
    Ok(())
}

fn print_event(event: CollectorEvent) {
    match event {
        CollectorEvent::StateChanged(state) => info!("State: {state}"),
        CollectorEvent::Connected(address) => info!("✅  Connected to {address}"),
        CollectorEvent::Sample(sample) => match sample.counter {
            Some(counter) => println!(
                "[ECG] #{counter:5}  {:+.2} {:+.2}",
                sample.values[0], sample.values[1]
            ),
            None => println!("[ECG] {:+.2} {:+.2}", sample.values[0], sample.values[1]),
        },
        CollectorEvent::PacketLoss(report) => println!(
            "[LOSS] lost={} in counters {}..={}",
            report.lost, report.first, report.last
        ),
        CollectorEvent::Stalled(e) => warn!("{e}"),
        CollectorEvent::Failed(e) => error!("{e}"),
        CollectorEvent::Disconnected { address, reason } => {
            info!("❌  Disconnected from {address} (reason {reason:#06x})")
        }
    }
}
