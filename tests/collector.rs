//! Integration tests: the collector task against in-memory radios.

use std::time::Duration;

use tokio::time::timeout;

use ecg_ble::bgapi::{Command, Event};
use ecg_ble::collector::EcgCollector;
use ecg_ble::config::CollectorConfig;
use ecg_ble::error::{CollectorError, DiscoveryError};
use ecg_ble::parse::{encode_sample, FragmentLayout};
use ecg_ble::protocol::{
    uuid16, uuid_to_wire, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
    ECG_MEASUREMENT_CHARACTERISTIC, ECG_SERVICE_UUID, ECG_SWITCH_CHARACTERISTIC,
};
use ecg_ble::simulator::{SimulatedRadio, SimulatorConfig};
use ecg_ble::transport::{ChannelTransport, RadioEnd};
use ecg_ble::types::{Address, AddressType, CollectorEvent, DiscoveryState};

const WAIT: Duration = Duration::from_secs(5);
const SENSOR: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
const CONN: u8 = 1;

fn simulated_config() -> CollectorConfig {
    CollectorConfig {
        fragment_layout: FragmentLayout::LowByteOmitted,
        ..CollectorConfig::default()
    }
}

// ── Against the simulator ─────────────────────────────────────────────────────

#[tokio::test]
async fn streams_samples_from_simulated_sensor() {
    let (transport, _radio) = SimulatedRadio::spawn(SimulatorConfig::default());
    let config = CollectorConfig {
        buffer_capacity: 50,
        ..simulated_config()
    };
    let (mut rx, handle, task) = EcgCollector::new(config).start(transport);

    let mut state = handle.subscribe_state();
    timeout(WAIT, state.wait_for(|s| *s == DiscoveryState::Listening))
        .await
        .expect("listening in time")
        .expect("collector alive");

    let received = timeout(WAIT, async {
        let mut n = 0;
        while let Some(event) = rx.recv().await {
            if let CollectorEvent::Sample(sample) = event {
                assert_eq!(sample.counter, None);
                assert!(sample.values.iter().all(|v| v.is_finite() && v.abs() < 2.0));
                n += 1;
                if n == 30 {
                    break;
                }
            }
        }
        n
    })
    .await
    .expect("samples in time");
    assert_eq!(received, 30);

    // 30 notifications carry 60 values; the buffer keeps the newest 50.
    assert_eq!(handle.samples().len(), 50);
    assert_eq!(handle.state(), DiscoveryState::Listening);

    handle.stop();
    let result = timeout(WAIT, task).await.expect("task ends").expect("no panic");
    assert!(result.is_ok());
}

#[tokio::test]
async fn counter_mode_reports_dropped_notifications() {
    let (transport, _radio) = SimulatedRadio::spawn(SimulatorConfig {
        drop_every: Some(5),
        interval: Duration::from_millis(5),
        ..SimulatorConfig::default()
    });
    let config = CollectorConfig {
        counter_mode: true,
        loss_window: 20,
        ..simulated_config()
    };
    let (mut rx, handle, _task) = EcgCollector::new(config).start(transport);

    let report = timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if let CollectorEvent::PacketLoss(report) = event {
                return Some(report);
            }
        }
        None
    })
    .await
    .expect("report in time")
    .expect("collector alive");

    // Every fifth counter is skipped: 20 received span 24 counters.
    assert_eq!(report.first, 0);
    assert_eq!(report.last, 23);
    assert_eq!(report.lost, 4);
    handle.stop();
}

#[tokio::test]
async fn stop_before_discovery_ends_cleanly() {
    let (transport, _radio) = SimulatedRadio::spawn(SimulatorConfig {
        name: "SOMETHING-ELSE".into(),
        ..SimulatorConfig::default()
    });
    let (_rx, handle, task) = EcgCollector::new(simulated_config()).start(transport);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), DiscoveryState::Standby);

    handle.stop();
    let result = timeout(WAIT, task).await.expect("task ends").expect("no panic");
    assert!(result.is_ok());
}

// ── Against a scripted radio ──────────────────────────────────────────────────

async fn next_command(radio: &mut RadioEnd) -> Command {
    timeout(WAIT, radio.commands.recv())
        .await
        .expect("command in time")
        .expect("collector alive")
}

fn advertisement() -> Event {
    let name = b"ECGICGMONITOR";
    let mut data = vec![0x02, 0x01, 0x06, name.len() as u8 + 1, 0x09];
    data.extend_from_slice(name);
    Event::ScanResponse {
        rssi: -50,
        packet_type: 0,
        sender: SENSOR,
        address_type: AddressType::Public,
        bond: 0xff,
        data,
    }
}

fn completed() -> Event {
    Event::ProcedureCompleted {
        connection: CONN,
        result: 0,
        handle: 0,
    }
}

fn found(handle: u16, uuid: Vec<u8>) -> Event {
    Event::FindInformationFound {
        connection: CONN,
        handle,
        uuid,
    }
}

/// Walk the collector through startup, connection and service search.
/// Returns once the attribute search has been requested.
async fn drive_to_attribute_search(radio: &mut RadioEnd) {
    for _ in 0..5 {
        next_command(radio).await;
    }
    radio.emit(advertisement());
    assert!(matches!(
        next_command(radio).await,
        Command::GapConnectDirect { address: SENSOR, .. }
    ));

    radio.emit(Event::ConnectionStatus {
        connection: CONN,
        flags: 0x05,
        address: SENSOR,
        address_type: AddressType::Public,
        conn_interval: 0x30,
        timeout: 0x100,
        latency: 0,
        bonding: 0xff,
    });
    assert_eq!(
        next_command(radio).await,
        Command::ReadByGroupType {
            connection: CONN,
            start: 0x0001,
            end: 0xFFFF,
            uuid: vec![0x00, 0x28],
        }
    );

    radio.emit(Event::GroupFound {
        connection: CONN,
        start: 0x10,
        end: 0x1a,
        uuid: uuid_to_wire(&ECG_SERVICE_UUID),
    });
    radio.emit(completed());
    assert_eq!(
        next_command(radio).await,
        Command::FindInformation {
            connection: CONN,
            start: 0x10,
            end: 0x1a
        }
    );
}

#[tokio::test]
async fn full_discovery_writes_switch_then_ccc() {
    let (transport, mut radio) = ChannelTransport::pair();
    let (mut rx, handle, _task) = EcgCollector::new(CollectorConfig::default()).start(transport);
    drive_to_attribute_search(&mut radio).await;

    radio.emit(found(0x12, uuid_to_wire(&ECG_MEASUREMENT_CHARACTERISTIC)));
    radio.emit(found(
        0x13,
        uuid_to_wire(&uuid16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)),
    ));
    radio.emit(found(0x16, uuid_to_wire(&ECG_SWITCH_CHARACTERISTIC)));
    radio.emit(completed());

    let started = std::time::Instant::now();
    assert_eq!(
        next_command(&mut radio).await,
        Command::AttributeWrite {
            connection: CONN,
            handle: 0x16,
            data: vec![0x01]
        }
    );
    assert_eq!(
        next_command(&mut radio).await,
        Command::AttributeWrite {
            connection: CONN,
            handle: 0x13,
            data: vec![0x01, 0x00]
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(handle.state(), DiscoveryState::Listening);

    radio.emit(Event::AttributeValue {
        connection: CONN,
        handle: 0x12,
        value_type: 1,
        value: encode_sample(3, [0.0, 0.0], FragmentLayout::HighByteOmitted),
    });
    let sample = timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if let CollectorEvent::Sample(s) = event {
                return Some(s);
            }
        }
        None
    })
    .await
    .expect("sample in time")
    .expect("collector alive");
    assert_eq!(sample.values, [0.0, 0.0]);
    handle.stop();
}

#[tokio::test]
async fn disconnect_during_settle_cancels_ccc_write() {
    let (transport, mut radio) = ChannelTransport::pair();
    let (_rx, handle, _task) = EcgCollector::new(CollectorConfig::default()).start(transport);
    drive_to_attribute_search(&mut radio).await;

    radio.emit(found(0x12, uuid_to_wire(&ECG_MEASUREMENT_CHARACTERISTIC)));
    radio.emit(found(
        0x13,
        uuid_to_wire(&uuid16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)),
    ));
    radio.emit(found(0x16, uuid_to_wire(&ECG_SWITCH_CHARACTERISTIC)));
    radio.emit(completed());
    assert!(matches!(
        next_command(&mut radio).await,
        Command::AttributeWrite { handle: 0x16, .. }
    ));

    // The link drops before the CCC write is due.
    radio.emit(Event::ConnectionDisconnected {
        connection: CONN,
        reason: 0x0208,
    });
    assert_eq!(
        next_command(&mut radio).await,
        Command::GapDiscover { mode: 1 }
    );

    // Well past the settle delay, nothing else reaches the radio.
    let late = timeout(Duration::from_millis(400), radio.commands.recv()).await;
    assert!(late.is_err(), "unexpected command {late:?}");
    assert_eq!(handle.state(), DiscoveryState::Disconnected);
    handle.stop();
}

#[tokio::test]
async fn missing_switch_is_retried_then_fails() {
    let (transport, mut radio) = ChannelTransport::pair();
    let config = CollectorConfig {
        procedure_timeout: Duration::from_millis(150),
        max_attempts: 2,
        ..CollectorConfig::default()
    };
    let (mut rx, handle, task) = EcgCollector::new(config).start(transport);
    drive_to_attribute_search(&mut radio).await;

    // Measurement and CCC, but no switch.
    radio.emit(found(0x12, uuid_to_wire(&ECG_MEASUREMENT_CHARACTERISTIC)));
    radio.emit(found(
        0x13,
        uuid_to_wire(&uuid16(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)),
    ));
    radio.emit(completed());

    // The deadline re-issues the same search.
    assert!(matches!(
        next_command(&mut radio).await,
        Command::FindInformation { start: 0x10, .. }
    ));
    radio.emit(completed());

    let result = timeout(WAIT, task).await.expect("task ends").expect("no panic");
    assert!(matches!(
        result,
        Err(CollectorError::Discovery(DiscoveryError::Failed {
            state: DiscoveryState::FindingAttributes,
            attempts: 2
        }))
    ));
    assert_eq!(handle.state(), DiscoveryState::Failed);

    let mut stalls = 0;
    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            CollectorEvent::Stalled(_) => stalls += 1,
            CollectorEvent::Failed(_) => failed = true,
            _ => {}
        }
    }
    assert_eq!(stalls, 2);
    assert!(failed);

    // No write was ever attempted.
    while let Ok(command) = radio.commands.try_recv() {
        assert!(!matches!(command, Command::AttributeWrite { .. }));
    }
}

#[tokio::test]
async fn disconnect_returns_to_scanning() {
    let (transport, mut radio) = ChannelTransport::pair();
    let (mut rx, handle, _task) = EcgCollector::new(CollectorConfig::default()).start(transport);
    drive_to_attribute_search(&mut radio).await;

    radio.emit(Event::ConnectionDisconnected {
        connection: CONN,
        reason: 0x0208,
    });
    assert_eq!(
        next_command(&mut radio).await,
        Command::GapDiscover { mode: 1 }
    );

    let disconnected = timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if let CollectorEvent::Disconnected { address, reason } = event {
                return Some((address, reason));
            }
        }
        None
    })
    .await
    .expect("event in time");
    assert_eq!(disconnected, Some((SENSOR, 0x0208)));
    assert_eq!(handle.state(), DiscoveryState::Disconnected);

    // The same sensor is connected again on its next advertisement.
    radio.emit(advertisement());
    assert!(matches!(
        next_command(&mut radio).await,
        Command::GapConnectDirect { address: SENSOR, .. }
    ));
    handle.stop();
}
