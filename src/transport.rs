//! Byte transport between the collector and the radio.
//!
//! [`Transport`] is the seam: the collector only sends [`Command`]s and
//! receives [`TransportEvent`]s.  [`SerialTransport`] talks to a real radio
//! over a serial port; [`ChannelTransport`] is an in-memory pair used by the
//! simulator and by tests.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};
use tokio::sync::mpsc;

use crate::bgapi::{Command, Event, Packet, PacketReader};
use crate::config::SerialConfig;
use crate::error::CollectorError;

/// What a transport delivers upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A decoded event.
    Event(Event),
    /// A command response.  The collector does not inspect these.
    Response(Packet),
    /// A partial packet stalled and was discarded.
    Timeout,
}

#[async_trait]
pub trait Transport: Send {
    /// Send one command to the radio.
    async fn send(&mut self, command: Command) -> Result<(), CollectorError>;

    /// Next thing the radio said.  `None` once the transport is closed.
    async fn recv(&mut self) -> Option<TransportEvent>;
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn a complete packet into what the collector sees.
///
/// Unknown events are logged and dropped; so are events whose payload does
/// not decode.
fn classify(packet: Packet) -> Option<TransportEvent> {
    if !packet.is_event {
        return Some(TransportEvent::Response(packet));
    }
    match packet.decode_event() {
        Ok(Some(event)) => Some(TransportEvent::Event(event)),
        Ok(None) => {
            debug!(
                "BGAPI: unhandled event {:#04x}/{:#04x}",
                packet.class, packet.id
            );
            None
        }
        Err(e) => {
            warn!("BGAPI: {e}");
            None
        }
    }
}

// ── SerialTransport ───────────────────────────────────────────────────────────

/// A BGAPI radio on a serial port.
///
/// Reading happens on a dedicated thread that owns a clone of the port, feeds
/// a [`PacketReader`] and relays results over a tokio channel.  The thread
/// stops when the transport is dropped, at the next read timeout.  Read errors
/// are logged and the thread keeps reading.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    rx: mpsc::Receiver<TransportEvent>,
    packet_mode: bool,
    debug: bool,
}

impl SerialTransport {
    /// Open the port, flush both directions, and start the reader thread.
    ///
    /// This is the only fallible step of talking to the radio; everything
    /// after it is logged and retried.
    pub fn open(config: &SerialConfig) -> Result<Self, CollectorError> {
        let open_err = |source: serialport::Error| CollectorError::SerialOpen {
            port: config.port.clone(),
            baud: config.baud,
            source,
        };

        let port = serialport::new(&config.port, config.baud)
            .timeout(config.timeout)
            .open()
            .map_err(open_err)?;
        port.clear(ClearBuffer::All).map_err(open_err)?;
        let reader = port.try_clone().map_err(open_err)?;
        info!("Opened {} at {} baud", config.port, config.baud);

        let (tx, rx) = mpsc::channel(256);
        let parser = PacketReader::new(config.timeout);
        let debug = config.debug;
        let backoff = config.timeout;
        thread::Builder::new()
            .name("bgapi-reader".into())
            .spawn(move || read_loop(reader, parser, tx, debug, backoff))?;

        Ok(Self {
            port,
            rx,
            packet_mode: config.packet_mode,
            debug,
        })
    }
}

/// Read the port until the receiving side goes away.
///
/// Read errors are logged and retried after `backoff`.
fn read_loop<R: Read>(
    mut port: R,
    mut parser: PacketReader,
    tx: mpsc::Sender<TransportEvent>,
    debug: bool,
    backoff: Duration,
) {
    let mut buf = [0u8; 256];
    loop {
        let n = match port.read(&mut buf) {
            Ok(0) => {
                if tx.is_closed() {
                    return;
                }
                continue;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                if parser.check_timeout(Instant::now())
                    && tx.blocking_send(TransportEvent::Timeout).is_err()
                {
                    return;
                }
                if tx.is_closed() {
                    return;
                }
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("serial read failed: {e}");
                if tx.is_closed() {
                    return;
                }
                thread::sleep(backoff);
                continue;
            }
        };

        let now = Instant::now();
        for &byte in &buf[..n] {
            let Some(packet) = parser.push(byte, now) else {
                continue;
            };
            if debug {
                debug!("<= [ {} ]", hex(&packet.to_bytes()));
            }
            if let Some(event) = classify(packet) {
                if tx.blocking_send(event).is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, command: Command) -> Result<(), CollectorError> {
        let bytes = command.encode(self.packet_mode);
        if self.debug {
            debug!("=> [ {} ] {}", hex(&bytes), command.name());
        }
        // Commands are a few dozen bytes; the port accepts them without blocking.
        self.port.write_all(&bytes)?;
        self.port.flush()?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

// ── ChannelTransport ──────────────────────────────────────────────────────────

/// In-memory transport.  The other side is a [`RadioEnd`].
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The radio's side of a [`ChannelTransport`].
pub struct RadioEnd {
    /// Commands sent by the collector, in order.
    pub commands: mpsc::UnboundedReceiver<Command>,
    /// Feed events to the collector.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl RadioEnd {
    /// Deliver one event.  Returns `false` once the collector side is gone.
    pub fn emit(&self, event: Event) -> bool {
        self.events.send(TransportEvent::Event(event)).is_ok()
    }
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, RadioEnd) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                commands: cmd_tx,
                events: evt_rx,
            },
            RadioEnd {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, command: Command) -> Result<(), CollectorError> {
        self.commands
            .send(command)
            .map_err(|_| CollectorError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, AddressType};

    #[test]
    fn responses_pass_through_undecoded() {
        let packet = Packet {
            is_event: false,
            class: 0x06,
            id: 0x02,
            payload: vec![0x00, 0x00],
        };
        assert_eq!(
            classify(packet.clone()),
            Some(TransportEvent::Response(packet))
        );
    }

    #[test]
    fn unknown_events_are_dropped() {
        let packet = Packet {
            is_event: true,
            class: 0x00,
            id: 0x00,
            payload: vec![1, 2, 3],
        };
        assert_eq!(classify(packet), None);
    }

    #[test]
    fn known_events_are_decoded() {
        let event = Event::ConnectionDisconnected {
            connection: 0,
            reason: 0x0208,
        };
        assert_eq!(
            classify(event.to_packet()),
            Some(TransportEvent::Event(event))
        );
    }

    #[test]
    fn hex_dump_format() {
        assert_eq!(hex(&[0x80, 0x03, 0xff]), "80 03 ff");
    }

    #[tokio::test]
    async fn channel_pair_carries_both_directions() {
        let (mut transport, mut radio) = ChannelTransport::pair();
        transport.send(Command::GapEndProcedure).await.unwrap();
        assert_eq!(radio.commands.recv().await, Some(Command::GapEndProcedure));

        let event = Event::ConnectionStatus {
            connection: 1,
            flags: 0x05,
            address: Address([1; 6]),
            address_type: AddressType::Public,
            conn_interval: 0x30,
            timeout: 0x100,
            latency: 0,
            bonding: 0xff,
        };
        assert!(radio.emit(event.clone()));
        assert_eq!(transport.recv().await, Some(TransportEvent::Event(event)));

        drop(radio);
        assert_eq!(transport.recv().await, None);
        assert!(matches!(
            transport.send(Command::GapEndProcedure).await,
            Err(CollectorError::TransportClosed)
        ));
    }

    /// Fails once, then hands out `data`, then times out forever.
    struct FlakyPort {
        failed: bool,
        data: Vec<u8>,
    }

    impl Read for FlakyPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.failed {
                self.failed = true;
                return Err(std::io::Error::other("device reports a framing error"));
            }
            if !self.data.is_empty() {
                let n = self.data.len().min(buf.len());
                buf[..n].copy_from_slice(&self.data[..n]);
                self.data.drain(..n);
                return Ok(n);
            }
            thread::sleep(Duration::from_millis(5));
            Err(ErrorKind::TimedOut.into())
        }
    }

    #[test]
    fn reader_survives_a_read_error() {
        let event = Event::ConnectionDisconnected {
            connection: 0,
            reason: 0x0213,
        };
        let port = FlakyPort {
            failed: false,
            data: event.to_packet().to_bytes(),
        };
        let (tx, mut rx) = mpsc::channel(4);
        let reader = thread::spawn(move || {
            read_loop(
                port,
                PacketReader::new(Duration::from_secs(1)),
                tx,
                false,
                Duration::from_millis(10),
            )
        });

        assert_eq!(rx.blocking_recv(), Some(TransportEvent::Event(event)));
        drop(rx);
        reader.join().expect("reader thread exits once the receiver is gone");
    }
}
