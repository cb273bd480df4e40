//! The collector task: radio setup, event dispatch, delayed commands.
//!
//! [`EcgCollector::start`] spawns one tokio task that owns the transport,
//! the [`Scanner`], the [`Discovery`] state machine and the [`SampleSink`].
//! Everything the task learns is published three ways:
//!
//! | Channel | Content | Semantics |
//! |---|---|---|
//! | `mpsc::Receiver<CollectorEvent>` | state changes, samples, loss reports | lossy when the consumer lags |
//! | [`CollectorHandle::state`] | current [`DiscoveryState`] | latest value (`watch`) |
//! | [`CollectorHandle::samples`] | last N ECG values | bounded FIFO |

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bgapi::{Command, Event};
use crate::config::CollectorConfig;
use crate::discovery::{Discovery, Outgoing};
use crate::error::{CollectorError, DiscoveryError};
use crate::protocol::{DISCOVER_GENERIC, SCAN_ACTIVE, SCAN_INTERVAL, SCAN_WINDOW};
use crate::scanner::Scanner;
use crate::sink::{SampleBuffer, SampleSink};
use crate::transport::{Transport, TransportEvent};
use crate::types::{CollectorEvent, DiscoveryState};

/// How often deadlines and delayed commands are checked.
const TICK: Duration = Duration::from_millis(50);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Commands that put the radio into a known state and start scanning.
///
/// Drops connection 0, stops advertising, ends any running GAP procedure,
/// then starts an active generic scan.
pub fn startup_commands() -> Vec<Command> {
    vec![
        Command::ConnectionDisconnect { connection: 0 },
        Command::GapSetMode {
            discover: 0,
            connect: 0,
        },
        Command::GapEndProcedure,
        Command::GapSetScanParameters {
            scan_interval: SCAN_INTERVAL,
            scan_window: SCAN_WINDOW,
            active: SCAN_ACTIVE,
        },
        Command::GapDiscover {
            mode: DISCOVER_GENERIC,
        },
    ]
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// What one input produced.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub outgoing: Vec<Outgoing>,
    pub events: Vec<CollectorEvent>,
    /// A connection that went away; queued commands for it must not be sent.
    pub drop_pending_for: Option<u8>,
}

/// Routes radio events to the scanner, the state machine and the sink.
///
/// Synchronous and free of I/O; the collector task feeds it and carries out
/// the returned [`Dispatch`].
pub struct Dispatcher {
    scanner: Scanner,
    discovery: Discovery,
    sink: SampleSink,
}

impl Dispatcher {
    pub fn new(config: &CollectorConfig, buffer: SampleBuffer) -> Self {
        Self {
            scanner: Scanner::new(config.target_name.clone()),
            discovery: Discovery::new(config.discovery_config()),
            sink: SampleSink::new(buffer, config.loss_window(), config.fragment_layout),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) -> Dispatch {
        let before = self.discovery.state();
        let mut out = Dispatch::default();

        match event {
            Event::ScanResponse {
                sender,
                address_type,
                data,
                ..
            } => {
                // A connection attempt is in flight; later advertisements wait.
                if !self.discovery.can_connect() {
                    return out;
                }
                match self.scanner.on_scan_response(sender, address_type, &data) {
                    Ok(Some(peripheral)) => {
                        out.outgoing.extend(self.discovery.connect(peripheral, now));
                    }
                    Ok(None) => {}
                    Err(e) => debug!("scan response from {sender}: {e}"),
                }
            }
            Event::ConnectionStatus {
                connection,
                flags,
                address,
                ..
            } => {
                let next = self
                    .discovery
                    .on_connection_status(connection, flags, address, now);
                if !next.is_empty() {
                    self.sink.reset();
                    out.events.push(CollectorEvent::Connected(address));
                }
                out.outgoing.extend(next);
            }
            Event::ConnectionDisconnected { connection, reason } => {
                if let Some(peripheral) = self.discovery.on_disconnected(connection) {
                    warn!(
                        "Lost connection to {} (reason {reason:#06x}); scanning again",
                        peripheral.address
                    );
                    self.scanner.forget(&peripheral.address);
                    self.sink.reset();
                    out.drop_pending_for = Some(connection);
                    out.events.push(CollectorEvent::Disconnected {
                        address: peripheral.address,
                        reason,
                    });
                    out.outgoing.push(Outgoing::now(Command::GapDiscover {
                        mode: DISCOVER_GENERIC,
                    }));
                }
            }
            Event::GroupFound {
                connection,
                start,
                end,
                uuid,
            } => self.discovery.on_group_found(connection, start, end, &uuid),
            Event::FindInformationFound {
                connection,
                handle,
                uuid,
            } => self
                .discovery
                .on_information_found(connection, handle, &uuid),
            Event::ProcedureCompleted {
                connection, result, ..
            } => {
                if result != 0 {
                    debug!("procedure on connection {connection} completed with {result:#06x}");
                }
                match self.discovery.on_procedure_completed(connection, now) {
                    Ok(next) => out.outgoing.extend(next),
                    Err(e) => {
                        warn!("{e}");
                        out.events.push(CollectorEvent::Stalled(e));
                    }
                }
            }
            Event::AttributeValue {
                connection,
                handle,
                value,
                ..
            } => {
                if !self.discovery.is_measurement(connection, handle) {
                    debug!("value for handle {handle} on connection {connection} ignored");
                    return out;
                }
                match self.sink.on_notification(&value) {
                    Ok((sample, report)) => {
                        out.events.push(CollectorEvent::Sample(sample));
                        if let Some(report) = report {
                            out.events.push(CollectorEvent::PacketLoss(report));
                        }
                    }
                    Err(e) => warn!("dropping notification: {e}"),
                }
            }
        }

        self.note_state_change(before, &mut out);
        out
    }

    /// Check the discovery deadline.
    pub fn poll(&mut self, now: Instant) -> Dispatch {
        let before = self.discovery.state();
        let mut out = Dispatch::default();
        match self.discovery.poll_timeout(now) {
            Ok(next) => out.outgoing = next,
            Err(e) => out.events.push(CollectorEvent::Failed(e)),
        }
        self.note_state_change(before, &mut out);
        out
    }

    fn note_state_change(&self, before: DiscoveryState, out: &mut Dispatch) {
        let after = self.discovery.state();
        if after != before {
            out.events.insert(0, CollectorEvent::StateChanged(after));
        }
    }
}

// ── EcgCollector ──────────────────────────────────────────────────────────────

/// Finds the ECG sensor through a BGAPI radio and streams its samples.
///
/// ```no_run
/// # async fn demo() -> Result<(), ecg_ble::error::CollectorError> {
/// use ecg_ble::prelude::*;
///
/// let transport = SerialTransport::open(&SerialConfig::default())?;
/// let (mut rx, handle, _task) = EcgCollector::new(CollectorConfig::default()).start(transport);
/// while let Some(event) = rx.recv().await {
///     if let CollectorEvent::Sample(s) = event {
///         println!("{:?}", s.values);
///     }
/// }
/// handle.stop();
/// # Ok(())
/// # }
/// ```
pub struct EcgCollector {
    config: CollectorConfig,
}

impl EcgCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// Spawn the collector task on the current tokio runtime.
    ///
    /// The task ends when [`CollectorHandle::stop`] is called, when the
    /// handle is dropped, when the transport closes, or when discovery fails
    /// for good.  Its result says which.
    pub fn start<T>(
        self,
        transport: T,
    ) -> (
        mpsc::Receiver<CollectorEvent>,
        CollectorHandle,
        JoinHandle<Result<(), CollectorError>>,
    )
    where
        T: Transport + 'static,
    {
        let buffer = SampleBuffer::new(self.config.buffer_capacity);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(DiscoveryState::Standby);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = Task {
            target_name: self.config.target_name.clone(),
            dispatcher: Dispatcher::new(&self.config, buffer.clone()),
            pending: Vec::new(),
            tx,
            state_tx,
            cancel: cancel_rx,
        };
        let join = tokio::spawn(task.run(transport));

        let handle = CollectorHandle {
            state: state_rx,
            samples: buffer,
            cancel: cancel_tx,
        };
        (rx, handle, join)
    }
}

struct Task {
    target_name: String,
    dispatcher: Dispatcher,
    /// Delayed commands with their due time, in issue order.
    pending: Vec<(Instant, Command)>,
    tx: mpsc::Sender<CollectorEvent>,
    state_tx: watch::Sender<DiscoveryState>,
    cancel: watch::Receiver<bool>,
}

impl Task {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run<T: Transport>(mut self, mut transport: T) -> Result<(), CollectorError> {
        for command in startup_commands() {
            if self.cancelled() {
                return Ok(());
            }
            transport.send(command).await?;
        }
        info!("Scanning for {}", self.target_name);

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let dispatch = tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || self.cancelled() {
                        info!("Collector stopping");
                        return Ok(());
                    }
                    continue;
                }
                event = transport.recv() => match event {
                    Some(TransportEvent::Event(event)) => {
                        self.dispatcher.handle_event(event, Instant::now())
                    }
                    Some(TransportEvent::Response(packet)) => {
                        debug!("response {:#04x}/{:#04x}", packet.class, packet.id);
                        continue;
                    }
                    Some(TransportEvent::Timeout) => {
                        warn!("{}", CollectorError::TransportTimeout);
                        continue;
                    }
                    None => {
                        warn!("Transport closed");
                        return Err(CollectorError::TransportClosed);
                    }
                },
                _ = tick.tick() => self.dispatcher.poll(Instant::now()),
            };

            let failure = self.publish(dispatch.events);

            if let Some(connection) = dispatch.drop_pending_for {
                self.drop_pending(connection);
            }
            let now = Instant::now();
            self.pending.extend(
                dispatch
                    .outgoing
                    .into_iter()
                    .map(|o| (now + o.delay, o.command)),
            );
            if !self.flush(&mut transport).await {
                info!("Collector stopping");
                return Ok(());
            }

            if let Some(e) = failure {
                return Err(e.into());
            }
        }
    }

    /// Forward events to the channel and the state watch.  Returns the
    /// terminal discovery error, if one was among them.
    fn publish(&mut self, events: Vec<CollectorEvent>) -> Option<DiscoveryError> {
        let mut failure = None;
        for event in events {
            match &event {
                CollectorEvent::StateChanged(state) => {
                    self.state_tx.send_replace(*state);
                }
                CollectorEvent::Failed(e) => failure = Some(e.clone()),
                _ => {}
            }
            if let Err(TrySendError::Full(event)) = self.tx.try_send(event) {
                debug!("event channel full, dropping {event:?}");
            }
        }
        failure
    }

    fn drop_pending(&mut self, connection: u8) {
        let before = self.pending.len();
        self.pending
            .retain(|(_, command)| command.connection() != Some(connection));
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!("dropped {dropped} queued command(s) for connection {connection}");
        }
    }

    /// Send every pending command that is due, in issue order.
    ///
    /// Returns `false` if cancellation was requested.
    async fn flush<T: Transport>(&mut self, transport: &mut T) -> bool {
        let now = Instant::now();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 > now {
                i += 1;
                continue;
            }
            if self.cancelled() {
                return false;
            }
            let (_, command) = self.pending.remove(i);
            let name = command.name();
            if let Err(e) = transport.send(command).await {
                warn!("Failed to send {name}: {e}");
            }
        }
        true
    }
}

// ── CollectorHandle ───────────────────────────────────────────────────────────

/// Observes and stops a running collector.
///
/// Dropping the handle stops the collector.
pub struct CollectorHandle {
    state: watch::Receiver<DiscoveryState>,
    samples: SampleBuffer,
    cancel: watch::Sender<bool>,
}

impl CollectorHandle {
    /// Current discovery state.
    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    /// Snapshot of the buffered ECG values, oldest first.
    pub fn samples(&self) -> Vec<f32> {
        self.samples.snapshot()
    }

    /// The shared buffer itself, for readers that poll it.
    pub fn buffer(&self) -> SampleBuffer {
        self.samples.clone()
    }

    /// A receiver that wakes on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.clone()
    }

    /// Ask the collector task to stop.  No command is sent after this returns.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }
}
