//! Collector and serial-port settings.

use std::time::Duration;

use crate::discovery::DiscoveryConfig;
use crate::parse::FragmentLayout;
use crate::protocol::{DEFAULT_BUFFER_CAPACITY, DEFAULT_DEVICE_NAME, LOSS_WINDOW};

/// Configuration for [`crate::collector::EcgCollector`].
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Complete local name the sensor advertises.
    pub target_name: String,
    /// Read the packet counter from bytes 0–1 and report packet loss.
    pub counter_mode: bool,
    /// Number of ECG values kept in the shared buffer.
    pub buffer_capacity: usize,
    /// Counters per packet-loss report.
    pub loss_window: usize,
    /// Pause between switching the sensor on and enabling notifications.
    pub switch_settle: Duration,
    /// Time a discovery phase may take before it is re-issued.
    pub procedure_timeout: Duration,
    /// Tries per discovery phase before giving up.
    pub max_attempts: u32,
    pub fragment_layout: FragmentLayout,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let discovery = DiscoveryConfig::default();
        Self {
            target_name: DEFAULT_DEVICE_NAME.into(),
            counter_mode: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            loss_window: LOSS_WINDOW,
            switch_settle: discovery.switch_settle,
            procedure_timeout: discovery.procedure_timeout,
            max_attempts: discovery.max_attempts,
            fragment_layout: FragmentLayout::default(),
        }
    }
}

impl CollectorConfig {
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            switch_settle: self.switch_settle,
            procedure_timeout: self.procedure_timeout,
            max_attempts: self.max_attempts.max(1),
            ..DiscoveryConfig::default()
        }
    }

    /// Loss window to track, or `None` outside counter mode.
    pub fn loss_window(&self) -> Option<usize> {
        self.counter_mode.then_some(self.loss_window)
    }
}

/// Settings for [`crate::transport::SerialTransport`].
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Prefix each command with its length byte (radio firmware option).
    pub packet_mode: bool,
    /// Hex-dump every packet at debug level.
    pub debug: bool,
    /// Port read/write timeout; also the partial-packet timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".into(),
            baud: 115_200,
            packet_mode: false,
            debug: false,
            timeout: Duration::from_secs(1),
        }
    }
}
