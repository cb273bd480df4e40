//! Where decoded samples go: a bounded shared buffer and the packet-loss counter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::error::DecodeError;
use crate::parse::{decode_sample, FragmentLayout};
use crate::protocol::{DEFAULT_BUFFER_CAPACITY, LOSS_WINDOW};
use crate::types::{EcgSample, PacketLossReport};

// ── SampleBuffer ──────────────────────────────────────────────────────────────

/// Bounded FIFO of ECG values shared between the collector and its readers.
///
/// Pushing into a full buffer evicts the oldest value.  Clones share the same
/// storage, so a consumer (e.g. the chart view) can hold one while the
/// collector task fills another.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    inner: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl SampleBuffer {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        // A panicking writer cannot leave a VecDeque<f32> half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, value: f32) {
        let mut buf = self.lock();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(value);
    }

    /// Append several values under one lock, in order.
    pub fn extend(&self, values: impl IntoIterator<Item = f32>) {
        let mut buf = self.lock();
        for value in values {
            if buf.len() == self.capacity {
                buf.pop_front();
            }
            buf.push_back(value);
        }
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

// ── PacketLossTracker ─────────────────────────────────────────────────────────

/// Counts missing notifications from the sensor's packet counter.
///
/// Counters are collected into a trace; once `window` of them have arrived the
/// tracker reports `last − first + 1 − window` lost packets and starts over.
/// The difference wraps at 2¹⁶ like the counter itself.
#[derive(Debug, Clone)]
pub struct PacketLossTracker {
    window: usize,
    trace: Vec<u16>,
}

impl PacketLossTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            trace: Vec::with_capacity(window),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Record one counter.  Returns a report when the window is full.
    pub fn push(&mut self, counter: u16) -> Option<PacketLossReport> {
        self.trace.push(counter);
        if self.trace.len() < self.window {
            return None;
        }
        let counters = std::mem::take(&mut self.trace);
        let first = counters[0];
        let last = counters[counters.len() - 1];
        let span = last.wrapping_sub(first) as i64 + 1;
        Some(PacketLossReport {
            lost: span - self.window as i64,
            first,
            last,
            counters,
        })
    }

    /// Discard the partial trace (after a reconnect).
    pub fn reset(&mut self) {
        self.trace.clear();
    }
}

impl Default for PacketLossTracker {
    fn default() -> Self {
        Self::new(LOSS_WINDOW)
    }
}

// ── SampleSink ────────────────────────────────────────────────────────────────

/// Decodes measurement notifications into the buffer and loss tracker.
#[derive(Debug, Clone)]
pub struct SampleSink {
    buffer: SampleBuffer,
    tracker: Option<PacketLossTracker>,
    layout: FragmentLayout,
}

impl SampleSink {
    /// `loss_window` enables counter mode; `None` ignores bytes 0–1.
    pub fn new(buffer: SampleBuffer, loss_window: Option<usize>, layout: FragmentLayout) -> Self {
        Self {
            buffer,
            tracker: loss_window.map(PacketLossTracker::new),
            layout,
        }
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn counter_mode(&self) -> bool {
        self.tracker.is_some()
    }

    /// Decode one notification and append both values to the buffer.
    ///
    /// A short payload is rejected before anything is recorded.
    pub fn on_notification(
        &mut self,
        data: &[u8],
    ) -> Result<(EcgSample, Option<PacketLossReport>), DecodeError> {
        let sample = decode_sample(data, self.counter_mode(), self.layout)?;
        self.buffer.extend(sample.values);

        let report = match (self.tracker.as_mut(), sample.counter) {
            (Some(tracker), Some(counter)) => tracker.push(counter),
            _ => None,
        };
        if let Some(report) = &report {
            info!("Lost {} packages", report.lost);
        }
        Ok((sample, report))
    }

    /// Start a fresh loss window.
    pub fn reset(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::encode_sample;

    #[test]
    fn full_buffer_evicts_oldest() {
        let buf = SampleBuffer::new(4);
        buf.extend([1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buf.len(), 4);
        buf.push(5.0);
        assert_eq!(buf.snapshot(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn clones_share_storage() {
        let buf = SampleBuffer::new(8);
        let reader = buf.clone();
        buf.push(1.5);
        assert_eq!(reader.snapshot(), vec![1.5]);
        reader.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buf = SampleBuffer::new(0);
        buf.extend([1.0, 2.0]);
        assert_eq!(buf.snapshot(), vec![2.0]);
        assert_eq!(buf.capacity(), 1);
    }

    #[test]
    fn loss_reports_missing_counters() {
        let mut tracker = PacketLossTracker::new(250);
        // 250 counters spread over c..=c+252: three missing.
        let counters: Vec<u16> = (0u16..=252).filter(|n| ![10, 20, 30].contains(n)).collect();
        assert_eq!(counters.len(), 250);

        let mut report = None;
        for c in counters {
            report = tracker.push(1000 + c);
        }
        let report = report.expect("window complete");
        assert_eq!(report.lost, 3);
        assert_eq!((report.first, report.last), (1000, 1252));
        assert_eq!(report.counters.len(), 250);
    }

    #[test]
    fn loss_window_spans_counter_wrap() {
        let mut tracker = PacketLossTracker::new(4);
        assert_eq!(tracker.push(0xfffe), None);
        tracker.push(0xffff);
        tracker.push(0x0000);
        let report = tracker.push(0x0001).unwrap();
        assert_eq!(report.lost, 0);
    }

    #[test]
    fn repeated_counters_give_negative_loss() {
        let mut tracker = PacketLossTracker::new(3);
        tracker.push(7);
        tracker.push(7);
        let report = tracker.push(7).unwrap();
        assert_eq!(report.lost, -2);
    }

    #[test]
    fn tracker_restarts_after_report() {
        let mut tracker = PacketLossTracker::new(2);
        tracker.push(1);
        assert!(tracker.push(2).is_some());
        assert!(tracker.push(10).is_none());
        tracker.reset();
        assert!(tracker.push(20).is_none());
        assert_eq!(tracker.push(21).unwrap().first, 20);
    }

    #[test]
    fn sink_appends_values_and_tracks_counters() {
        let layout = FragmentLayout::default();
        let mut sink = SampleSink::new(SampleBuffer::new(10), Some(2), layout);

        let (sample, report) = sink
            .on_notification(&encode_sample(5, [1.0, -2.0], layout))
            .unwrap();
        assert_eq!(sample.counter, Some(5));
        assert!(report.is_none());

        let (_, report) = sink
            .on_notification(&encode_sample(7, [3.0, 4.0], layout))
            .unwrap();
        assert_eq!(report.unwrap().lost, 1);
        assert_eq!(sink.buffer().len(), 4);
    }

    #[test]
    fn sink_without_counter_mode_ignores_counter() {
        let layout = FragmentLayout::LowByteOmitted;
        let mut sink = SampleSink::new(SampleBuffer::new(10), None, layout);
        let (sample, report) = sink
            .on_notification(&encode_sample(5, [1.0, 2.0], layout))
            .unwrap();
        assert_eq!(sample.counter, None);
        assert!(report.is_none());
        assert_eq!(sink.buffer().snapshot(), vec![1.0, 2.0]);
    }

    #[test]
    fn short_notification_records_nothing() {
        let mut sink = SampleSink::new(SampleBuffer::new(10), Some(250), FragmentLayout::default());
        let err = sink.on_notification(&[0u8; 16]).unwrap_err();
        assert_eq!(err, DecodeError::ShortSample { len: 16, needed: 17 });
        assert!(sink.buffer().is_empty());
    }
}
