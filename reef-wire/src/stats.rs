//! Per-connection message statistics.

use crate::head::MsgHead;
use reef_types::histogram::{SizeHistogram, TimeHistogram};

/// Latency and payload-size histograms for one message direction.
pub struct MsgStats {
    latency: TimeHistogram,
    fwd_size: SizeHistogram,
    body_size: SizeHistogram,
    data_size: SizeHistogram,
}

impl Default for MsgStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStats {
    /// Empty stats on the canonical bounds.
    pub fn new() -> Self {
        Self {
            latency: TimeHistogram::time(),
            fwd_size: SizeHistogram::sizes(),
            body_size: SizeHistogram::sizes(),
            data_size: SizeHistogram::sizes(),
        }
    }

    /// Count one frame's payload sizes.
    pub fn add(&mut self, head: &MsgHead) {
        self.fwd_size.add(head.fwd_length as u64);
        self.body_size.add(head.body_length as u64);
        self.data_size.add(head.data_length as u64);
    }

    /// Count one request-to-response latency, in nanoseconds.
    pub fn add_latency(&mut self, nanos: u64) {
        self.latency.add(nanos);
    }

    /// Latency histogram.
    pub fn latency(&self) -> &TimeHistogram {
        &self.latency
    }

    /// Frames counted so far.
    pub fn frames(&self) -> u64 {
        self.fwd_size.events()
    }

    /// Payload-size histograms in `(fwd, body, data)` order.
    pub fn sizes(&self) -> (&SizeHistogram, &SizeHistogram, &SizeHistogram) {
        (&self.fwd_size, &self.body_size, &self.data_size)
    }
}
