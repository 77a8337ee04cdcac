//! Ambient poll-loop diagnostics: dispatch latency and queue-depth
//! histograms, surfaced for an operator dashboard or a log line on exit.

use hdrhistogram::Histogram;

/// Rolling latency/queue-depth histograms for one running context.
pub struct Diagnostics {
    dispatch_latency_us: Histogram<u64>,
    outbound_queue_depth: Histogram<u64>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            dispatch_latency_us: Histogram::new(3).expect("valid histogram precision"),
            outbound_queue_depth: Histogram::new(3).expect("valid histogram precision"),
        }
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn record_dispatch_latency(&mut self, micros: u64) {
        let _ = self.dispatch_latency_us.record(micros);
    }

    pub fn record_queue_depth(&mut self, depth: u64) {
        let _ = self.outbound_queue_depth.record(depth);
    }

    pub fn dispatch_latency_p99_us(&self) -> u64 {
        self.dispatch_latency_us.value_at_quantile(0.99)
    }

    pub fn max_queue_depth(&self) -> u64 {
        self.outbound_queue_depth.max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p99_reflects_recorded_samples() {
        let mut diag = Diagnostics::new();
        for v in 1..=100 {
            diag.record_dispatch_latency(v);
        }
        assert!(diag.dispatch_latency_p99_us() >= 98);
    }
}
