use std::collections::VecDeque;

use crate::protocol::{TimeSyncRequest, TimeSyncResponse};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSample {
    pub rtt_s: f64,
    /// Server time minus local time.
    pub offset_s: f64,
}

/// Estimates the server clock from request/response round trips. The
/// lowest-RTT sample in the window has the least queuing noise, so it wins.
#[derive(Debug)]
pub struct TimeSync {
    samples: VecDeque<TimeSample>,
    max_samples: usize,
    interval_s: f64,
    last_request_s: Option<f64>,
}

impl TimeSync {
    pub fn new(interval_s: f64, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.max(1)),
            max_samples: max_samples.max(1),
            interval_s,
            last_request_s: None,
        }
    }

    pub fn is_synced(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Returns a request when one is due.
    pub fn poll_request(&mut self, now_s: f64) -> Option<TimeSyncRequest> {
        if self
            .last_request_s
            .is_some_and(|last_s| now_s - last_s < self.interval_s)
        {
            return None;
        }
        self.last_request_s = Some(now_s);
        Some(TimeSyncRequest { client_time_s: now_s })
    }

    pub fn on_response(&mut self, response: &TimeSyncResponse, now_s: f64) {
        let rtt_s = now_s - response.client_time_s;
        if rtt_s < 0.0 {
            log::debug!("Ignoring time sync response from the future ({:.3}s)", rtt_s);
            return;
        }
        // The server stamped its clock roughly half a round trip after we sent.
        let offset_s = response.server_time_s - (response.client_time_s + rtt_s / 2.0);
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(TimeSample { rtt_s, offset_s });
        log::trace!("Time sample: rtt {:.1}ms, offset {:.3}s", rtt_s * 1000.0, offset_s);
    }

    pub fn best_sample(&self) -> Option<TimeSample> {
        self.samples
            .iter()
            .copied()
            .min_by(|a, b| a.rtt_s.total_cmp(&b.rtt_s))
    }

    pub fn rtt_s(&self) -> Option<f64> {
        self.best_sample().map(|sample| sample.rtt_s)
    }

    pub fn server_time_s(&self, now_s: f64) -> Option<f64> {
        self.best_sample().map(|sample| now_s + sample.offset_s)
    }
}
