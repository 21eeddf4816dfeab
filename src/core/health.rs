use hdrhistogram::Histogram;
use tokio::time::Instant;

use super::circular_buffer::CircularBuffer;
use super::types::{ClientError, ClientResult, SessionState, SessionStats};

const MAX_RECENT_CLOSES: usize = 32;

/// Per-session health counters, owned by the session actor.
#[derive(Debug)]
pub struct SessionHealth {
    started: Instant,
    last_message_received: Instant,
    message_count: u64,
    reconnect_count: u64,
    recent_closes: CircularBuffer<Option<u16>>,
    rtt_histogram: Histogram<u64>,
}

impl SessionHealth {
    pub fn new() -> ClientResult<Self> {
        let now = Instant::now();
        let rtt_histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .map_err(|err| ClientError::InvalidState(format!("rtt histogram: {err}")))?;
        Ok(Self {
            started: now,
            last_message_received: now,
            message_count: 0,
            reconnect_count: 0,
            recent_closes: CircularBuffer::new(MAX_RECENT_CLOSES),
            rtt_histogram,
        })
    }

    pub fn record_message(&mut self) {
        self.last_message_received = Instant::now();
        self.message_count = self.message_count.saturating_add(1);
    }

    pub fn record_close(&mut self, code: Option<u16>) {
        self.recent_closes.push(code);
    }

    pub fn record_rtt(&mut self, rtt: std::time::Duration) {
        let micros = rtt.as_micros().clamp(1, u64::MAX as u128) as u64;
        let _ = self.rtt_histogram.saturating_record(micros);
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    pub fn snapshot(&self, state: SessionState, sequence: Option<u64>) -> SessionStats {
        let samples = self.rtt_histogram.len();
        let (p50, p99) = if samples == 0 {
            (0, 0)
        } else {
            (
                self.rtt_histogram.value_at_percentile(50.0),
                self.rtt_histogram.value_at_percentile(99.0),
            )
        };

        SessionStats {
            state,
            sequence,
            uptime: self.started.elapsed(),
            messages: self.message_count,
            reconnects: self.reconnect_count,
            last_message_age: self.last_message_received.elapsed(),
            recent_close_codes: self.recent_closes.iter().copied().collect(),
            p50_heartbeat_rtt_us: p50,
            p99_heartbeat_rtt_us: p99,
            heartbeat_samples: samples,
        }
    }
}
