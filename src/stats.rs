//! Per-stream counters, the send-side delay window and windowed bitrate
//! estimation.

use std::collections::BTreeMap;

/// Delay samples older than this are dropped from the send-side window.
pub const SEND_SIDE_DELAY_WINDOW_MS: i64 = 1000;

/// Counters for one outgoing stream (primary or RTX).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataCounters {
    /// Payload bytes, excluding RTP headers and padding.
    pub bytes: u64,
    pub header_bytes: u64,
    pub padding_bytes: u64,
    pub packets: u32,
    pub retransmitted_packets: u32,
    pub fec_packets: u32,
}

/// Snapshot produced when a bitrate estimator recomputes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BitrateStatistics {
    pub bitrate_bps: u32,
    pub packet_rate: u32,
    pub timestamp_ms: i64,
}

/// Accumulates bytes between periodic `process` calls and turns them into a
/// rate over the elapsed interval.
#[derive(Debug, Default)]
pub struct Bitrate {
    accumulated_bytes: u64,
    accumulated_packets: u32,
    last_process_ms: i64,
    last_stats: BitrateStatistics,
}

impl Bitrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: usize) {
        self.accumulated_bytes += bytes as u64;
        self.accumulated_packets += 1;
    }

    /// Recomputes the rate over the interval since the previous call.
    /// Returns the fresh statistics, or `None` when no time has passed.
    pub fn process(&mut self, now_ms: i64) -> Option<BitrateStatistics> {
        if self.last_process_ms == 0 {
            // First call only anchors the interval.
            self.last_process_ms = now_ms;
            self.accumulated_bytes = 0;
            self.accumulated_packets = 0;
            return None;
        }
        let elapsed_ms = now_ms - self.last_process_ms;
        if elapsed_ms <= 0 {
            return None;
        }
        self.last_stats = BitrateStatistics {
            bitrate_bps: (self.accumulated_bytes * 8000 / elapsed_ms as u64) as u32,
            packet_rate: (u64::from(self.accumulated_packets) * 1000 / elapsed_ms as u64) as u32,
            timestamp_ms: now_ms,
        };
        self.accumulated_bytes = 0;
        self.accumulated_packets = 0;
        self.last_process_ms = now_ms;
        Some(self.last_stats)
    }

    /// The rate computed by the most recent `process` call.
    pub fn bitrate_last(&self) -> u32 {
        self.last_stats.bitrate_bps
    }
}

/// Sliding window of per-packet send delays (`now - capture_time`).
#[derive(Debug, Default)]
pub struct SendDelayWindow {
    send_delays: BTreeMap<i64, i64>,
}

impl SendDelayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, now_ms: i64, delay_ms: i64) {
        self.send_delays.insert(now_ms, delay_ms);
        self.send_delays = self
            .send_delays
            .split_off(&(now_ms - SEND_SIDE_DELAY_WINDOW_MS + 1));
    }

    /// Rounded mean and max over samples strictly newer than
    /// `now - SEND_SIDE_DELAY_WINDOW_MS`. `None` when the window is empty.
    pub fn report(&self, now_ms: i64) -> Option<(i64, i64)> {
        let mut sum = 0i64;
        let mut max = i64::MIN;
        let mut count = 0i64;
        for (_, delay) in self
            .send_delays
            .range(now_ms - SEND_SIDE_DELAY_WINDOW_MS + 1..)
        {
            sum += delay;
            max = max.max(*delay);
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(((sum + count / 2) / count, max))
    }
}
