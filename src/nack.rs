//! Rate limiting of NACK responses against the target bitrate.

/// Slots in the byte-count ring; newest entry at index 0.
pub const NACK_BYTECOUNT_SIZE: usize = 10;

const AVG_INTERVAL_MS: i64 = 1000;

/// Sliding-window estimator deciding whether answering a NACK would push the
/// retransmission volume past the configured target bitrate.
#[derive(Debug, Default)]
pub struct NackRateLimiter {
    byte_counts: [u32; NACK_BYTECOUNT_SIZE],
    times_ms: [i64; NACK_BYTECOUNT_SIZE],
}

impl NackRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a NACK response fits under `target_bitrate` (bits/s) right
    /// now. A target of 0 means no limit.
    pub fn should_send(&self, now_ms: i64, target_bitrate: u32) -> bool {
        if target_bitrate == 0 {
            return true;
        }
        let mut byte_count: i64 = 0;
        let mut num = 0;
        while num < NACK_BYTECOUNT_SIZE {
            if now_ms - self.times_ms[num] > AVG_INTERVAL_MS {
                // Don't use data older than 1 sec.
                break;
            }
            byte_count += i64::from(self.byte_counts[num]);
            num += 1;
        }
        let mut time_interval = AVG_INTERVAL_MS;
        if num == NACK_BYTECOUNT_SIZE && self.times_ms[num - 1] <= now_ms {
            // The whole ring turned over within the window; measure over the
            // span actually covered.
            time_interval = now_ms - self.times_ms[num - 1];
        }
        byte_count * 8 < i64::from(target_bitrate / 1000) * time_interval
    }

    /// Records bytes spent on a NACK response at `now_ms`.
    pub fn record(&mut self, bytes: u32, now_ms: i64) {
        if bytes == 0 {
            return;
        }
        if self.times_ms[0] != 0 {
            for i in (0..NACK_BYTECOUNT_SIZE - 1).rev() {
                self.byte_counts[i + 1] = self.byte_counts[i];
                self.times_ms[i + 1] = self.times_ms[i];
            }
        }
        self.byte_counts[0] = bytes;
        self.times_ms[0] = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_when_target_is_zero() {
        let mut limiter = NackRateLimiter::new();
        limiter.record(1_000_000, 10);
        assert!(limiter.should_send(11, 0));
    }

    #[test]
    fn test_limit_and_recovery() {
        let mut limiter = NackRateLimiter::new();
        let target = 100_000; // 100 kbps

        limiter.record(2000, 0);
        // 2000 * 8 bits over a 1 ms span exceeds 100 kbps.
        assert!(!limiter.should_send(1, target));
        // A second later the entry has aged out of the window.
        assert!(limiter.should_send(1001, target));
    }

    #[test]
    fn test_budget_within_window() {
        let mut limiter = NackRateLimiter::new();
        let target = 1_000_000; // 1 Mbps = 125_000 bytes/s

        let mut now = 2000;
        let mut recorded: u32 = 0;
        // Pushing 20 kB every 50 ms is 3.2 Mbps; the limiter must cut the
        // flow off within one packet of the 125 kB/s budget.
        while limiter.should_send(now, target) && now < 4000 {
            limiter.record(20_000, now);
            recorded += 20_000;
            now += 50;
        }
        assert!(recorded <= 125_000 + 20_000);
        assert!(recorded >= 125_000 - 20_000);
    }

    #[test]
    fn test_record_shifts_ring() {
        let mut limiter = NackRateLimiter::new();
        for i in 1..=(NACK_BYTECOUNT_SIZE as i64 + 3) {
            limiter.record(100, i);
        }
        assert_eq!(limiter.times_ms[0], NACK_BYTECOUNT_SIZE as i64 + 3);
        assert_eq!(limiter.times_ms[NACK_BYTECOUNT_SIZE - 1], 4);
    }
}
