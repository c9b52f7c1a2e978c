//! Telemetry observer traits.
//!
//! All callbacks except [`StreamDataCountersObserver`] are invoked with no
//! sender lock held. The counters observer fires under the stats lock and
//! therefore must not call back into the sender.

use crate::payload::FrameType;
use crate::stats::{BitrateStatistics, StreamDataCounters};

pub trait FrameCountObserver: Send + Sync {
    fn frame_count_updated(&self, frame_type: FrameType, count: u32, ssrc: u32);
}

pub trait StreamDataCountersObserver: Send + Sync {
    fn data_counters_updated(&self, counters: &StreamDataCounters, ssrc: u32);
}

pub trait SendSideDelayObserver: Send + Sync {
    fn send_side_delay_updated(&self, avg_delay_ms: i64, max_delay_ms: i64, ssrc: u32);
}

pub trait BitrateObserver: Send + Sync {
    fn bitrate_updated(&self, stats: &BitrateStatistics, ssrc: u32);
}
