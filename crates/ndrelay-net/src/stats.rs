//! Per-second traffic statistics ring, aggregated on demand over 1/10/60
//! second windows.

/// Width of the ring: one bucket per second, plus one to absorb jitter
/// around exact-minute boundaries without evicting the 60s window's first
/// second.
pub const TCP_INTERVAL_SECONDS: u64 = 61;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Wall-clock second this bucket's counters belong to. Any other second
    /// hashing to the same slot must zero it before accumulating.
    second: u64,
    packets: u64,
    bytes: u64,
}

/// A ring of 61 one-second buckets indexed by `wall_clock_secs % 61`.
#[derive(Debug)]
pub struct StatsRing {
    buckets: [Bucket; TCP_INTERVAL_SECONDS as usize],
}

impl Default for StatsRing {
    fn default() -> Self {
        Self { buckets: [Bucket::default(); TCP_INTERVAL_SECONDS as usize] }
    }
}

impl StatsRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates `packets`/`bytes` into the bucket for `now_secs`, zeroing
    /// it first if it currently holds a different second's counters.
    pub fn record(&mut self, now_secs: u64, packets: u64, bytes: u64) {
        let idx = (now_secs % TCP_INTERVAL_SECONDS) as usize;
        let bucket = &mut self.buckets[idx];
        if bucket.second != now_secs {
            *bucket = Bucket { second: now_secs, packets: 0, bytes: 0 };
        }
        bucket.packets += packets;
        bucket.bytes += bytes;
    }

    /// Aggregates the trailing `window_secs` seconds ending at (and
    /// including) `now_secs`. Buckets whose stored second doesn't match the
    /// second they're being asked for are treated as empty (stale or never
    /// written).
    #[must_use]
    pub fn window(&self, now_secs: u64, window_secs: u64) -> (u64, u64) {
        let mut packets = 0u64;
        let mut bytes = 0u64;
        let span = window_secs.min(now_secs + 1);
        for age in 0..span {
            let sec = now_secs - age;
            let idx = (sec % TCP_INTERVAL_SECONDS) as usize;
            let bucket = &self.buckets[idx];
            if bucket.second == sec {
                packets += bucket.packets;
                bytes += bucket.bytes;
            }
        }
        (packets, bytes)
    }

    /// Convenience accessors for the three standard windows used in the
    /// periodic log line.
    #[must_use]
    pub fn last_1s(&self, now_secs: u64) -> (u64, u64) {
        self.window(now_secs, 1)
    }

    #[must_use]
    pub fn last_10s(&self, now_secs: u64) -> (u64, u64) {
        self.window(now_secs, 10)
    }

    #[must_use]
    pub fn last_60s(&self, now_secs: u64) -> (u64, u64) {
        self.window(now_secs, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_reports_zero() {
        let ring = StatsRing::new();
        assert_eq!(ring.window(1_000, 60), (0, 0));
    }

    #[test]
    fn window_before_any_traffic_is_zero() {
        let mut ring = StatsRing::new();
        ring.record(1_000, 3, 300);
        assert_eq!(ring.window(900, 60), (0, 0));
    }

    #[test]
    fn aggregates_k_packets_of_b_bytes() {
        let mut ring = StatsRing::new();
        for sec in 100..105 {
            ring.record(sec, 2, 64);
        }
        // 5 seconds of traffic, asking for a 10s window that covers all of it.
        assert_eq!(ring.window(104, 10), (10, 320));
        // A 1s window only sees the most recent second.
        assert_eq!(ring.window(104, 1), (2, 64));
    }

    #[test]
    fn stale_bucket_from_previous_lap_is_ignored() {
        let mut ring = StatsRing::new();
        ring.record(0, 5, 500);
        // One full lap later, same bucket index, different second.
        ring.record(TCP_INTERVAL_SECONDS, 1, 10);
        assert_eq!(ring.window(TCP_INTERVAL_SECONDS, 1), (1, 10));
        assert_eq!(ring.window(0, 1), (5, 500));
    }
}
