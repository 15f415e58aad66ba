use std::time::Duration;

/// Runtime knobs for a space's subscription engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsConfig {
    /// Upstream coalescing window.
    pub batch_window: Duration,
    /// Distinct ids pending before the batcher flushes early.
    pub batch_cap: usize,
    /// Records the store feed buffers ahead of the batcher before dropping.
    pub feed_cap: usize,
    /// Capacity of each internal output queue.
    pub queue_cap: usize,
    /// Time zone used by quick-option date filters.
    pub tz_offset_secs: i32,
}

impl Default for SubsConfig {
    fn default() -> Self {
        Self { batch_window: Duration::from_millis(250), batch_cap: 4096, feed_cap: 65536, queue_cap: 1024, tz_offset_secs: 0 }
    }
}

impl SubsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let batch_ms: u64 = std::env::var("QUARRY_BATCH_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.batch_window.as_millis() as u64);
        Self {
            batch_window: Duration::from_millis(batch_ms),
            batch_cap: std::env::var("QUARRY_BATCH_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.batch_cap),
            feed_cap: std::env::var("QUARRY_FEED_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.feed_cap),
            queue_cap: std::env::var("QUARRY_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.queue_cap),
            tz_offset_secs: std::env::var("QUARRY_TZ_OFFSET_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.tz_offset_secs),
        }
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }
}
