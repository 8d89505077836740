use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters and per-shard gauges for monitoring the fleet.
///
/// Use `snapshot()` to get a point-in-time view of all metrics, or the
/// individual getter methods for specific values.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    listen_requests_total: AtomicU64,
    pings_sent_total: AtomicU64,
    pongs_received_total: AtomicU64,
    decode_failures_total: AtomicU64,
    moderation_events_total: AtomicU64,
    shards_failed_total: AtomicU64,

    /// Per-shard metrics
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: usize,
    /// Current number of subscribed topics
    pub topic_count: usize,
    /// Whether the shard is currently connected
    pub is_connected: bool,
    /// Number of reconnections this shard has performed
    pub reconnects: u64,
    /// Duration since last message received (None if no messages)
    pub time_since_last_message: Option<Duration>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl ShardMetrics {
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Total reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Total messages received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Total messages sent
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Total `LISTEN` requests sent
    pub fn listen_requests(&self) -> u64 {
        self.listen_requests_total.load(Ordering::Relaxed)
    }

    /// Total heartbeat pings sent
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    /// Total heartbeat pongs received
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received_total.load(Ordering::Relaxed)
    }

    /// Total frames that failed to decode
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    /// Total moderation events decoded
    pub fn moderation_events(&self) -> u64 {
        self.moderation_events_total.load(Ordering::Relaxed)
    }

    /// Total shards that exhausted their retry budget
    pub fn shards_failed(&self) -> u64 {
        self.shards_failed_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_listen_request(&self) {
        self.listen_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong(&self) {
        self.pongs_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_moderation_event(&self) {
        self.moderation_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard_failed(&self) {
        self.shards_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Stamp a received message on a shard (for freshness tracking)
    pub(crate) fn record_shard_message_received(&self, shard_id: usize) {
        self.update_shard(shard_id, |s| s.last_message_at = Some(Instant::now()));
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: usize, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();

        // Ensure we have enough entries
        while shards.len() <= shard_id {
            let id = shards.len();
            shards.push(ShardMetrics {
                shard_id: id,
                ..Default::default()
            });
        }

        update_fn(&mut shards[shard_id]);
    }

    /// Snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Current count of connected shards
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Total topic count across all shards
    pub fn total_topics(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .map(|s| s.topic_count)
            .sum()
    }

    /// Point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            listen_requests_total: self.listen_requests_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            pongs_received_total: self.pongs_received_total.load(Ordering::Acquire),
            decode_failures_total: self.decode_failures_total.load(Ordering::Acquire),
            moderation_events_total: self.moderation_events_total.load(Ordering::Acquire),
            shards_failed_total: self.shards_failed_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            total_topics: shard_snapshots.iter().map(|s| s.topic_count).sum(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub listen_requests_total: u64,
    pub pings_sent_total: u64,
    pub pongs_received_total: u64,
    pub decode_failures_total: u64,
    pub moderation_events_total: u64,
    pub shards_failed_total: u64,
    pub active_connections: usize,
    pub total_topics: usize,
    pub shards: Vec<ShardMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnection();
        metrics.record_pong();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.pongs_received(), 1);
        assert_eq!(metrics.pings_sent(), 0);
    }

    #[test]
    fn test_shard_metrics() {
        let metrics = Metrics::new();

        metrics.update_shard(0, |s| {
            s.is_connected = true;
            s.topic_count = 50;
        });
        metrics.update_shard(1, |s| {
            s.is_connected = true;
            s.topic_count = 20;
        });

        assert_eq!(metrics.active_connections(), 2);
        assert_eq!(metrics.total_topics(), 70);
    }

    #[test]
    fn test_shard_freshness_tracking() {
        let metrics = Metrics::new();

        metrics.record_shard_message_received(0);

        let shards = metrics.shard_metrics();
        let age = shards[0].time_since_last_message.expect("stamped");
        assert!(age < Duration::from_secs(1));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_moderation_event();
        metrics.update_shard(0, |s| {
            s.is_connected = true;
            s.topic_count = 30;
        });

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.moderation_events_total, 1);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_topics, 30);
        assert_eq!(snapshot.shards.len(), 1);
    }
}
