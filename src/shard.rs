use crate::connection::ConnectionCommand;
use tokio::sync::mpsc;

/// Lifecycle state of a shard's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Establishing the first connection
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Transport lost, retry pending
    Closed,
    /// Re-establishing the connection after a loss
    Reconnecting,
    /// Retry budget exhausted; the shard performs no further attempts
    Failed,
}

impl ShardState {
    /// Whether the shard is subscribed and receiving messages.
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardState::Connected)
    }

    /// Whether the shard is permanently out of service.
    pub fn is_failed(&self) -> bool {
        matches!(self, ShardState::Failed)
    }
}

/// Manager-side record of a single shard.
///
/// The connection task owns the authoritative topic list; this entry mirrors
/// the count for routing decisions and is written only by the manager.
#[derive(Debug)]
pub(crate) struct ShardEntry {
    /// Shard identifier
    pub id: usize,
    /// Command sender for this shard's connection task
    pub command_tx: mpsc::Sender<ConnectionCommand>,
    /// Current topic count
    pub topic_count: usize,
    /// Maximum topics for this shard
    pub limit: usize,
    /// Last observed lifecycle state
    pub state: ShardState,
}

impl ShardEntry {
    pub fn new(
        id: usize,
        command_tx: mpsc::Sender<ConnectionCommand>,
        topic_count: usize,
        limit: usize,
    ) -> Self {
        Self {
            id,
            command_tx,
            topic_count,
            limit,
            state: ShardState::Connecting,
        }
    }

    /// Whether this shard is at its topic capacity. Always recomputed from
    /// the current count, never cached.
    pub fn full(&self) -> bool {
        self.topic_count >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(topic_count: usize, limit: usize) -> ShardEntry {
        let (tx, _rx) = mpsc::channel(1);
        ShardEntry::new(7, tx, topic_count, limit)
    }

    #[test]
    fn test_full_recomputed_from_count() {
        let mut shard = entry(49, 50);
        assert!(!shard.full());

        shard.topic_count = 50;
        assert!(shard.full());

        shard.topic_count = 51;
        assert!(shard.full());
    }

    #[test]
    fn test_new_entry_starts_connecting() {
        let shard = entry(0, 50);
        assert_eq!(shard.id, 7);
        assert_eq!(shard.state, ShardState::Connecting);
        assert!(!shard.state.is_ready());
        assert!(!shard.state.is_failed());
    }

    #[test]
    fn test_state_predicates() {
        assert!(ShardState::Connected.is_ready());
        assert!(!ShardState::Reconnecting.is_ready());
        assert!(ShardState::Failed.is_failed());
        assert!(!ShardState::Closed.is_failed());
    }
}
