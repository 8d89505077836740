use crate::codec::{self, DecodedMessage, ModerationEvent, Topic};
use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionCommand, ShardNotice};
use crate::error::{AddTopicError, Error, TopicAdded};
use crate::metrics::Metrics;
use crate::shard::{ShardEntry, ShardState};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Notifications published to the consumer of a [`ShardManager`].
#[derive(Debug, Clone)]
pub enum Event {
    /// The fleet reached steady state: the first shard with spare capacity
    /// connected. Emitted at most once per manager.
    Ready,
    /// A shard connected and sent its subscribe request (also after
    /// reconnects).
    ShardReady { shard_id: usize },
    /// A decoded moderation action.
    Moderation {
        shard_id: usize,
        event: ModerationEvent,
    },
    /// An inbound frame outside the moderation vocabulary, forwarded
    /// verbatim.
    Message {
        shard_id: usize,
        payload: serde_json::Value,
    },
    /// Heartbeat acknowledgment from the upstream.
    Pong { shard_id: usize },
    /// The upstream reported an error on a subscribe request.
    ServiceError { shard_id: usize, message: String },
    /// A shard exhausted its retry budget and is permanently out of
    /// service. Its topics are lost unless re-requested.
    ShardDisconnected { shard_id: usize, reason: String },
}

struct ManagerState {
    /// Shards by id; ids are monotonic, so iteration order is creation order
    shards: BTreeMap<usize, ShardEntry>,
    /// Every topic known to the manager, in subscription order
    topics: Vec<Topic>,
    /// Set once the first non-full shard becomes ready
    started: bool,
    is_running: bool,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            shards: BTreeMap::new(),
            topics: Vec::new(),
            started: false,
            is_running: false,
        }
    }
}

/// State shared between the manager handle and its background tasks.
struct Shared {
    config: ManagerConfig,
    metrics: Arc<Metrics>,
    state: RwLock<ManagerState>,
    /// Monotonically increasing counter; shard ids are never reused
    next_shard_id: AtomicUsize,
    notice_tx: mpsc::Sender<ShardNotice>,
    event_tx: mpsc::Sender<Event>,
    handles: RwLock<BTreeMap<usize, JoinHandle<()>>>,
}

impl Shared {
    /// Create a shard owning `topics` and register it.
    fn spawn_shard(&self, topics: Vec<Topic>) -> usize {
        let shard_id = self.next_shard_id.fetch_add(1, Ordering::SeqCst);
        let topic_count = topics.len();

        debug!(
            "[SHARD-{}] Creating shard with {} topics (limit {})",
            shard_id, topic_count, self.config.topic_limit
        );

        let (command_tx, command_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let connection = Connection::new(
            shard_id,
            topics,
            self.config.clone(),
            self.metrics.clone(),
            self.notice_tx.clone(),
            command_rx,
        );
        let handle = tokio::spawn(connection.run());

        {
            let mut state = self.state.write();
            state.shards.insert(
                shard_id,
                ShardEntry::new(shard_id, command_tx, topic_count, self.config.topic_limit),
            );
        }
        self.handles.write().insert(shard_id, handle);
        self.metrics.update_shard(shard_id, |s| {
            s.topic_count = topic_count;
            s.is_connected = false;
        });

        shard_id
    }

    async fn emit(&self, event: Event) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Event receiver dropped, notification discarded");
        }
    }

    /// Decode an inbound frame and republish it as a typed event.
    async fn dispatch_message(&self, shard_id: usize, raw: &str) {
        match codec::decode(raw) {
            Ok(DecodedMessage::Response { error, .. }) => {
                if !error.is_empty() {
                    self.emit(Event::ServiceError {
                        shard_id,
                        message: error,
                    })
                    .await;
                }
            }
            Ok(DecodedMessage::Pong) => {
                self.metrics.record_pong();
                self.emit(Event::Pong { shard_id }).await;
            }
            Ok(DecodedMessage::Moderation(event)) => {
                self.metrics.record_moderation_event();
                self.emit(Event::Moderation { shard_id, event }).await;
            }
            Ok(DecodedMessage::Other(payload)) => {
                self.emit(Event::Message { shard_id, payload }).await;
            }
            Err(e) => {
                // Contained here; an undecodable frame never affects the
                // connection it arrived on.
                self.metrics.record_decode_failure();
                debug!("[SHARD-{}] Undecodable frame: {}", shard_id, e);
            }
        }
    }
}

/// Splits a topic set across capacity-bounded WebSocket shards and turns the
/// combined inbound stream into typed [`Event`]s.
///
/// Shards are created at a fixed stagger to avoid bursting connection
/// attempts against the upstream, each keeps itself alive with heartbeats and
/// a bounded rapid-retry reconnect policy, and ad-hoc topic additions are
/// routed to the most recently created shard, overflowing into a new one when
/// it is full.
pub struct ShardManager {
    shared: Arc<Shared>,
    /// Taken by `start()`; the manager cannot be started twice
    notice_rx: Mutex<Option<mpsc::Receiver<ShardNotice>>>,
    /// Serializes `add_topic` calls: one in-flight add per shard at a time
    add_gate: tokio::sync::Mutex<()>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    spawner_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ShardManager {
    /// Create a new shard manager and the receiver its events arrive on.
    pub fn new(config: ManagerConfig) -> (Self, mpsc::Receiver<Event>) {
        let (notice_tx, notice_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);

        let manager = Self {
            shared: Arc::new(Shared {
                config,
                metrics: Arc::new(Metrics::new()),
                state: RwLock::new(ManagerState::default()),
                next_shard_id: AtomicUsize::new(0),
                notice_tx,
                event_tx,
                handles: RwLock::new(BTreeMap::new()),
            }),
            notice_rx: Mutex::new(Some(notice_rx)),
            add_gate: tokio::sync::Mutex::new(()),
            pump_handle: Mutex::new(None),
            spawner_handle: Mutex::new(None),
        };
        (manager, event_rx)
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Check if the manager is currently running
    pub fn is_running(&self) -> bool {
        self.shared.state.read().is_running
    }

    /// Whether the fleet-level `Ready` event has fired
    pub fn is_started(&self) -> bool {
        self.shared.state.read().started
    }

    /// Current shard count (failed shards included; they stay record-held)
    pub fn shard_count(&self) -> usize {
        self.shared.state.read().shards.len()
    }

    /// Total topics known to the manager
    pub fn topic_count(&self) -> usize {
        self.shared.state.read().topics.len()
    }

    /// Last observed lifecycle state of a shard
    pub fn shard_state(&self, shard_id: usize) -> Option<ShardState> {
        self.shared
            .state
            .read()
            .shards
            .get(&shard_id)
            .map(|s| s.state)
    }

    /// Start the manager.
    ///
    /// Normalizes and deduplicates the configured channels, partitions them
    /// into chunks of at most `topic_limit` topics, and creates one shard per
    /// chunk, staggered by the spawn interval. An empty channel list creates
    /// no shards; the first `add_topic` call creates one. Returns once the
    /// background tasks are spawned — shard creation continues behind it.
    pub async fn start(&self) -> Result<(), Error> {
        let notice_rx = self
            .notice_rx
            .lock()
            .take()
            .ok_or(Error::AlreadyRunning)?;

        let topics = normalize_channels(
            &self.shared.config.credentials.moderator_id,
            &self.shared.config.channels,
        );
        let chunks = chunk_topics(&topics, self.shared.config.topic_limit);

        {
            let mut state = self.shared.state.write();
            state.is_running = true;
            state.topics = topics;
        }

        info!(
            "Starting ShardManager with {} topics across {} shards (max {} per shard)",
            self.topic_count(),
            chunks.len(),
            self.shared.config.topic_limit
        );

        *self.pump_handle.lock() = Some(tokio::spawn(run_pump(self.shared.clone(), notice_rx)));
        *self.spawner_handle.lock() =
            Some(tokio::spawn(run_spawner(self.shared.clone(), chunks)));

        Ok(())
    }

    /// Subscribe one more channel on a live shard.
    ///
    /// Duplicates resolve immediately without network activity. Novel topics
    /// go to the most recently created shard; if that shard is full, a new
    /// shard is created seeded with just this topic. Calls are serialized
    /// internally, so at most one add is in flight per shard.
    pub async fn add_topic(&self, channel_id: &str) -> Result<TopicAdded, AddTopicError> {
        let topic = Topic::new(
            &self.shared.config.credentials.moderator_id,
            channel_id,
        );
        let _gate = self.add_gate.lock().await;

        let last_shard = {
            let state = self.shared.state.read();
            if !state.is_running {
                return Err(AddTopicError::NotStarted { topic });
            }
            if state.topics.contains(&topic) {
                trace!("Topic {} already known, nothing to do", topic);
                return Ok(TopicAdded {
                    topic,
                    shard_id: None,
                });
            }
            state
                .shards
                .last_key_value()
                .map(|(id, entry)| (*id, entry.command_tx.clone()))
        };

        let Some((shard_id, command_tx)) = last_shard else {
            // No shards yet: the backlog was empty at start.
            let new_id = self.overflow(topic.clone());
            return Ok(TopicAdded {
                topic,
                shard_id: Some(new_id),
            });
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if command_tx
            .send(ConnectionCommand::AddTopic {
                topic: topic.clone(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(AddTopicError::ShardUnavailable { topic, shard_id });
        }

        match reply_rx.await {
            Err(_) => Err(AddTopicError::ShardUnavailable { topic, shard_id }),
            Ok(Ok(count)) => {
                let mut state = self.shared.state.write();
                if let Some(entry) = state.shards.get_mut(&shard_id) {
                    entry.topic_count = count;
                }
                state.topics.push(topic.clone());
                drop(state);
                Ok(TopicAdded {
                    topic,
                    shard_id: Some(shard_id),
                })
            }
            Ok(Err(AddTopicError::ShardFull { topic, .. })) => {
                debug!(
                    "[SHARD-{}] Full, overflowing {} into a new shard",
                    shard_id, topic
                );
                let new_id = self.overflow(topic.clone());
                Ok(TopicAdded {
                    topic,
                    shard_id: Some(new_id),
                })
            }
            Ok(Err(e)) => Err(e),
        }
    }

    fn overflow(&self, topic: Topic) -> usize {
        let new_id = self.shared.spawn_shard(vec![topic.clone()]);
        self.shared.state.write().topics.push(topic);
        new_id
    }

    /// Stop all shards gracefully
    pub async fn stop(&self) -> Result<(), Error> {
        info!("Stopping ShardManager");

        // Stop staggered spawning first so no shard appears mid-teardown.
        if let Some(handle) = self.spawner_handle.lock().take() {
            handle.abort();
        }

        let channels: Vec<_> = {
            let mut state = self.shared.state.write();
            state.is_running = false;
            state
                .shards
                .values()
                .map(|s| s.command_tx.clone())
                .collect()
        };

        for tx in channels {
            if tx.send(ConnectionCommand::Close).await.is_err() {
                debug!("Shard connection already stopped");
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.shared.handles.write();
            std::mem::take(&mut *handles).into_values().collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }

        {
            let mut state = self.shared.state.write();
            state.shards.clear();
            state.topics.clear();
        }

        info!("ShardManager stopped");
        Ok(())
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        // Abort background tasks to prevent orphans
        if let Some(handle) = self.spawner_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }
        let handles = std::mem::take(&mut *self.shared.handles.write());
        for (_, handle) in handles {
            handle.abort();
        }
    }
}

/// Create one shard per chunk, staggered by the configured interval.
async fn run_spawner(shared: Arc<Shared>, chunks: Vec<Vec<Topic>>) {
    for (i, chunk) in chunks.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(shared.config.spawn_interval).await;
        }
        let shard_id = shared.spawn_shard(chunk);
        debug!("[SHARD-{}] Spawned from initial backlog", shard_id);
    }
    debug!("Initial backlog drained");
}

/// Aggregate shard notices into manager-level events.
async fn run_pump(shared: Arc<Shared>, mut notice_rx: mpsc::Receiver<ShardNotice>) {
    while let Some(notice) = notice_rx.recv().await {
        match notice {
            ShardNotice::Ready {
                shard_id,
                topic_count,
            } => {
                let fire_fleet_ready = {
                    let mut state = shared.state.write();
                    let mut not_full = topic_count < shared.config.topic_limit;
                    if let Some(entry) = state.shards.get_mut(&shard_id) {
                        entry.topic_count = topic_count;
                        entry.state = ShardState::Connected;
                        not_full = !entry.full();
                    }
                    if not_full && !state.started {
                        state.started = true;
                        true
                    } else {
                        false
                    }
                };
                if fire_fleet_ready {
                    info!("Fleet ready (first shard with spare capacity connected)");
                    shared.emit(Event::Ready).await;
                }
                shared.emit(Event::ShardReady { shard_id }).await;
            }
            ShardNotice::Message { shard_id, raw } => {
                trace!("[SHARD-{}] <- {}", shard_id, raw);
                shared.dispatch_message(shard_id, &raw).await;
            }
            ShardNotice::Disconnected { shard_id, reason } => {
                // Record-held: the entry stays in the registry as failed.
                {
                    let mut state = shared.state.write();
                    if let Some(entry) = state.shards.get_mut(&shard_id) {
                        entry.state = ShardState::Failed;
                    }
                }
                warn!("[SHARD-{}] Shard failed: {}", shard_id, reason);
                shared
                    .emit(Event::ShardDisconnected { shard_id, reason })
                    .await;
            }
        }
    }
    debug!("Notice pump stopped");
}

/// Normalize channel ids into fully-qualified topics, deduplicating while
/// preserving first-seen order.
fn normalize_channels(moderator_id: &str, channels: &[String]) -> Vec<Topic> {
    let mut seen = HashSet::new();
    channels
        .iter()
        .map(|channel| Topic::new(moderator_id, channel))
        .filter(|topic| seen.insert(topic.clone()))
        .collect()
}

/// Partition a topic list into chunks of at most `limit` topics.
fn chunk_topics(topics: &[Topic], limit: usize) -> Vec<Vec<Topic>> {
    topics.chunks(limit).map(|chunk| chunk.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;

    fn topics(n: usize) -> Vec<Topic> {
        (0..n).map(|i| Topic::new("1000", &i.to_string())).collect()
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        assert_eq!(chunk_topics(&topics(0), 50).len(), 0);
        assert_eq!(chunk_topics(&topics(1), 50).len(), 1);
        assert_eq!(chunk_topics(&topics(50), 50).len(), 1);
        assert_eq!(chunk_topics(&topics(51), 50).len(), 2);
        assert_eq!(chunk_topics(&topics(100), 50).len(), 2);
        assert_eq!(chunk_topics(&topics(101), 50).len(), 3);
    }

    #[test]
    fn test_chunks_respect_limit_and_preserve_order() {
        let all = topics(23);
        let chunks = chunk_topics(&all, 7);

        assert!(chunks.iter().all(|c| c.len() <= 7));
        let rejoined: Vec<Topic> = chunks.into_iter().flatten().collect();
        assert_eq!(rejoined, all);
    }

    #[test]
    fn test_normalize_deduplicates_preserving_order() {
        let channels: Vec<String> = ["3", "1", "3", "2", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let normalized = normalize_channels("1000", &channels);

        assert_eq!(
            normalized,
            vec![
                Topic::new("1000", "3"),
                Topic::new("1000", "1"),
                Topic::new("1000", "2"),
            ]
        );
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig::builder("oauth:test", "1000")
            .endpoint("ws://127.0.0.1:1")
            .build()
            .expect("valid config")
    }

    #[test]
    fn test_new_manager_is_idle() {
        let (manager, _events) = ShardManager::new(test_config());

        assert!(!manager.is_running());
        assert!(!manager.is_started());
        assert_eq!(manager.shard_count(), 0);
        assert_eq!(manager.topic_count(), 0);
        assert!(manager.shard_state(0).is_none());
    }

    #[tokio::test]
    async fn test_add_topic_before_start_is_rejected() {
        let (manager, _events) = ShardManager::new(test_config());

        let err = manager.add_topic("4242").await.unwrap_err();
        assert!(matches!(err, AddTopicError::NotStarted { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (manager, _events) = ShardManager::new(test_config());

        manager.start().await.expect("first start");
        assert!(manager.is_running());
        assert!(matches!(
            manager.start().await,
            Err(Error::AlreadyRunning)
        ));
        manager.stop().await.expect("stop");
    }
}
