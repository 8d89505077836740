use crate::codec::Topic;
use thiserror::Error;

/// Errors that can occur in modstream
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to establish a connection (DNS, TCP, TLS, or handshake)
    #[error("connection failed: {0}")]
    Connect(String),

    /// Outbound frame could not be serialized
    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The manager was started twice
    #[error("manager is already running")]
    AlreadyRunning,

    /// Channel send error
    #[error("channel send error: {0}")]
    ChannelSend(String),
}

/// Successful outcome of [`ShardManager::add_topic`].
///
/// `shard_id` is `None` when the topic was already known to the manager and
/// no network activity took place.
///
/// [`ShardManager::add_topic`]: crate::ShardManager::add_topic
#[derive(Debug, Clone)]
pub struct TopicAdded {
    pub topic: Topic,
    pub shard_id: Option<usize>,
}

/// Failure outcome of [`ShardManager::add_topic`].
///
/// `ShardFull` never escapes the manager: it triggers overflow into a freshly
/// created shard instead. Every other variant is surfaced to the caller
/// unchanged.
///
/// [`ShardManager::add_topic`]: crate::ShardManager::add_topic
#[derive(Error, Debug)]
pub enum AddTopicError {
    /// The shard is already at its topic capacity.
    #[error("shard {shard_id} is full")]
    ShardFull { topic: Topic, shard_id: usize },

    /// The correlation window elapsed without a `RESPONSE`.
    #[error("no response from upstream for {topic} on shard {shard_id}")]
    NoResponse { topic: Topic, shard_id: usize },

    /// The upstream explicitly rejected the subscribe request.
    #[error("upstream rejected {topic} on shard {shard_id}: {message}")]
    Rejected {
        topic: Topic,
        shard_id: usize,
        message: String,
    },

    /// The shard's connection task is gone (failed shard or teardown).
    #[error("shard {shard_id} is no longer accepting requests")]
    ShardUnavailable { topic: Topic, shard_id: usize },

    /// The manager has not been started.
    #[error("manager is not running")]
    NotStarted { topic: Topic },
}

impl AddTopicError {
    /// The topic the failed request was for.
    pub fn topic(&self) -> &Topic {
        match self {
            AddTopicError::ShardFull { topic, .. }
            | AddTopicError::NoResponse { topic, .. }
            | AddTopicError::Rejected { topic, .. }
            | AddTopicError::ShardUnavailable { topic, .. }
            | AddTopicError::NotStarted { topic } => topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_topic_error_messages_carry_context() {
        let topic = Topic::new("1", "2");
        let err = AddTopicError::Rejected {
            topic: topic.clone(),
            shard_id: 3,
            message: "ERR_BADAUTH".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"));
        assert!(msg.contains("ERR_BADAUTH"));
        assert_eq!(err.topic(), &topic);
    }
}
