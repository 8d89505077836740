//! # modstream
//!
//! A sharded pubsub client for chat moderation-action streams.
//!
//! The upstream service caps the number of topics a single WebSocket
//! connection may subscribe to. This crate splits an arbitrary-size topic set
//! across multiple connections ("shards"), keeps each one alive, recovers
//! from drops, and decodes moderation-action payloads into typed events.
//!
//! ## Features
//!
//! - **Sharding** — topic sets of any size, partitioned into
//!   capacity-bounded shards with rate-limited shard creation
//! - **Auto-reconnection** with a bounded rapid-retry budget per shard
//! - **Live topic addition** routed to the newest shard, overflowing into a
//!   new shard when it is full
//! - **Typed events** — bans, timeouts, room-mode toggles, and mod grants
//!   decoded into [`ModerationEvent`]s
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use modstream::{Event, ManagerConfig, ShardManager};
//!
//! let config = ManagerConfig::builder("oauth:...", "44322889")
//!     .channels(["12826", "79286"])
//!     .build()?;
//!
//! let (manager, mut events) = ShardManager::new(config);
//! manager.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Moderation { shard_id, event } => {
//!             println!("[shard {shard_id}] {} in {}", event.action.name(), event.channel_id);
//!         }
//!         Event::ShardDisconnected { shard_id, .. } => {
//!             eprintln!("shard {shard_id} is gone");
//!         }
//!         _ => {}
//!     }
//! }
//! ```

mod codec;
mod config;
mod connection;
mod error;
mod manager;
mod metrics;
mod nonce;
mod retry;
mod shard;

pub use codec::{
    decode, ActionDuration, DecodeError, DecodedMessage, ModAction, ModerationEvent, Topic,
    UserRef,
};
pub use config::{
    ConfigError, Credentials, ManagerConfig, ManagerConfigBuilder, RetryConfig, DEFAULT_ENDPOINT,
    DEFAULT_TOPIC_LIMIT,
};
pub use error::{AddTopicError, Error, TopicAdded};
pub use manager::{Event, ShardManager};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use shard::ShardState;

/// Result type for modstream operations
pub type Result<T> = std::result::Result<T, Error>;
