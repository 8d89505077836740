//! Example: printing a live moderation log
//!
//! Reads credentials from the environment and channel ids from the command
//! line, then prints every decoded moderation action.
//!
//! Run with: cargo run --example modlog -- <channel_id> [<channel_id> ...]

use modstream::{ActionDuration, Event, ManagerConfig, ShardManager};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let token = std::env::var("PUBSUB_TOKEN")?;
    let moderator_id = std::env::var("PUBSUB_MODERATOR_ID")?;
    let channels: Vec<String> = std::env::args().skip(1).collect();
    if channels.is_empty() {
        eprintln!("usage: modlog <channel_id> [<channel_id> ...]");
        std::process::exit(2);
    }

    info!("Watching moderation actions on {} channels", channels.len());

    let config = ManagerConfig::builder(token, moderator_id)
        .channels(channels)
        .build()?;

    let (manager, mut events) = ShardManager::new(config);
    manager.start().await?;

    while let Some(event) = events.recv().await {
        match event {
            Event::Ready => info!("Fleet ready"),
            Event::ShardReady { shard_id } => info!("Shard {shard_id} subscribed"),
            Event::Moderation { shard_id, event } => {
                let target = event
                    .target
                    .as_ref()
                    .map(|t| format!(" -> {}", t.name))
                    .unwrap_or_default();
                let duration = match event.duration {
                    ActionDuration::Permanent => " (permanent)".to_string(),
                    ActionDuration::Seconds(s) => format!(" ({s}s)"),
                    ActionDuration::None => String::new(),
                };
                println!(
                    "[shard {shard_id}] #{}: {} by {}{}{}",
                    event.channel_id,
                    event.action.name(),
                    event.moderator.name,
                    target,
                    duration,
                );
            }
            Event::ServiceError { shard_id, message } => {
                warn!("Shard {shard_id} upstream error: {message}");
            }
            Event::ShardDisconnected { shard_id, reason } => {
                warn!("Shard {shard_id} out of service: {reason}");
            }
            Event::Pong { .. } | Event::Message { .. } => {}
        }
    }

    Ok(())
}
