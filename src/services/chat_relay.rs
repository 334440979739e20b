//! Redis fan-out for chat events
//!
//! Each conversation has a channel `akimori:chat:<conversation id>`. Senders
//! publish the serialized frame there, and every instance runs one relay that
//! pattern-subscribes to all chat channels and hands frames to its local
//! [`ConnectionRegistry`]. A publishing instance gets its own frames back
//! through the relay like everyone else.

use crate::services::chat::ConnectionRegistry;
use anyhow::{Context, Result};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;

const CHANNEL_PREFIX: &str = "akimori:chat:";

/// Pause before the relay resubscribes after losing Redis
const RELAY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Channel carrying the frames of one conversation
pub fn channel_for(conversation_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, conversation_id)
}

/// Conversation id of a chat channel, `None` for anything else
pub fn conversation_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .filter(|id| !id.is_empty())
}

#[derive(Clone)]
pub struct RedisChatBus {
    client: Client,
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisChatBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChatBus").finish_non_exhaustive()
    }
}

impl RedisChatBus {
    /// Open the publishing connection. The relay opens its own.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { client, connection })
    }

    pub async fn publish(&self, conversation_id: &str, frame: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel_for(conversation_id), frame)
            .await
            .context("Failed to publish chat event")
    }

    /// Run the relay in the background, resubscribing whenever the
    /// connection drops
    pub fn spawn_relay(&self, registry: ConnectionRegistry) {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match relay(&client, &registry).await {
                    Ok(()) => tracing::warn!("Chat relay stream ended, resubscribing"),
                    Err(e) => tracing::warn!(error = %e, "Chat relay failed, resubscribing"),
                }
                tokio::time::sleep(RELAY_RETRY_DELAY).await;
            }
        });
    }
}

async fn relay(client: &Client, registry: &ConnectionRegistry) -> Result<()> {
    // Subscriptions need a dedicated connection
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to open Redis pub/sub connection")?;
    pubsub
        .psubscribe(format!("{}*", CHANNEL_PREFIX))
        .await
        .context("Failed to subscribe to chat channels")?;
    tracing::info!("Chat relay subscribed");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let Some(conversation_id) = conversation_from_channel(message.get_channel_name()) else {
            continue;
        };
        match message.get_payload::<String>() {
            Ok(frame) => {
                registry.deliver(conversation_id, &frame);
            }
            Err(e) => tracing::warn!(conversation_id, error = %e, "Dropping unreadable chat frame"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let channel = channel_for("6f1c2d9e-0000-4000-8000-000000000001");
        assert_eq!(channel, "akimori:chat:6f1c2d9e-0000-4000-8000-000000000001");
        assert_eq!(
            conversation_from_channel(&channel),
            Some("6f1c2d9e-0000-4000-8000-000000000001")
        );
        assert_eq!(conversation_from_channel("akimori:chat:"), None);
        assert_eq!(conversation_from_channel("items:1"), None);
    }

    #[tokio::test]
    async fn test_relay_delivers_to_local_sockets() {
        // The relay's last hop: a frame read off a chat channel
        let registry = ConnectionRegistry::new();
        let mut socket = registry.subscribe("c1");
        let channel = channel_for("c1");
        let conversation_id = conversation_from_channel(&channel).unwrap();
        assert_eq!(registry.deliver(conversation_id, r#"{"type":"typing"}"#), 1);
        assert_eq!(socket.recv().await.as_deref(), Some(r#"{"type":"typing"}"#));
    }
}
