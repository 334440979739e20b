//! Chat service
//!
//! Direct conversations, message history and live fan-out. Messages posted
//! over REST or WebSocket take the same path: saved, the conversation bumped,
//! then published on the [`ChatBus`]. The bus hands frames to the sockets
//! registered in this process, either directly or through a Redis channel
//! that every instance relays from.

use crate::config::ChatConfig;
use crate::db::repositories::{ChatRepository, UserRepository};
use crate::db::DynDatabasePool;
use crate::models::{
    clamp_page, page_count, Conversation, ConversationDetail, ConversationSummary, MessagePage,
    MessageView, ServerEvent, UserShort,
};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[cfg(feature = "redis-cache")]
use crate::services::chat_relay::RedisChatBus;

pub const DEFAULT_PAGE_SIZE: i64 = 30;
pub const DEFAULT_SEARCH_LIMIT: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Conversation not found")]
    NotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("Not a participant of this conversation")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

type Subscribers = HashMap<String, Vec<(u64, UnboundedSender<String>)>>;

/// Sockets of this process per conversation. Each socket gets its own
/// unbounded channel of serialized [`ServerEvent`] frames.
#[derive(Debug, Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a socket. It stays registered until the subscription drops.
    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let (sender, receiver) = unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(conversation_id.to_string())
            .or_default()
            .push((id, sender));
        Subscription {
            id,
            conversation_id: conversation_id.to_string(),
            receiver,
            registry: self.clone(),
        }
    }

    fn unsubscribe(&self, conversation_id: &str, id: u64) {
        let mut guard = self.lock();
        if let Some(list) = guard.get_mut(conversation_id) {
            list.retain(|(subscriber, _)| *subscriber != id);
            if list.is_empty() {
                guard.remove(conversation_id);
            }
        }
    }

    /// Hand a frame to every local subscriber, dropping closed ones. Returns
    /// how many received it.
    pub fn deliver(&self, conversation_id: &str, frame: &str) -> usize {
        let mut guard = self.lock();
        let Some(list) = guard.get_mut(conversation_id) else {
            return 0;
        };
        list.retain(|(_, sender)| sender.send(frame.to_string()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            guard.remove(conversation_id);
        }
        delivered
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.lock().get(conversation_id).map_or(0, Vec::len)
    }
}

/// One socket's feed of frames
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    conversation_id: String,
    receiver: UnboundedReceiver<String>,
    registry: ConnectionRegistry,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<String, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.conversation_id, self.id);
    }
}

/// How chat events reach the sockets
#[derive(Debug, Clone, Default)]
pub enum ChatBus {
    /// Straight into this process's registry
    #[default]
    Local,
    /// Published on Redis; every instance relays into its own registry
    #[cfg(feature = "redis-cache")]
    Redis(RedisChatBus),
}

/// Pick the bus from configuration. A Redis URL needs the `redis-cache`
/// feature.
pub async fn create_chat_bus(config: &ChatConfig) -> Result<ChatBus> {
    let Some(redis_url) = config.redis_url.as_deref().filter(|url| !url.is_empty()) else {
        return Ok(ChatBus::Local);
    };

    #[cfg(feature = "redis-cache")]
    {
        Ok(ChatBus::Redis(RedisChatBus::connect(redis_url).await?))
    }

    #[cfg(not(feature = "redis-cache"))]
    {
        anyhow::bail!(
            "chat.redis_url is set ({}) but the 'redis-cache' feature is not enabled. \
             Enable it with `--features redis-cache` or remove the setting.",
            redis_url
        )
    }
}

pub struct ChatService {
    pool: DynDatabasePool,
    chat_repo: Arc<dyn ChatRepository>,
    user_repo: Arc<dyn UserRepository>,
    registry: ConnectionRegistry,
    bus: ChatBus,
    page_size: i64,
    search_limit: i64,
}

impl ChatService {
    pub fn new(
        pool: DynDatabasePool,
        chat_repo: Arc<dyn ChatRepository>,
        user_repo: Arc<dyn UserRepository>,
        registry: ConnectionRegistry,
    ) -> Self {
        Self {
            pool,
            chat_repo,
            user_repo,
            registry,
            bus: ChatBus::Local,
            page_size: DEFAULT_PAGE_SIZE,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_limits(mut self, page_size: i64, search_limit: i64) -> Self {
        self.page_size = page_size.max(1);
        self.search_limit = search_limit.max(1);
        self
    }

    pub fn with_bus(mut self, bus: ChatBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Start relaying Redis frames into the local registry. Nothing to do
    /// for the local bus.
    pub fn start_relay(&self) {
        match &self.bus {
            ChatBus::Local => {}
            #[cfg(feature = "redis-cache")]
            ChatBus::Redis(bus) => bus.spawn_relay(self.registry.clone()),
        }
    }

    async fn publish(&self, conversation_id: &str, event: &ServerEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "Failed to serialize chat event");
                return;
            }
        };
        match &self.bus {
            ChatBus::Local => {
                self.registry.deliver(conversation_id, &frame);
            }
            #[cfg(feature = "redis-cache")]
            ChatBus::Redis(bus) => {
                if let Err(e) = bus.publish(conversation_id, &frame).await {
                    tracing::warn!(conversation_id, error = %e, "Redis publish failed, delivering locally");
                    self.registry.deliver(conversation_id, &frame);
                }
            }
        }
    }

    /// The user's conversations, most recently active first
    pub async fn list_conversations(
        &self,
        user_id: i64,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self.chat_repo.list_for_user(user_id).await?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let participants = self.chat_repo.participants(&conversation.id).await?;
            let last_message = self.chat_repo.last_message(&conversation.id).await?;
            summaries.push(ConversationSummary {
                id: conversation.id,
                title: conversation.title,
                updated_at: conversation.updated_at,
                participants,
                last_message,
            });
        }
        Ok(summaries)
    }

    /// Users to start a chat with; the caller is never listed
    pub async fn search_users(&self, user_id: i64, query: &str) -> Result<Vec<UserShort>, ChatError> {
        Ok(self
            .user_repo
            .search(query.trim(), user_id, self.search_limit)
            .await?)
    }

    /// The two-person conversation between the caller and `other_id`,
    /// created if it does not exist yet
    pub async fn open_direct(
        &self,
        user_id: i64,
        other_id: i64,
    ) -> Result<ConversationDetail, ChatError> {
        if user_id == other_id {
            return Err(ChatError::Validation(
                "Cannot open a chat with yourself".to_string(),
            ));
        }
        if self.user_repo.get_by_id(other_id).await?.is_none() {
            return Err(ChatError::UserNotFound);
        }

        let mut tx = self.pool.begin().await?;
        let conversation = match tx.find_direct_conversation(user_id, other_id).await? {
            Some(existing) => existing,
            None => {
                let now = Utc::now();
                let conversation = Conversation {
                    id: uuid::Uuid::new_v4().to_string(),
                    title: String::new(),
                    created_at: now,
                    updated_at: now,
                };
                tx.conversation_create(&conversation).await?;
                tx.participant_add(&conversation.id, user_id, true, now).await?;
                tx.participant_add(&conversation.id, other_id, false, now).await?;
                tracing::info!(conversation_id = %conversation.id, user_id, other_id, "Conversation opened");
                conversation
            }
        };
        tx.commit().await?;

        let participants = self.chat_repo.participants(&conversation.id).await?;
        Ok(ConversationDetail {
            id: conversation.id,
            title: conversation.title,
            participants,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        })
    }

    /// The conversation, if `user_id` takes part in it
    pub async fn authorize(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .chat_repo
            .get(conversation_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        if !self.chat_repo.is_participant(conversation_id, user_id).await? {
            return Err(ChatError::Forbidden);
        }
        Ok(conversation)
    }

    /// History page, oldest first. A page past the end is empty.
    pub async fn messages(
        &self,
        conversation_id: &str,
        user_id: i64,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<MessagePage, ChatError> {
        self.authorize(conversation_id, user_id).await?;
        let (page, page_size) = clamp_page(page, page_size, self.page_size);
        let (results, count) = self
            .chat_repo
            .messages_page(conversation_id, page, page_size)
            .await?;
        Ok(MessagePage {
            results,
            page,
            pages: page_count(count, page_size),
            count,
        })
    }

    /// Save a message and fan it out
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender: UserShort,
        text: &str,
    ) -> Result<MessageView, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Validation("Message text is empty".to_string()));
        }
        self.authorize(conversation_id, sender.id).await?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let message = tx
            .message_insert(conversation_id, sender.id, text, now)
            .await?;
        tx.conversation_touch(conversation_id, now).await?;
        tx.commit().await?;

        let view = MessageView::new(message, sender);
        self.publish(conversation_id, &ServerEvent::Message(view.clone()))
            .await;
        Ok(view)
    }

    /// Relay a typing indicator; nothing is stored
    pub async fn typing(&self, conversation_id: &str, user_id: i64, value: bool) {
        self.publish(conversation_id, &ServerEvent::Typing { user_id, value })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_pool};
    use crate::db::repositories::{SqlxChatRepository, SqlxUserRepository};

    async fn setup() -> (DynDatabasePool, ChatService) {
        let pool = migrated_pool().await;
        let service = ChatService::new(
            pool.clone(),
            SqlxChatRepository::boxed(pool.clone()),
            SqlxUserRepository::boxed(pool.clone()),
            ConnectionRegistry::new(),
        );
        (pool, service)
    }

    fn short(id: i64, username: &str) -> UserShort {
        UserShort {
            id,
            username: username.to_string(),
        }
    }

    #[tokio::test]
    async fn test_registry_delivers_and_forgets_dropped_subscriptions() {
        let registry = ConnectionRegistry::new();
        let mut open = registry.subscribe("c1");
        let closed = registry.subscribe("c1");
        assert_eq!(registry.subscriber_count("c1"), 2);

        // Gone as soon as the socket's subscription drops, no broadcast needed
        drop(closed);
        assert_eq!(registry.subscriber_count("c1"), 1);

        assert_eq!(registry.deliver("c1", r#"{"type":"typing"}"#), 1);
        assert_eq!(open.recv().await.unwrap(), r#"{"type":"typing"}"#);

        drop(open);
        assert_eq!(registry.subscriber_count("c1"), 0);
        assert_eq!(registry.deliver("c1", "{}"), 0);
        assert_eq!(registry.deliver("other", "{}"), 0);
    }

    #[tokio::test]
    async fn test_registry_skips_receivers_closed_elsewhere() {
        let registry = ConnectionRegistry::new();
        let mut first = registry.subscribe("c1");
        let mut second = registry.subscribe("c1");
        second.receiver.close();

        assert_eq!(registry.deliver("c1", "frame"), 1);
        assert_eq!(first.recv().await.as_deref(), Some("frame"));
        assert_eq!(registry.subscriber_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_chat_bus_defaults_to_local() {
        let bus = create_chat_bus(&ChatConfig::default()).await.unwrap();
        assert!(matches!(bus, ChatBus::Local));
    }

    #[cfg(not(feature = "redis-cache"))]
    #[tokio::test]
    async fn test_chat_bus_redis_needs_feature() {
        let config = ChatConfig {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            ..ChatConfig::default()
        };
        assert!(create_chat_bus(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_open_direct_reuses_conversation() {
        let (pool, service) = setup().await;
        let alice = insert_user(&pool, "alice").await;
        let bob = insert_user(&pool, "bob").await;

        let first = service.open_direct(alice, bob).await.unwrap();
        let again = service.open_direct(bob, alice).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.participants.len(), 2);

        assert!(matches!(
            service.open_direct(alice, alice).await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            service.open_direct(alice, 999).await,
            Err(ChatError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_send_and_page_messages() {
        let (pool, service) = setup().await;
        let alice = insert_user(&pool, "alice").await;
        let bob = insert_user(&pool, "bob").await;
        let carol = insert_user(&pool, "carol").await;
        let conversation = service.open_direct(alice, bob).await.unwrap();
        let mut live = service.registry().subscribe(&conversation.id);

        let sent = service
            .send_message(&conversation.id, short(alice, "alice"), "  hello  ")
            .await
            .unwrap();
        assert_eq!(sent.text, "hello");

        let frame: serde_json::Value = serde_json::from_str(&live.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["payload"]["text"], "hello");
        assert_eq!(frame["payload"]["sender"]["username"], "alice");

        assert!(matches!(
            service
                .send_message(&conversation.id, short(alice, "alice"), "   ")
                .await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            service
                .send_message(&conversation.id, short(carol, "carol"), "hi")
                .await,
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(
            service.messages("missing", alice, None, None).await,
            Err(ChatError::NotFound)
        ));

        let page = service
            .messages(&conversation.id, bob, Some(1), None)
            .await
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.pages, 1);
        assert_eq!(page.results[0].id, sent.id);

        let listed = service.list_conversations(bob).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_message.as_ref().map(|m| m.id), Some(sent.id));
        assert!(service.list_conversations(carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_users_excludes_caller() {
        let (pool, service) = setup().await;
        let alice = insert_user(&pool, "alice").await;
        insert_user(&pool, "alina").await;
        insert_user(&pool, "bob").await;

        let found = service.search_users(alice, "ali").await.unwrap();
        let names: Vec<_> = found.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alina"]);
        assert_eq!(service.search_users(alice, "").await.unwrap().len(), 2);
    }
}
