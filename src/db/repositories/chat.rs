//! Conversation and message repository

use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{Conversation, Message, MessageView, UserShort};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    /// Conversations the user takes part in, most recently active first
    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Conversation>>;

    /// Participants in join order
    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserShort>>;

    async fn is_participant(&self, conversation_id: &str, user_id: i64) -> Result<bool>;

    async fn last_message(&self, conversation_id: &str) -> Result<Option<MessageView>>;

    /// One page of history, oldest first, with the total message count
    async fn messages_page(
        &self,
        conversation_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<MessageView>, i64)>;
}

/// Chat writes inside a transaction
#[async_trait]
pub trait ChatTxOps: Send {
    async fn conversation_create(&mut self, conversation: &Conversation) -> Result<()>;

    async fn participant_add(
        &mut self,
        conversation_id: &str,
        user_id: i64,
        is_admin: bool,
        joined_at: DateTime<Utc>,
    ) -> Result<()>;

    /// A conversation with exactly the two given participants
    async fn find_direct_conversation(&mut self, a: i64, b: i64) -> Result<Option<Conversation>>;

    async fn message_insert(
        &mut self,
        conversation_id: &str,
        sender_id: i64,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message>;

    /// Bump `updated_at`
    async fn conversation_touch(&mut self, conversation_id: &str, at: DateTime<Utc>)
        -> Result<()>;
}

pub struct SqlxChatRepository {
    pool: DynDatabasePool,
}

impl SqlxChatRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ChatRepository> {
        Arc::new(Self::new(pool))
    }
}

const GET_SQL: &str = "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?";

const LIST_FOR_USER_SQL: &str = r#"
    SELECT c.id, c.title, c.created_at, c.updated_at
    FROM conversations c
    JOIN conversation_participants p ON p.conversation_id = c.id
    WHERE p.user_id = ?
    ORDER BY c.updated_at DESC, c.id
"#;

const PARTICIPANTS_SQL: &str = r#"
    SELECT u.id, u.username
    FROM conversation_participants p
    JOIN users u ON u.id = p.user_id
    WHERE p.conversation_id = ?
    ORDER BY p.joined_at, p.id
"#;

const IS_PARTICIPANT_SQL: &str = r#"
    SELECT COUNT(*) as count FROM conversation_participants
    WHERE conversation_id = ? AND user_id = ?
"#;

const MESSAGE_VIEW_SELECT: &str = r#"
    SELECT m.id, m.text, m.created_at, m.edited_at, u.id AS sender_id, u.username AS sender_username
    FROM messages m
    JOIN users u ON u.id = m.sender_id
    WHERE m.conversation_id = ?
"#;

const COUNT_MESSAGES_SQL: &str =
    "SELECT COUNT(*) as count FROM messages WHERE conversation_id = ?";

const DIRECT_SQL: &str = r#"
    SELECT c.id, c.title, c.created_at, c.updated_at
    FROM conversations c
    JOIN conversation_participants p1 ON p1.conversation_id = c.id AND p1.user_id = ?
    JOIN conversation_participants p2 ON p2.conversation_id = c.id AND p2.user_id = ?
    WHERE (SELECT COUNT(*) FROM conversation_participants p WHERE p.conversation_id = c.id) = 2
    ORDER BY c.updated_at DESC
    LIMIT 1
"#;

const INSERT_CONVERSATION_SQL: &str =
    "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)";

const INSERT_PARTICIPANT_SQL: &str = r#"
    INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
    VALUES (?, ?, ?, ?)
"#;

const INSERT_MESSAGE_SQL: &str =
    "INSERT INTO messages (conversation_id, sender_id, text, created_at) VALUES (?, ?, ?, ?)";

const TOUCH_SQL: &str = "UPDATE conversations SET updated_at = ? WHERE id = ?";

#[async_trait]
impl ChatRepository for SqlxChatRepository {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => Ok(sqlx::query(GET_SQL)
                .bind(conversation_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get conversation")?
                .as_ref()
                .map(row_to_conversation_sqlite)),
            DbBackend::Mysql(pool) => Ok(sqlx::query(GET_SQL)
                .bind(conversation_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get conversation")?
                .as_ref()
                .map(row_to_conversation_mysql)),
        }
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Conversation>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let rows = sqlx::query(LIST_FOR_USER_SQL)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list conversations")?;
                Ok(rows.iter().map(row_to_conversation_sqlite).collect())
            }
            DbBackend::Mysql(pool) => {
                let rows = sqlx::query(LIST_FOR_USER_SQL)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list conversations")?;
                Ok(rows.iter().map(row_to_conversation_mysql).collect())
            }
        }
    }

    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserShort>> {
        let users = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(PARTICIPANTS_SQL)
                .bind(conversation_id)
                .fetch_all(pool)
                .await
                .context("Failed to list participants")?
                .iter()
                .map(|row| UserShort {
                    id: row.get("id"),
                    username: row.get("username"),
                })
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(PARTICIPANTS_SQL)
                .bind(conversation_id)
                .fetch_all(pool)
                .await
                .context("Failed to list participants")?
                .iter()
                .map(|row| UserShort {
                    id: row.get("id"),
                    username: row.get("username"),
                })
                .collect(),
        };
        Ok(users)
    }

    async fn is_participant(&self, conversation_id: &str, user_id: i64) -> Result<bool> {
        let count: i64 = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(IS_PARTICIPANT_SQL)
                .bind(conversation_id)
                .bind(user_id)
                .fetch_one(pool)
                .await
                .context("Failed to check participant")?
                .get("count"),
            DbBackend::Mysql(pool) => sqlx::query(IS_PARTICIPANT_SQL)
                .bind(conversation_id)
                .bind(user_id)
                .fetch_one(pool)
                .await
                .context("Failed to check participant")?
                .get("count"),
        };
        Ok(count > 0)
    }

    async fn last_message(&self, conversation_id: &str) -> Result<Option<MessageView>> {
        let sql = format!(
            "{} ORDER BY m.created_at DESC, m.id DESC LIMIT 1",
            MESSAGE_VIEW_SELECT.trim_end()
        );
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => Ok(sqlx::query(&sql)
                .bind(conversation_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get last message")?
                .as_ref()
                .map(row_to_message_view_sqlite)),
            DbBackend::Mysql(pool) => Ok(sqlx::query(&sql)
                .bind(conversation_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get last message")?
                .as_ref()
                .map(row_to_message_view_mysql)),
        }
    }

    async fn messages_page(
        &self,
        conversation_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<MessageView>, i64)> {
        let offset = (page.max(1) - 1) * page_size;
        let sql = format!(
            "{} ORDER BY m.created_at, m.id LIMIT ? OFFSET ?",
            MESSAGE_VIEW_SELECT.trim_end()
        );

        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let count: i64 = sqlx::query(COUNT_MESSAGES_SQL)
                    .bind(conversation_id)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count messages")?
                    .get("count");
                let rows = sqlx::query(&sql)
                    .bind(conversation_id)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list messages")?;
                Ok((rows.iter().map(row_to_message_view_sqlite).collect(), count))
            }
            DbBackend::Mysql(pool) => {
                let count: i64 = sqlx::query(COUNT_MESSAGES_SQL)
                    .bind(conversation_id)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count messages")?
                    .get("count");
                let rows = sqlx::query(&sql)
                    .bind(conversation_id)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list messages")?;
                Ok((rows.iter().map(row_to_message_view_mysql).collect(), count))
            }
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

#[async_trait]
impl ChatTxOps for SqliteTx {
    async fn conversation_create(&mut self, conversation: &Conversation) -> Result<()> {
        sqlx::query(INSERT_CONVERSATION_SQL)
            .bind(&conversation.id)
            .bind(&conversation.title)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(self.conn()?)
            .await
            .context("Failed to create conversation")?;
        Ok(())
    }

    async fn participant_add(
        &mut self,
        conversation_id: &str,
        user_id: i64,
        is_admin: bool,
        joined_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(INSERT_PARTICIPANT_SQL)
            .bind(conversation_id)
            .bind(user_id)
            .bind(is_admin)
            .bind(joined_at)
            .execute(self.conn()?)
            .await
            .context("Failed to add participant")?;
        Ok(())
    }

    async fn find_direct_conversation(&mut self, a: i64, b: i64) -> Result<Option<Conversation>> {
        Ok(sqlx::query(DIRECT_SQL)
            .bind(a)
            .bind(b)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to find direct conversation")?
            .as_ref()
            .map(row_to_conversation_sqlite))
    }

    async fn message_insert(
        &mut self,
        conversation_id: &str,
        sender_id: i64,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let id = sqlx::query(INSERT_MESSAGE_SQL)
            .bind(conversation_id)
            .bind(sender_id)
            .bind(text)
            .bind(created_at)
            .execute(self.conn()?)
            .await
            .context("Failed to save message")?
            .last_insert_rowid();
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id,
            text: text.to_string(),
            created_at,
            edited_at: None,
        })
    }

    async fn conversation_touch(
        &mut self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(TOUCH_SQL)
            .bind(at)
            .bind(conversation_id)
            .execute(self.conn()?)
            .await
            .context("Failed to touch conversation")?;
        Ok(())
    }
}

fn row_to_conversation_sqlite(row: &sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_message_view_sqlite(row: &sqlx::sqlite::SqliteRow) -> MessageView {
    MessageView {
        id: row.get("id"),
        text: row.get("text"),
        created_at: row.get("created_at"),
        edited_at: row.get("edited_at"),
        sender: UserShort {
            id: row.get("sender_id"),
            username: row.get("sender_username"),
        },
    }
}

// ============================================================================
// MySQL implementations
// ============================================================================

#[async_trait]
impl ChatTxOps for MysqlTx {
    async fn conversation_create(&mut self, conversation: &Conversation) -> Result<()> {
        sqlx::query(INSERT_CONVERSATION_SQL)
            .bind(&conversation.id)
            .bind(&conversation.title)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(self.conn()?)
            .await
            .context("Failed to create conversation")?;
        Ok(())
    }

    async fn participant_add(
        &mut self,
        conversation_id: &str,
        user_id: i64,
        is_admin: bool,
        joined_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(INSERT_PARTICIPANT_SQL)
            .bind(conversation_id)
            .bind(user_id)
            .bind(is_admin)
            .bind(joined_at)
            .execute(self.conn()?)
            .await
            .context("Failed to add participant")?;
        Ok(())
    }

    async fn find_direct_conversation(&mut self, a: i64, b: i64) -> Result<Option<Conversation>> {
        let sql = format!("{} FOR UPDATE", DIRECT_SQL.trim_end());
        Ok(sqlx::query(&sql)
            .bind(a)
            .bind(b)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to find direct conversation")?
            .as_ref()
            .map(row_to_conversation_mysql))
    }

    async fn message_insert(
        &mut self,
        conversation_id: &str,
        sender_id: i64,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let id = sqlx::query(INSERT_MESSAGE_SQL)
            .bind(conversation_id)
            .bind(sender_id)
            .bind(text)
            .bind(created_at)
            .execute(self.conn()?)
            .await
            .context("Failed to save message")?
            .last_insert_id() as i64;
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id,
            text: text.to_string(),
            created_at,
            edited_at: None,
        })
    }

    async fn conversation_touch(
        &mut self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(TOUCH_SQL)
            .bind(at)
            .bind(conversation_id)
            .execute(self.conn()?)
            .await
            .context("Failed to touch conversation")?;
        Ok(())
    }
}

fn row_to_conversation_mysql(row: &sqlx::mysql::MySqlRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_message_view_mysql(row: &sqlx::mysql::MySqlRow) -> MessageView {
    MessageView {
        id: row.get("id"),
        text: row.get("text"),
        created_at: row.get("created_at"),
        edited_at: row.get("edited_at"),
        sender: UserShort {
            id: row.get("sender_id"),
            username: row.get("sender_username"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_pool};
    use chrono::Duration;

    async fn open_direct(pool: &DynDatabasePool, a: i64, b: i64) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            created_at: now,
            updated_at: now,
        };
        let mut tx = pool.begin().await.unwrap();
        tx.conversation_create(&conversation).await.unwrap();
        tx.participant_add(&conversation.id, a, true, now).await.unwrap();
        tx.participant_add(&conversation.id, b, false, now).await.unwrap();
        tx.commit().await.unwrap();
        conversation
    }

    #[tokio::test]
    async fn test_direct_conversation_lookup() {
        let pool = migrated_pool().await;
        let alice = insert_user(&pool, "alice").await;
        let bob = insert_user(&pool, "bob").await;
        let carol = insert_user(&pool, "carol").await;
        let conversation = open_direct(&pool, alice, bob).await;

        let mut tx = pool.begin().await.unwrap();
        let found = tx.find_direct_conversation(bob, alice).await.unwrap().unwrap();
        assert_eq!(found.id, conversation.id);
        assert!(tx.find_direct_conversation(alice, carol).await.unwrap().is_none());

        // A third member turns it into a group chat
        tx.participant_add(&conversation.id, carol, false, Utc::now())
            .await
            .unwrap();
        assert!(tx.find_direct_conversation(alice, bob).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_participants_and_membership() {
        let pool = migrated_pool().await;
        let alice = insert_user(&pool, "alice").await;
        let bob = insert_user(&pool, "bob").await;
        let carol = insert_user(&pool, "carol").await;
        let conversation = open_direct(&pool, alice, bob).await;
        let repo = SqlxChatRepository::new(pool.clone());

        let users = repo.participants(&conversation.id).await.unwrap();
        let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(repo.is_participant(&conversation.id, bob).await.unwrap());
        assert!(!repo.is_participant(&conversation.id, carol).await.unwrap());
        assert!(repo.list_for_user(carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_messages_page_oldest_first() {
        let pool = migrated_pool().await;
        let alice = insert_user(&pool, "alice").await;
        let bob = insert_user(&pool, "bob").await;
        let conversation = open_direct(&pool, alice, bob).await;
        let repo = SqlxChatRepository::new(pool.clone());

        let start = Utc::now();
        let mut tx = pool.begin().await.unwrap();
        for i in 0..5 {
            let at = start + Duration::seconds(i);
            tx.message_insert(&conversation.id, alice, &format!("m{}", i), at)
                .await
                .unwrap();
            tx.conversation_touch(&conversation.id, at).await.unwrap();
        }
        tx.commit().await.unwrap();

        let (first, count) = repo.messages_page(&conversation.id, 1, 2).await.unwrap();
        assert_eq!(count, 5);
        let texts: Vec<_> = first.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m0", "m1"]);
        assert_eq!(first[0].sender.username, "alice");

        let (beyond, _) = repo.messages_page(&conversation.id, 9, 2).await.unwrap();
        assert!(beyond.is_empty());

        let last = repo.last_message(&conversation.id).await.unwrap().unwrap();
        assert_eq!(last.text, "m4");

        let reloaded = repo.get(&conversation.id).await.unwrap().unwrap();
        assert_eq!(reloaded.updated_at, start + Duration::seconds(4));
    }

    #[tokio::test]
    async fn test_list_orders_by_activity() {
        let pool = migrated_pool().await;
        let alice = insert_user(&pool, "alice").await;
        let bob = insert_user(&pool, "bob").await;
        let carol = insert_user(&pool, "carol").await;
        let older = open_direct(&pool, alice, bob).await;
        let newer = open_direct(&pool, alice, carol).await;

        let mut tx = pool.begin().await.unwrap();
        tx.conversation_touch(&older.id, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let repo = SqlxChatRepository::new(pool.clone());
        let ids: Vec<_> = repo
            .list_for_user(alice)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }
}
