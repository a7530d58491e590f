use crate::{
    bus::{Event, EventBus},
    chat::{Conversation, ConversationId, Message, MessageId, NewMessage},
    entity::{pair_key, ParticipantId},
    error::ChatError,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, sync::Arc};
use tracing::{debug, info};

use super::{spawn_bus_feed, ChatStore, OnUpdate, Subscription};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    bus: Arc<EventBus>,
}

impl SqliteStore {
    /// Create a new SqliteStore instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>, bus: Arc<EventBus>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool, bus })
    }

    /// A private in-memory database. Every pooled connection would get its
    /// own database, and the database is gone once its connection closes, so
    /// the pool holds exactly one connection for its whole lifetime.
    pub async fn in_memory(bus: Arc<EventBus>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = in_memory_pool_options()
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Ok(Self { pool, bus })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                pair_key TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a);
            CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
                ON messages(conversation_id, timestamp, seq);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        info!("Chat schema ready");
        Ok(())
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch conversation")?;

        row.as_ref().map(conversation_from_row).transpose()
    }
}

fn in_memory_pool_options() -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn conversations_with(&self, participant: &ParticipantId) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at
            FROM conversations
            WHERE participant_a = ?1 OR participant_b = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(participant.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query conversations by participant")?;

        rows.iter().map(conversation_from_row).collect()
    }

    async fn create_conversation(&self, participants: [ParticipantId; 2]) -> Result<Conversation> {
        let key = pair_key(&participants[0], &participants[1]);
        let conversation = Conversation::new(participants);

        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (id, participant_a, participant_b, pair_key, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(pair_key) DO NOTHING
            "#,
        )
        .bind(conversation.id.as_str())
        .bind(conversation.participants[0].as_str())
        .bind(conversation.participants[1].as_str())
        .bind(&key)
        .bind(conversation.created_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .context("Failed to create conversation")?;

        if inserted.rows_affected() == 1 {
            info!(
                "Created conversation {} for {} and {}",
                conversation.id, conversation.participants[0], conversation.participants[1]
            );
            return Ok(Conversation {
                created_at: from_micros(conversation.created_at.timestamp_micros())?,
                ..conversation
            });
        }

        // Someone else created the pair first; hand back theirs.
        let row = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at
            FROM conversations
            WHERE pair_key = ?
            "#,
        )
        .bind(&key)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch existing conversation for pair")?;

        let existing = conversation_from_row(&row)?;
        debug!("Conversation for pair already exists: {}", existing.id);
        Ok(existing)
    }

    async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message> {
        if message.text.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }

        let id = MessageId::generate();
        let now = Utc::now().timestamp_micros();

        // One statement so the timestamp floor and the existence check see
        // the same state as the insert.
        let timestamp: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, text, timestamp)
            SELECT ?1, ?2, ?3, ?4, MAX(?5, COALESCE(
                (SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?2), 0))
            WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?2)
            RETURNING timestamp
            "#,
        )
        .bind(id.as_str())
        .bind(conversation_id.as_str())
        .bind(message.sender_id.as_str())
        .bind(&message.text)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to save message")?;

        let timestamp =
            timestamp.ok_or_else(|| ChatError::ConversationNotFound(conversation_id.clone()))?;

        let saved = Message {
            id,
            conversation_id: conversation_id.clone(),
            sender_id: message.sender_id,
            text: message.text,
            timestamp: from_micros(timestamp)?,
        };

        debug!("Appended message {} to {}", saved.id, saved.conversation_id);
        self.bus.publish(Event::MessageAppended(saved.clone()));
        Ok(saved)
    }

    /// Returns messages ordered by timestamp ascending (oldest to newest).
    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, text, timestamp
            FROM messages
            WHERE conversation_id = ?
            ORDER BY timestamp ASC, seq ASC
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: i64 = row.try_get("timestamp")?;
            messages.push(Message {
                id: MessageId::new(row.try_get::<String, _>("id")?),
                conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
                sender_id: ParticipantId::new(row.try_get::<String, _>("sender_id")?),
                text: row.try_get("text")?,
                timestamp: from_micros(timestamp)?,
            });
        }

        Ok(messages)
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_update: OnUpdate,
    ) -> Result<Subscription> {
        if self.conversation(conversation_id).await?.is_none() {
            return Err(ChatError::ConversationNotFound(conversation_id.clone()).into());
        }

        let events = self.bus.subscribe();
        let initial = self.messages(conversation_id).await?;

        let store = self.clone();
        let id = conversation_id.clone();
        let fetch = move || {
            let store = store.clone();
            let id = id.clone();
            async move { store.messages(&id).await }
        };

        Ok(spawn_bus_feed(
            conversation_id.clone(),
            events,
            initial,
            fetch,
            on_update,
        ))
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let created_at: i64 = row.try_get("created_at")?;
    Ok(Conversation {
        id: ConversationId::new(row.try_get::<String, _>("id")?),
        participants: [
            ParticipantId::new(row.try_get::<String, _>("participant_a")?),
            ParticipantId::new(row.try_get::<String, _>("participant_b")?),
        ],
        created_at: from_micros(created_at)?,
    })
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .with_context(|| format!("Stored timestamp {} is out of range", micros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::NewMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn test_store() -> SqliteStore {
        let store = SqliteStore::in_memory(Arc::new(EventBus::new()))
            .await
            .unwrap();
        store.init().await.unwrap();
        store
    }

    fn pair(a: &str, b: &str) -> [ParticipantId; 2] {
        [ParticipantId::new(a), ParticipantId::new(b)]
    }

    #[test]
    fn in_memory_pool_never_recycles_its_connection() {
        let options = in_memory_pool_options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);
    }

    #[tokio::test]
    async fn in_memory_schema_outlives_idle_periods() {
        let store = test_store().await;
        store.create_conversation(pair("alice", "bob")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.pool.size(), 1);
        let bobs = store
            .conversations_with(&ParticipantId::new("bob"))
            .await
            .unwrap();
        assert_eq!(bobs.len(), 1);
    }

    #[tokio::test]
    async fn create_is_unique_per_unordered_pair() {
        let store = test_store().await;
        let first = store.create_conversation(pair("alice", "bob")).await.unwrap();
        let second = store.create_conversation(pair("bob", "alice")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.participants, pair("alice", "bob"));

        let bobs = store
            .conversations_with(&ParticipantId::new("bob"))
            .await
            .unwrap();
        assert_eq!(bobs.len(), 1);
    }

    #[tokio::test]
    async fn conversations_with_matches_either_column() {
        let store = test_store().await;
        store.create_conversation(pair("alice", "bob")).await.unwrap();
        store.create_conversation(pair("carol", "alice")).await.unwrap();
        store.create_conversation(pair("bob", "carol")).await.unwrap();

        let alices = store
            .conversations_with(&ParticipantId::new("alice"))
            .await
            .unwrap();
        assert_eq!(alices.len(), 2);
        assert!(alices.iter().all(|c| c.includes(&ParticipantId::new("alice"))));
    }

    #[tokio::test]
    async fn messages_come_back_in_append_order() {
        let store = test_store().await;
        let conv = store.create_conversation(pair("alice", "bob")).await.unwrap();

        for n in 0..5 {
            let sender = if n % 2 == 0 { "alice" } else { "bob" };
            store
                .append_message(
                    &conv.id,
                    NewMessage::new(ParticipantId::new(sender), format!("msg {n}")),
                )
                .await
                .unwrap();
        }

        let history = store.messages(&conv.id).await.unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_is_not_found() {
        let store = test_store().await;
        let err = store
            .append_message(
                &ConversationId::new("missing"),
                NewMessage::new(ParticipantId::new("alice"), "hello"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn append_rejects_empty_text() {
        let store = test_store().await;
        let conv = store.create_conversation(pair("alice", "bob")).await.unwrap();
        let err = store
            .append_message(&conv.id, NewMessage::new(ParticipantId::new("alice"), ""))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn subscription_streams_full_ordered_lists() {
        let store = test_store().await;
        let conv = store.create_conversation(pair("alice", "bob")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = store
            .subscribe(
                &conv.id,
                Box::new(move |list| {
                    let _ = tx.send(list);
                }),
            )
            .await
            .unwrap();

        let initial = rx.recv().await.unwrap();
        assert!(initial.is_empty());

        store
            .append_message(&conv.id, NewMessage::new(ParticipantId::new("alice"), "hello"))
            .await
            .unwrap();
        let after_one = rx.recv().await.unwrap();
        assert_eq!(after_one.len(), 1);
        assert_eq!(after_one[0].text, "hello");

        subscription.unsubscribe();
        store
            .append_message(&conv.id, NewMessage::new(ParticipantId::new("bob"), "hi"))
            .await
            .unwrap();

        let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))));
    }

    #[tokio::test]
    async fn subscribe_to_unknown_conversation_fails() {
        let store = test_store().await;
        let result = store
            .subscribe(&ConversationId::new("missing"), Box::new(|_| {}))
            .await;
        assert!(result.is_err());
    }
}
