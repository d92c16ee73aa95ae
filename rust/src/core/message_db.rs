use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use converse_staging::{StagedConversation, StagedMessage};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::error::StoreError;
use super::staging::{run_blocking, ConversationSink};

pub const MESSAGE_DB_FILE: &str = "messages.sqlite3";

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA foreign_keys=ON;

    CREATE TABLE IF NOT EXISTS conversations (
        account TEXT NOT NULL,
        topic TEXT NOT NULL,
        peer_address TEXT,
        created_at INTEGER NOT NULL,
        read_until INTEGER NOT NULL DEFAULT 0,
        pending INTEGER NOT NULL DEFAULT 0,
        context_json TEXT,
        PRIMARY KEY (account, topic)
    );

    CREATE TABLE IF NOT EXISTS messages (
        account TEXT NOT NULL,
        topic TEXT NOT NULL,
        id TEXT NOT NULL,
        sender_address TEXT NOT NULL,
        sent INTEGER NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL,
        sent_via_converse INTEGER NOT NULL DEFAULT 0,
        content_type TEXT NOT NULL,
        PRIMARY KEY (account, topic, id)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_sent ON messages(account, topic, sent);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub topic: String,
    pub peer_address: Option<String>,
    pub created_at: i64,
    pub read_until: i64,
    pub pending: bool,
    pub context: Option<ConversationContext>,
}

impl ConversationRecord {
    /// A conversation learned from a push is never pending and starts unread.
    /// An uninformative context is dropped rather than stored empty.
    pub fn from_staged(staged: StagedConversation) -> Self {
        let context = staged
            .context
            .filter(|ctx| ctx.is_informative())
            .map(|ctx| ConversationContext {
                conversation_id: ctx.conversation_id,
                metadata: ctx.metadata,
            });
        Self {
            topic: staged.topic,
            peer_address: staged.peer_address.filter(|a| !a.is_empty()),
            created_at: staged.created_at,
            read_until: 0,
            pending: false,
            context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Seen,
    Error,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Seen => "seen",
            MessageStatus::Error => "error",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "seen" => Ok(MessageStatus::Seen),
            "error" => Ok(MessageStatus::Error),
            other => Err(format!("unknown message status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub sender_address: String,
    pub sent: i64,
    pub content: String,
    pub status: MessageStatus,
    pub sent_via_converse: bool,
    pub content_type: String,
}

impl MessageRecord {
    pub fn from_staged(staged: &StagedMessage) -> Self {
        Self {
            id: staged.id.clone(),
            sender_address: staged.sender_address.clone(),
            sent: staged.sent,
            content: staged.content.clone(),
            status: MessageStatus::Sent,
            sent_via_converse: staged.sent_via_converse.unwrap_or(false),
            content_type: staged.content_type_or_default().to_string(),
        }
    }
}

/// The app's durable conversation/message database.
#[derive(Debug)]
pub struct MessageDb {
    conn: Mutex<Connection>,
}

impl MessageDb {
    pub fn open(data_dir: &str) -> rusqlite::Result<Self> {
        let path = Path::new(data_dir).join(MESSAGE_DB_FILE);
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn save_conversations(
        &self,
        account: &str,
        conversations: &[ConversationRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for c in conversations {
            let context_json = c.context.as_ref().map(serde_json::to_string).transpose()?;
            // An existing row keeps what the incoming record does not know about.
            tx.execute(
                r#"
                INSERT INTO conversations (
                    account,
                    topic,
                    peer_address,
                    created_at,
                    read_until,
                    pending,
                    context_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(account, topic) DO UPDATE SET
                    peer_address = COALESCE(excluded.peer_address, conversations.peer_address),
                    created_at = excluded.created_at,
                    pending = excluded.pending,
                    context_json = COALESCE(excluded.context_json, conversations.context_json)
                "#,
                params![
                    account,
                    c.topic,
                    c.peer_address,
                    c.created_at,
                    c.read_until,
                    c.pending,
                    context_json,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn save_messages(
        &self,
        account: &str,
        messages: &[MessageRecord],
        topic: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for m in messages {
            tx.execute(
                r#"
                INSERT INTO messages (
                    account,
                    topic,
                    id,
                    sender_address,
                    sent,
                    content,
                    status,
                    sent_via_converse,
                    content_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(account, topic, id) DO UPDATE SET
                    sender_address = excluded.sender_address,
                    sent = excluded.sent,
                    content = excluded.content,
                    status = excluded.status,
                    sent_via_converse = excluded.sent_via_converse,
                    content_type = excluded.content_type
                "#,
                params![
                    account,
                    topic,
                    m.id,
                    m.sender_address,
                    m.sent,
                    m.content,
                    m.status.as_str(),
                    m.sent_via_converse,
                    m.content_type,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn conversation(
        &self,
        account: &str,
        topic: &str,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT topic, peer_address, created_at, read_until, pending, context_json
                FROM conversations
                WHERE account = ?1 AND topic = ?2
                "#,
                params![account, topic],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((topic, peer_address, created_at, read_until, pending, context_json)) = row else {
            return Ok(None);
        };
        let context = context_json
            .as_deref()
            .map(serde_json::from_str::<ConversationContext>)
            .transpose()?;
        Ok(Some(ConversationRecord {
            topic,
            peer_address,
            created_at,
            read_until,
            pending,
            context,
        }))
    }

    pub fn conversation_topics(&self, account: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT topic FROM conversations WHERE account = ?1 ORDER BY topic")?;
        let topics = stmt
            .query_map(params![account], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(topics)
    }

    /// Messages of one conversation, oldest first.
    pub fn messages(&self, account: &str, topic: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, sender_address, sent, content, status, sent_via_converse, content_type
            FROM messages
            WHERE account = ?1 AND topic = ?2
            ORDER BY sent ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![account, topic], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, sender_address, sent, content, status, sent_via_converse, content_type) =
                row?;
            let status = status.parse().unwrap_or_else(|e: String| {
                tracing::warn!(%e, id = %id, "message db: unreadable status, assuming sent");
                MessageStatus::Sent
            });
            out.push(MessageRecord {
                id,
                sender_address,
                sent,
                content,
                status,
                sent_via_converse,
                content_type,
            });
        }
        Ok(out)
    }
}

impl ConversationSink for Arc<MessageDb> {
    async fn upsert_conversations(
        &self,
        account: &str,
        conversations: &[ConversationRecord],
    ) -> Result<(), StoreError> {
        let db = self.clone();
        let account = account.to_string();
        let conversations = conversations.to_vec();
        run_blocking(move || db.save_conversations(&account, &conversations)).await
    }

    async fn upsert_messages(
        &self,
        account: &str,
        messages: &[MessageRecord],
        topic: &str,
    ) -> Result<(), StoreError> {
        let db = self.clone();
        let account = account.to_string();
        let messages = messages.to_vec();
        let topic = topic.to_string();
        run_blocking(move || db.save_messages(&account, &messages, &topic)).await
    }
}
