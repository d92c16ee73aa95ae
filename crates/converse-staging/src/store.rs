use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::records::{
    ConversationDict, RejectedRecord, StagedBatch, StagedConversation, StagedMessage,
};
use crate::Result;

pub const SHARED_DB_FILE: &str = "shared_notifications.sqlite3";

// Both the app and the notification handler hold this file open.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BADGE_KEY: &str = "notifications-badge";
const SHOWN_IDS_KEY: &str = "notification-ids";

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;

    CREATE TABLE IF NOT EXISTS staged_conversations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS staged_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS shared_kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedList {
    Conversations,
    Messages,
}

impl StagedList {
    fn table(self) -> &'static str {
        match self {
            StagedList::Conversations => "staged_conversations",
            StagedList::Messages => "staged_messages",
        }
    }
}

/// Storage shared between the app process and the notification handler.
///
/// The handler appends staged records while the app may not be running; the app
/// drains them on its next foreground. Everything else in here is small
/// key/value state the handler needs to render notifications.
#[derive(Debug)]
pub struct SharedStore {
    conn: Mutex<Connection>,
}

impl SharedStore {
    pub fn open(shared_dir: impl AsRef<Path>) -> Result<Self> {
        let shared_dir = shared_dir.as_ref();
        std::fs::create_dir_all(shared_dir)?;
        let conn = Connection::open(shared_dir.join(SHARED_DB_FILE))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
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

    // ── Staging (handler side) ──────────────────────────────────────────

    pub fn stage_conversation(&self, conversation: &StagedConversation) -> Result<i64> {
        self.stage(StagedList::Conversations, conversation)
    }

    pub fn stage_message(&self, message: &StagedMessage) -> Result<i64> {
        self.stage(StagedList::Messages, message)
    }

    fn stage<T: Serialize>(&self, list: StagedList, record: &T) -> Result<i64> {
        let payload = serde_json::to_string(record)?;
        self.stage_raw_json(list, &payload)
    }

    /// Append a payload exactly as the platform delivered it. Decoding happens
    /// on load so a bad payload only costs its own row.
    pub fn stage_raw_json(&self, list: StagedList, payload: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            &format!("INSERT INTO {} (payload) VALUES (?1)", list.table()),
            params![payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ── Draining (app side) ─────────────────────────────────────────────

    pub fn load_conversations(&self) -> Result<StagedBatch<StagedConversation>> {
        self.load(StagedList::Conversations)
    }

    pub fn load_messages(&self) -> Result<StagedBatch<StagedMessage>> {
        self.load(StagedList::Messages)
    }

    fn load<T: DeserializeOwned>(&self, list: StagedList) -> Result<StagedBatch<T>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT seq, payload FROM {} ORDER BY seq",
            list.table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut batch = StagedBatch::empty();
        for row in rows {
            let (seq, payload) = row?;
            batch.high_water = batch.high_water.max(seq);
            match serde_json::from_str::<T>(&payload) {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    tracing::warn!(%e, seq, table = list.table(), "staging: undecodable row");
                    batch.rejected.push(RejectedRecord {
                        seq,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(batch)
    }

    /// Delete staged conversations up to and including `through`; `None` clears
    /// the whole list. Returns the number of rows removed.
    pub fn clear_conversations(&self, through: Option<i64>) -> Result<usize> {
        self.clear(StagedList::Conversations, through)
    }

    pub fn clear_messages(&self, through: Option<i64>) -> Result<usize> {
        self.clear(StagedList::Messages, through)
    }

    fn clear(&self, list: StagedList, through: Option<i64>) -> Result<usize> {
        let removed = self.conn().execute(
            &format!("DELETE FROM {} WHERE seq <= ?1", list.table()),
            params![through.unwrap_or(i64::MAX)],
        )?;
        Ok(removed)
    }

    pub fn staged_count(&self, list: StagedList) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM {}", list.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    // ── Shared key/value ────────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM shared_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO shared_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, raw],
        )?;
        Ok(())
    }

    pub fn save_conversation_dict(&self, topic: &str, dict: &ConversationDict) -> Result<()> {
        self.put_json(&conversation_dict_key(topic), dict)
    }

    pub fn conversation_dict(&self, topic: &str) -> Result<Option<ConversationDict>> {
        self.get_json(&conversation_dict_key(topic))
    }

    pub fn badge(&self) -> Result<u32> {
        Ok(self.get_json(BADGE_KEY)?.unwrap_or(0))
    }

    pub fn set_badge(&self, badge: u32) -> Result<()> {
        self.put_json(BADGE_KEY, &badge)
    }

    pub fn shown_notification_ids(&self) -> Result<Vec<String>> {
        Ok(self.get_json(SHOWN_IDS_KEY)?.unwrap_or_default())
    }

    pub fn set_shown_notification_ids(&self, ids: &[String]) -> Result<()> {
        self.put_json(SHOWN_IDS_KEY, ids)
    }
}

fn conversation_dict_key(topic: &str) -> String {
    format!("conversation-{topic}")
}
