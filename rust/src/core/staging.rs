// Seams between the reconciler and the stores it reads from and writes to.

use std::future::Future;
use std::sync::Arc;

use converse_staging::{SharedStore, StagedBatch, StagedConversation, StagedMessage};

use super::error::StoreError;
use super::message_db::{ConversationRecord, MessageRecord};

/// Read/clear side of the shared notification staging area.
pub trait StagingSource: Send + Sync {
    fn load_conversations(
        &self,
    ) -> impl Future<Output = Result<StagedBatch<StagedConversation>, StoreError>> + Send;

    fn load_messages(
        &self,
    ) -> impl Future<Output = Result<StagedBatch<StagedMessage>, StoreError>> + Send;

    /// `None` clears everything, `Some(seq)` only rows up to `seq`.
    fn clear_conversations(
        &self,
        through: Option<i64>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn clear_messages(
        &self,
        through: Option<i64>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Durable conversation/message store. Writes are keyed upserts, so applying
/// the same records twice leaves the store as applying them once.
pub trait ConversationSink: Send + Sync {
    fn upsert_conversations(
        &self,
        account: &str,
        conversations: &[ConversationRecord],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn upsert_messages(
        &self,
        account: &str,
        messages: &[MessageRecord],
        topic: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Run a synchronous store call on the blocking pool, so a slow statement does
/// not stall the runtime and a pass timeout can fire while it runs.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

impl StagingSource for Arc<SharedStore> {
    async fn load_conversations(&self) -> Result<StagedBatch<StagedConversation>, StoreError> {
        let store = self.clone();
        run_blocking(move || Ok(SharedStore::load_conversations(&store)?)).await
    }

    async fn load_messages(&self) -> Result<StagedBatch<StagedMessage>, StoreError> {
        let store = self.clone();
        run_blocking(move || Ok(SharedStore::load_messages(&store)?)).await
    }

    async fn clear_conversations(&self, through: Option<i64>) -> Result<(), StoreError> {
        let store = self.clone();
        let removed =
            run_blocking(move || Ok(SharedStore::clear_conversations(&store, through)?)).await?;
        tracing::debug!(removed, "staging: cleared conversations");
        Ok(())
    }

    async fn clear_messages(&self, through: Option<i64>) -> Result<(), StoreError> {
        let store = self.clone();
        let removed =
            run_blocking(move || Ok(SharedStore::clear_messages(&store, through)?)).await?;
        tracing::debug!(removed, "staging: cleared messages");
        Ok(())
    }
}
