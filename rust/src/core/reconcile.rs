// Drains notifications staged by the notification handler into the message db.

use std::collections::BTreeMap;
use std::time::Duration;

use converse_staging::{StagedBatch, StagedConversation, StagedMessage};

use super::error::{ReconcileError, StoreError};
use super::guard::{Admission, ReconcileGuard};
use super::message_db::{ConversationRecord, MessageRecord};
use super::staging::{ConversationSink, StagingSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// How long a caller waits behind another pass before giving up.
    pub guard_timeout: Duration,
    /// Upper bound on a single pass, including all store I/O.
    pub pass_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            guard_timeout: Duration::from_secs(30),
            pass_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub conversations: usize,
    pub messages: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call ran the pass.
    Applied(ReconcileReport),
    /// Another call was already running a pass; this one waited for it.
    AwaitedInFlight,
}

pub struct NotificationReconciler<S, D> {
    staging: S,
    db: D,
    guard: ReconcileGuard,
    config: ReconcileConfig,
}

impl<S, D> NotificationReconciler<S, D>
where
    S: StagingSource,
    D: ConversationSink,
{
    pub fn new(staging: S, db: D, config: ReconcileConfig) -> Self {
        Self {
            staging,
            db,
            guard: ReconcileGuard::new(),
            config,
        }
    }

    pub fn is_reconciling(&self) -> bool {
        self.guard.is_active()
    }

    pub fn guard(&self) -> &ReconcileGuard {
        &self.guard
    }

    /// Merge everything currently staged into the db for `account`.
    ///
    /// Staged rows are cleared right after they are read, before the merge. A
    /// crash mid-merge therefore loses that batch instead of replaying it. On
    /// failure both staged lists are cleared and the error is returned after
    /// being logged; the guard is released on every path. A store call cut off
    /// by the pass timeout still runs to completion on the blocking pool.
    pub async fn reconcile(&self, account: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let permit = match self.guard.enter_or_wait(self.config.guard_timeout).await {
            Ok(Admission::Leader(permit)) => permit,
            Ok(Admission::Waited) => {
                tracing::debug!("reconcile: joined in-flight pass");
                return Ok(ReconcileOutcome::AwaitedInFlight);
            }
            Err(e) => {
                tracing::warn!(%e, "reconcile: gave up waiting for in-flight pass");
                return Err(ReconcileError::GuardTimeout(e.0));
            }
        };

        let result =
            match tokio::time::timeout(self.config.pass_timeout, self.run_pass(account)).await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => Err(ReconcileError::Store(e)),
                Err(_) => Err(ReconcileError::PassTimeout(self.config.pass_timeout)),
            };

        let outcome = match result {
            Ok(report) => {
                tracing::info!(
                    conversations = report.conversations,
                    messages = report.messages,
                    rejected = report.rejected,
                    "reconcile: saved notifications merged"
                );
                Ok(ReconcileOutcome::Applied(report))
            }
            Err(e) => {
                tracing::warn!(%e, "reconcile: failed loading saved notifications");
                self.discard_staged().await;
                Err(e)
            }
        };
        drop(permit);
        outcome
    }

    async fn run_pass(&self, account: &str) -> Result<ReconcileReport, StoreError> {
        let (conversations, messages) = tokio::try_join!(
            self.staging.load_conversations(),
            self.staging.load_messages()
        )?;
        if conversations.is_empty() && messages.is_empty() {
            return Ok(ReconcileReport::default());
        }
        tokio::try_join!(
            self.staging
                .clear_conversations(Some(conversations.high_water)),
            self.staging.clear_messages(Some(messages.high_water))
        )?;

        let rejected = conversations.rejected.len() + messages.rejected.len();
        for r in conversations.rejected.iter().chain(messages.rejected.iter()) {
            tracing::warn!(seq = r.seq, reason = %r.reason, "reconcile: skipped staged row");
        }

        let conversation_count = self.merge_conversations(account, conversations).await?;
        let message_count = self.merge_messages(account, messages).await?;

        Ok(ReconcileReport {
            conversations: conversation_count,
            messages: message_count,
            rejected,
        })
    }

    async fn merge_conversations(
        &self,
        account: &str,
        batch: StagedBatch<StagedConversation>,
    ) -> Result<usize, StoreError> {
        if batch.records.is_empty() {
            return Ok(0);
        }
        let records: Vec<ConversationRecord> = batch
            .records
            .into_iter()
            .map(ConversationRecord::from_staged)
            .collect();
        self.db.upsert_conversations(account, &records).await?;
        Ok(records.len())
    }

    async fn merge_messages(
        &self,
        account: &str,
        batch: StagedBatch<StagedMessage>,
    ) -> Result<usize, StoreError> {
        let by_topic = order_messages_by_topic(batch.records);
        let writes = by_topic
            .iter()
            .map(|(topic, records)| self.db.upsert_messages(account, records, topic));
        futures::future::try_join_all(writes).await?;
        Ok(by_topic.values().map(Vec::len).sum())
    }

    /// Best effort after a failed pass: leaving rows behind would only replay
    /// whatever broke this pass.
    async fn discard_staged(&self) {
        let (conversations, messages) = tokio::join!(
            self.staging.clear_conversations(None),
            self.staging.clear_messages(None)
        );
        if let Err(e) = conversations {
            tracing::warn!(%e, "reconcile: could not clear staged conversations");
        }
        if let Err(e) = messages {
            tracing::warn!(%e, "reconcile: could not clear staged messages");
        }
    }
}

/// Sort by send time (stable, so equal timestamps keep staging order) and split
/// per topic. Each topic's list stays in ascending `sent` order.
pub(crate) fn order_messages_by_topic(
    mut staged: Vec<StagedMessage>,
) -> BTreeMap<String, Vec<MessageRecord>> {
    staged.sort_by_key(|m| m.sent);
    let mut by_topic: BTreeMap<String, Vec<MessageRecord>> = BTreeMap::new();
    for m in &staged {
        by_topic
            .entry(m.topic.clone())
            .or_default()
            .push(MessageRecord::from_staged(m));
    }
    by_topic
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use converse_staging::{SharedStore, StagedContext, StagedList};
    use tokio::sync::Notify;

    use crate::core::message_db::MessageDb;

    fn conversation(topic: &str) -> StagedConversation {
        StagedConversation {
            topic: topic.into(),
            peer_address: Some("0xA".into()),
            created_at: 100,
            context: None,
        }
    }

    fn message(id: &str, topic: &str, sent: i64) -> StagedMessage {
        StagedMessage {
            id: id.into(),
            topic: topic.into(),
            sender_address: "0xA".into(),
            sent,
            content: format!("content of {id}"),
            sent_via_converse: None,
            content_type: None,
        }
    }

    /// Records the order of writes and can hold the first write open.
    #[derive(Default)]
    struct RecordingSink {
        conversations: Mutex<Vec<ConversationRecord>>,
        messages: Mutex<Vec<(String, String)>>,
        conversation_calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl ConversationSink for Arc<RecordingSink> {
        async fn upsert_conversations(
            &self,
            _account: &str,
            conversations: &[ConversationRecord],
        ) -> Result<(), StoreError> {
            self.conversation_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            self.conversations
                .lock()
                .unwrap()
                .extend_from_slice(conversations);
            Ok(())
        }

        async fn upsert_messages(
            &self,
            _account: &str,
            messages: &[MessageRecord],
            topic: &str,
        ) -> Result<(), StoreError> {
            let mut applied = self.messages.lock().unwrap();
            for m in messages {
                applied.push((topic.to_string(), m.id.clone()));
            }
            Ok(())
        }
    }

    fn reconciler(
        staging: Arc<SharedStore>,
        sink: Arc<RecordingSink>,
    ) -> NotificationReconciler<Arc<SharedStore>, Arc<RecordingSink>> {
        NotificationReconciler::new(staging, sink, ReconcileConfig::default())
    }

    #[tokio::test]
    async fn messages_are_applied_in_ascending_send_order() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        for (id, sent) in [("m5", 5), ("m1", 1), ("m3", 3)] {
            staging.stage_message(&message(id, "t1", sent)).unwrap();
        }
        let sink = Arc::new(RecordingSink::default());

        let outcome = reconciler(staging, sink.clone())
            .reconcile("acct")
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied(ReconcileReport { messages: 3, .. })
        ));
        let applied: Vec<String> = sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect();
        assert_eq!(applied, vec!["m1", "m3", "m5"]);
    }

    #[tokio::test]
    async fn empty_context_is_not_forwarded() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        let mut staged = conversation("t1");
        staged.context = Some(StagedContext::default());
        staging.stage_conversation(&staged).unwrap();
        let sink = Arc::new(RecordingSink::default());

        reconciler(staging, sink.clone())
            .reconcile("acct")
            .await
            .unwrap();

        let saved = sink.conversations.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].context, None);
    }

    #[tokio::test]
    async fn concurrent_reconcile_runs_a_single_pass() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        staging.stage_conversation(&conversation("t1")).unwrap();
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let reconciler = Arc::new(reconciler(staging.clone(), sink.clone()));

        let first = {
            let r = reconciler.clone();
            tokio::spawn(async move { r.reconcile("acct").await })
        };
        while sink.conversation_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Stage more while the first pass is mid-merge; the waiter must not drain it.
        staging.stage_conversation(&conversation("t2")).unwrap();
        let second = {
            let r = reconciler.clone();
            tokio::spawn(async move { r.reconcile("acct").await })
        };
        while reconciler.guard().waiting() == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(matches!(first, ReconcileOutcome::Applied(_)));
        assert_eq!(second, ReconcileOutcome::AwaitedInFlight);
        assert_eq!(sink.conversation_calls.load(Ordering::SeqCst), 1);
        assert_eq!(staging.staged_count(StagedList::Conversations).unwrap(), 1);
        assert!(!reconciler.is_reconciling());
    }

    #[tokio::test]
    async fn failed_pass_clears_staging_and_releases_guard() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        staging.stage_conversation(&conversation("t1")).unwrap();
        staging.stage_message(&message("m1", "t1", 10)).unwrap();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let reconciler = reconciler(staging.clone(), sink.clone());

        let err = reconciler.reconcile("acct").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(_)));
        assert!(!reconciler.is_reconciling());
        assert_eq!(staging.staged_count(StagedList::Conversations).unwrap(), 0);
        assert_eq!(staging.staged_count(StagedList::Messages).unwrap(), 0);

        // The next pass is admitted rather than parked forever.
        let next = reconciler.reconcile("acct").await.unwrap();
        assert_eq!(next, ReconcileOutcome::Applied(ReconcileReport::default()));
    }

    #[tokio::test]
    async fn hung_pass_times_out_and_releases_guard() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        staging.stage_conversation(&conversation("t1")).unwrap();
        let sink = Arc::new(RecordingSink {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        });
        let reconciler = NotificationReconciler::new(
            staging.clone(),
            sink,
            ReconcileConfig {
                guard_timeout: Duration::from_secs(5),
                pass_timeout: Duration::from_millis(20),
            },
        );

        let err = reconciler.reconcile("acct").await.unwrap_err();
        assert!(matches!(err, ReconcileError::PassTimeout(_)));
        assert!(!reconciler.is_reconciling());
        assert_eq!(staging.staged_count(StagedList::Conversations).unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped_not_fatal() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        staging.stage_conversation(&conversation("t1")).unwrap();
        staging
            .stage_raw_json(StagedList::Messages, "{not json")
            .unwrap();
        staging.stage_message(&message("m1", "t1", 10)).unwrap();
        let sink = Arc::new(RecordingSink::default());

        let outcome = reconciler(staging.clone(), sink.clone())
            .reconcile("acct")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Applied(ReconcileReport {
                conversations: 1,
                messages: 1,
                rejected: 1,
            })
        );
        assert_eq!(staging.staged_count(StagedList::Messages).unwrap(), 0);
    }

    #[tokio::test]
    async fn staged_scenario_lands_in_message_db() {
        let staging = Arc::new(SharedStore::open_in_memory().unwrap());
        staging.stage_conversation(&conversation("t1")).unwrap();
        staging.stage_message(&message("m2", "t1", 20)).unwrap();
        staging.stage_message(&message("m1", "t1", 10)).unwrap();
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        let reconciler =
            NotificationReconciler::new(staging.clone(), db.clone(), ReconcileConfig::default());

        reconciler.reconcile("acct").await.unwrap();
        // Replaying the same rows changes nothing.
        staging.stage_message(&message("m1", "t1", 10)).unwrap();
        reconciler.reconcile("acct").await.unwrap();

        let conv = db.conversation("acct", "t1").unwrap().unwrap();
        assert_eq!(conv.peer_address.as_deref(), Some("0xA"));
        let ids: Vec<String> = db
            .messages("acct", "t1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(staging.staged_count(StagedList::Conversations).unwrap(), 0);
        assert_eq!(staging.staged_count(StagedList::Messages).unwrap(), 0);
    }

    #[test]
    fn ordering_is_per_topic_and_stable() {
        let ordered = order_messages_by_topic(vec![
            message("b2", "tb", 20),
            message("a1", "ta", 10),
            message("b1", "tb", 10),
            message("a1-dup-time", "ta", 10),
        ]);
        let ta: Vec<&str> = ordered["ta"].iter().map(|m| m.id.as_str()).collect();
        let tb: Vec<&str> = ordered["tb"].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ta, vec!["a1", "a1-dup-time"]);
        assert_eq!(tb, vec!["b1", "b2"]);
    }
}
