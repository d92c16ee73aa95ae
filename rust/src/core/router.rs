// Notification tap routing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde::Deserialize;

/// The fields of a notification's `data` payload that routing looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(default)]
    pub new_conversation_topic: Option<String>,
    #[serde(default)]
    pub content_topic: Option<String>,
}

impl NotificationData {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// A new-conversation topic wins over the message's content topic. Empty
    /// strings count as absent.
    pub fn topic(&self) -> Option<&str> {
        [&self.new_conversation_topic, &self.content_topic]
            .into_iter()
            .filter_map(|t| t.as_deref())
            .find(|t| !t.is_empty())
    }
}

/// Opens a conversation screen. Implemented by the platform shell.
pub trait Navigator: Send + Sync {
    fn open_conversation(&self, topic: &str);
}

/// Whatever in-memory view of loaded conversations the shell has.
pub trait ConversationLookup {
    fn contains_topic(&self, topic: &str) -> bool;
}

impl<V> ConversationLookup for HashMap<String, V> {
    fn contains_topic(&self, topic: &str) -> bool {
        self.contains_key(topic)
    }
}

impl<V> ConversationLookup for BTreeMap<String, V> {
    fn contains_topic(&self, topic: &str) -> bool {
        self.contains_key(topic)
    }
}

impl ConversationLookup for HashSet<String> {
    fn contains_topic(&self, topic: &str) -> bool {
        self.contains(topic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Navigated(String),
    Deferred(String),
    Ignored,
}

pub struct NotificationRouter<N> {
    navigator: N,
    pending_topic: Mutex<Option<String>>,
}

impl<N: Navigator> NotificationRouter<N> {
    pub fn new(navigator: N) -> Self {
        Self {
            navigator,
            pending_topic: Mutex::new(None),
        }
    }

    /// Route a tapped notification: open the conversation now if it is loaded,
    /// otherwise remember it for [`Self::resume_pending`]. A newer deferred tap
    /// replaces an older one.
    pub fn on_interact(
        &self,
        data: &NotificationData,
        conversations: &impl ConversationLookup,
    ) -> RouteDecision {
        let Some(topic) = data.topic() else {
            return RouteDecision::Ignored;
        };
        if conversations.contains_topic(topic) {
            tracing::info!(topic, "notification tap: opening conversation");
            self.navigator.open_conversation(topic);
            return RouteDecision::Navigated(topic.to_string());
        }
        tracing::info!(topic, "notification tap: conversation not loaded, deferring");
        *self.pending() = Some(topic.to_string());
        RouteDecision::Deferred(topic.to_string())
    }

    /// Same as [`Self::on_interact`] for a raw JSON `data` payload.
    pub fn on_interact_json(
        &self,
        raw: &str,
        conversations: &impl ConversationLookup,
    ) -> RouteDecision {
        match NotificationData::from_json(raw) {
            Ok(data) => self.on_interact(&data, conversations),
            Err(e) => {
                tracing::warn!(%e, "notification tap: undecodable payload");
                RouteDecision::Ignored
            }
        }
    }

    /// Called once the shell's conversation set has loaded. Navigates to the
    /// pending topic if it is now present; otherwise the intent is kept.
    pub fn resume_pending(&self, conversations: &impl ConversationLookup) -> Option<String> {
        let mut pending = self.pending();
        let topic = pending.take()?;
        if !conversations.contains_topic(&topic) {
            *pending = Some(topic);
            return None;
        }
        drop(pending);
        tracing::info!(topic = %topic, "notification tap: opening deferred conversation");
        self.navigator.open_conversation(&topic);
        Some(topic)
    }

    pub fn pending_topic(&self) -> Option<String> {
        self.pending().clone()
    }

    /// Hand the pending intent to the caller, who becomes responsible for it.
    pub fn take_pending_topic(&self) -> Option<String> {
        self.pending().take()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.pending_topic.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct RecordingNavigator {
        opened: Arc<Mutex<Vec<String>>>,
    }

    impl Navigator for RecordingNavigator {
        fn open_conversation(&self, topic: &str) {
            self.opened.lock().unwrap().push(topic.to_string());
        }
    }

    fn loaded(topics: &[&str]) -> HashSet<String> {
        topics.iter().map(|t| t.to_string()).collect()
    }

    fn content_topic(topic: &str) -> NotificationData {
        NotificationData {
            new_conversation_topic: None,
            content_topic: Some(topic.into()),
        }
    }

    #[test]
    fn loaded_topic_navigates_immediately() {
        let nav = RecordingNavigator::default();
        let router = NotificationRouter::new(nav.clone());

        let decision = router.on_interact(&content_topic("t1"), &loaded(&["t1"]));

        assert_eq!(decision, RouteDecision::Navigated("t1".into()));
        assert_eq!(*nav.opened.lock().unwrap(), vec!["t1"]);
        assert_eq!(router.pending_topic(), None);
    }

    #[test]
    fn unloaded_topic_is_deferred_without_navigation() {
        let nav = RecordingNavigator::default();
        let router = NotificationRouter::new(nav.clone());

        let decision = router.on_interact(&content_topic("t2"), &loaded(&["t1"]));

        assert_eq!(decision, RouteDecision::Deferred("t2".into()));
        assert!(nav.opened.lock().unwrap().is_empty());
        assert_eq!(router.pending_topic(), Some("t2".into()));
    }

    #[test]
    fn deferred_topic_navigates_once_after_load() {
        let nav = RecordingNavigator::default();
        let router = NotificationRouter::new(nav.clone());
        router.on_interact(&content_topic("t2"), &HashSet::<String>::new());

        // Still loading: nothing happens and the intent survives.
        assert_eq!(router.resume_pending(&loaded(&["t1"])), None);
        assert_eq!(router.pending_topic(), Some("t2".into()));

        assert_eq!(router.resume_pending(&loaded(&["t1", "t2"])), Some("t2".into()));
        assert_eq!(router.resume_pending(&loaded(&["t1", "t2"])), None);
        assert_eq!(*nav.opened.lock().unwrap(), vec!["t2"]);
    }

    #[test]
    fn new_conversation_topic_takes_precedence() {
        let data = NotificationData::from_json(
            r#"{"newConversationTopic": "fresh", "contentTopic": "old"}"#,
        )
        .unwrap();
        assert_eq!(data.topic(), Some("fresh"));

        let empty_first =
            NotificationData::from_json(r#"{"newConversationTopic": "", "contentTopic": "old"}"#)
                .unwrap();
        assert_eq!(empty_first.topic(), Some("old"));
    }

    #[test]
    fn payload_without_topic_is_ignored() {
        let nav = RecordingNavigator::default();
        let router = NotificationRouter::new(nav.clone());

        let map: HashMap<String, ()> = HashMap::new();
        assert_eq!(
            router.on_interact_json(r#"{"other": 1}"#, &map),
            RouteDecision::Ignored
        );
        assert_eq!(
            router.on_interact_json("not json", &map),
            RouteDecision::Ignored
        );
        assert!(nav.opened.lock().unwrap().is_empty());
        assert_eq!(router.take_pending_topic(), None);
    }
}
