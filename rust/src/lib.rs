mod core;
mod logging;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use converse_staging::{ConversationDict, SharedStore};

pub use crate::core::*;
pub use converse_staging;

uniffi::setup_scaffolding!();

/// Implemented by the shell to show a conversation screen.
#[uniffi::export(callback_interface)]
pub trait ConversationNavigator: Send + Sync + 'static {
    fn open_conversation(&self, topic: String);
}

/// Implemented by the shell on top of the platform notification APIs. `None`
/// means the token is unavailable (no permission, simulator, ...).
#[uniffi::export(callback_interface)]
pub trait PushTokenSource: Send + Sync + 'static {
    fn expo_push_token(&self) -> Option<String>;
    fn device_push_token(&self) -> Option<NativePushToken>;
}

#[derive(uniffi::Record, Debug, Clone, PartialEq, Eq)]
pub struct NativePushToken {
    pub data: String,
    pub token_type: String,
}

#[derive(uniffi::Record, Debug, Clone, PartialEq, Eq)]
pub struct PushConversation {
    pub topic: String,
    pub peer_address: Option<String>,
    pub pending: bool,
}

#[derive(uniffi::Record, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// False when another pass was already running and this call only waited.
    pub applied: bool,
    pub conversations: u32,
    pub messages: u32,
    pub rejected: u32,
    pub failed: bool,
}

#[derive(uniffi::Enum, Debug, Clone, PartialEq, Eq)]
pub enum TapOutcome {
    Navigated { topic: String },
    Deferred { topic: String },
    Ignored,
}

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum FfiError {
    #[error("initialization failed: {0}")]
    Init(String),
}

struct ForeignNavigator(Box<dyn ConversationNavigator>);

impl Navigator for ForeignNavigator {
    fn open_conversation(&self, topic: &str) {
        self.0.open_conversation(topic.to_string());
    }
}

struct ForeignTokens(Arc<dyn PushTokenSource>);

impl PushTokenProvider for ForeignTokens {
    async fn expo_push_token(&self) -> Result<String, PushError> {
        let source = self.0.clone();
        tokio::task::spawn_blocking(move || source.expo_push_token())
            .await
            .map_err(|e| PushError::TokenUnavailable(e.to_string()))?
            .ok_or_else(|| PushError::TokenUnavailable("no expo push token".into()))
    }

    async fn device_push_token(&self) -> Result<DevicePushToken, PushError> {
        let source = self.0.clone();
        let token = tokio::task::spawn_blocking(move || source.device_push_token())
            .await
            .map_err(|e| PushError::TokenUnavailable(e.to_string()))?
            .ok_or_else(|| PushError::TokenUnavailable("no device push token".into()))?;
        Ok(DevicePushToken {
            data: token.data,
            token_type: token.token_type,
        })
    }
}

type Reconciler = NotificationReconciler<Arc<SharedStore>, Arc<MessageDb>>;
type Push = PushSubscriptions<ForeignTokens, HttpSubscriptionApi>;

#[derive(uniffi::Object)]
pub struct FfiNotifications {
    runtime: tokio::runtime::Runtime,
    shared: Arc<SharedStore>,
    reconciler: Arc<Reconciler>,
    router: NotificationRouter<ForeignNavigator>,
    push: Arc<Push>,
    loaded_topics: RwLock<HashSet<String>>,
    network_disabled: bool,
}

#[uniffi::export]
impl FfiNotifications {
    #[uniffi::constructor]
    pub fn new(
        data_dir: String,
        shared_dir: String,
        navigator: Box<dyn ConversationNavigator>,
        token_source: Box<dyn PushTokenSource>,
    ) -> Result<Arc<Self>, FfiError> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, shared_dir = %shared_dir, "FfiNotifications::new() starting");

        Self::build(&data_dir, &shared_dir, navigator, token_source)
            .map(Arc::new)
            .map_err(|e| {
                tracing::error!(error = %format!("{e:#}"), "FfiNotifications::new() failed");
                FfiError::Init(format!("{e:#}"))
            })
    }

    pub fn on_notification_tapped(&self, data_json: String) -> TapOutcome {
        // Route against a snapshot so no lock is held while the navigator runs;
        // the shell may call back into this object from there.
        let loaded = self.loaded_topics();
        match self.router.on_interact_json(&data_json, &loaded) {
            RouteDecision::Navigated(topic) => TapOutcome::Navigated { topic },
            RouteDecision::Deferred(topic) => {
                // The shell may have published the topic after our snapshot but
                // before the intent was stored.
                match self.router.resume_pending(&self.loaded_topics()) {
                    Some(topic) => TapOutcome::Navigated { topic },
                    None => TapOutcome::Deferred { topic },
                }
            }
            RouteDecision::Ignored => TapOutcome::Ignored,
        }
    }

    /// Replace the set of conversations the shell has in memory. Opens a
    /// deferred tap if its conversation is now present and returns its topic.
    pub fn set_loaded_conversations(&self, topics: Vec<String>) -> Option<String> {
        let topics: HashSet<String> = topics.into_iter().collect();
        match self.loaded_topics.write() {
            Ok(mut slot) => *slot = topics.clone(),
            Err(poison) => *poison.into_inner() = topics.clone(),
        }
        self.router.resume_pending(&topics)
    }

    pub fn take_pending_topic(&self) -> Option<String> {
        self.router.take_pending_topic()
    }

    /// Fire-and-forget. Overlapping calls are serialized inside the manager.
    pub fn subscribe_to_notifications(
        &self,
        address: String,
        conversations: Vec<PushConversation>,
        blocked: Vec<String>,
    ) {
        if self.network_disabled {
            tracing::info!("push: network disabled, not subscribing");
            return;
        }
        let conversations: Vec<SubscribableConversation> = conversations
            .into_iter()
            .map(|c| SubscribableConversation {
                topic: c.topic,
                peer_address: c.peer_address,
                pending: c.pending,
            })
            .collect();
        let blocked: HashSet<String> = blocked.into_iter().map(|b| b.to_lowercase()).collect();
        let push = self.push.clone();
        self.runtime.spawn(async move {
            push.subscribe(&address, &conversations, &blocked).await;
        });
    }

    pub fn disable_push_notifications(&self) {
        if self.network_disabled {
            tracing::info!("push: network disabled, not unregistering");
            return;
        }
        let push = self.push.clone();
        self.runtime.spawn(async move {
            push.disable().await;
        });
    }

    /// Store what the notification handler needs to title a conversation.
    pub fn save_conversation_identifiers(
        &self,
        topic: String,
        peer_address: String,
        title: Option<String>,
    ) {
        let dict = ConversationDict::new(&peer_address, title.as_deref());
        if let Err(e) = self.shared.save_conversation_dict(&topic, &dict) {
            tracing::warn!(%e, topic = %topic, "could not save conversation identifiers");
        }
    }

    pub fn notification_badge(&self) -> u32 {
        self.shared.badge().unwrap_or_else(|e| {
            tracing::warn!(%e, "could not read badge");
            0
        })
    }

    pub fn set_notification_badge(&self, badge: u32) {
        if let Err(e) = self.shared.set_badge(badge) {
            tracing::warn!(%e, badge, "could not write badge");
        }
    }

    pub fn shown_notification_ids(&self) -> Vec<String> {
        self.shared.shown_notification_ids().unwrap_or_else(|e| {
            tracing::warn!(%e, "could not read shown notification ids");
            Vec::new()
        })
    }

    pub fn set_shown_notification_ids(&self, ids: Vec<String>) {
        if let Err(e) = self.shared.set_shown_notification_ids(&ids) {
            tracing::warn!(%e, "could not write shown notification ids");
        }
    }
}

#[uniffi::export]
impl FfiNotifications {
    /// Merge whatever the notification handler staged into the message
    /// database. The pass runs on the core runtime; failures are logged and
    /// reported through `failed`.
    pub async fn reconcile_saved_notifications(&self, account: String) -> ReconcileSummary {
        let reconciler = self.reconciler.clone();
        let pass = self
            .runtime
            .spawn(async move { reconciler.reconcile(&account).await });
        match pass.await {
            Ok(Ok(ReconcileOutcome::Applied(report))) => ReconcileSummary {
                applied: true,
                conversations: saturating_u32(report.conversations),
                messages: saturating_u32(report.messages),
                rejected: saturating_u32(report.rejected),
                failed: false,
            },
            Ok(Ok(ReconcileOutcome::AwaitedInFlight)) => ReconcileSummary::default(),
            Ok(Err(_)) => ReconcileSummary {
                failed: true,
                ..ReconcileSummary::default()
            },
            Err(e) => {
                tracing::error!(%e, "reconcile task did not complete");
                ReconcileSummary {
                    failed: true,
                    ..ReconcileSummary::default()
                }
            }
        }
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl FfiNotifications {
    fn build(
        data_dir: &str,
        shared_dir: &str,
        navigator: Box<dyn ConversationNavigator>,
        token_source: Box<dyn PushTokenSource>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| format!("create {data_dir}"))?;
        let config = load_app_config(Path::new(data_dir));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("converse-core")
            .enable_all()
            .build()
            .context("build tokio runtime")?;

        let shared = Arc::new(SharedStore::open(shared_dir).context("open shared staging store")?);
        let db = Arc::new(MessageDb::open(data_dir).context("open message database")?);
        let reconciler = Arc::new(NotificationReconciler::new(
            shared.clone(),
            db,
            config.reconcile_config(),
        ));

        let api = HttpSubscriptionApi::new(reqwest::Client::new(), &config.api_url())
            .context("parse push api url")?;
        let push = Arc::new(PushSubscriptions::new(
            ForeignTokens(Arc::from(token_source)),
            api,
            data_dir,
        ));

        Ok(Self {
            runtime,
            shared,
            reconciler,
            router: NotificationRouter::new(ForeignNavigator(navigator)),
            push,
            loaded_topics: RwLock::new(HashSet::new()),
            network_disabled: config.network_disabled(),
        })
    }

    fn loaded_topics(&self) -> HashSet<String> {
        match self.loaded_topics.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    /// Direct access for tests and the debug binary.
    pub fn shared_store(&self) -> &SharedStore {
        &self.shared
    }
}
