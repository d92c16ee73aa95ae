pub(crate) mod config;
mod error;
mod guard;
mod message_db;
mod push;
mod reconcile;
mod router;
mod staging;

pub use config::{load_app_config, AppConfig, CONFIG_FILE, DEFAULT_API_URL};
pub use error::{PushError, ReconcileError, StoreError};
pub use guard::{Admission, GuardPermit, GuardTimeout, ReconcileGuard};
pub use message_db::{
    ConversationContext, ConversationRecord, MessageDb, MessageRecord, MessageStatus,
    MESSAGE_DB_FILE,
};
pub use push::{
    desired_topics, user_invite_topic, DevicePushToken, HttpSubscriptionApi, PushSubscriptions,
    PushTokenProvider, SubscribableConversation, SubscribeOutcome, SubscribeRequest,
    SubscriptionApi,
};
pub use reconcile::{NotificationReconciler, ReconcileConfig, ReconcileOutcome, ReconcileReport};
pub use router::{
    ConversationLookup, Navigator, NotificationData, NotificationRouter, RouteDecision,
};
pub use staging::{ConversationSink, StagingSource};
