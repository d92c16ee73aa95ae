// Push notification subscription management.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Serialize;
use url::Url;

use super::error::PushError;

const PUSH_TOKEN_FILE: &str = "push_token.txt";

/// Topic on which invitations to new conversations for `address` arrive.
pub fn user_invite_topic(address: &str) -> String {
    format!("/xmtp/0/invite-{address}/proto")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribableConversation {
    pub topic: String,
    pub peer_address: Option<String>,
    pub pending: bool,
}

/// Topics this device should receive pushes for. `blocked` holds lower-cased
/// peer addresses.
pub fn desired_topics(
    address: &str,
    conversations: &[SubscribableConversation],
    blocked: &HashSet<String>,
) -> HashSet<String> {
    let mut topics: HashSet<String> = conversations
        .iter()
        .filter(|c| !c.pending)
        .filter(|c| match c.peer_address.as_deref() {
            Some(peer) if !peer.is_empty() => !blocked.contains(&peer.to_lowercase()),
            _ => false,
        })
        .map(|c| c.topic.clone())
        .collect();
    topics.insert(user_invite_topic(address));
    topics
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePushToken {
    pub data: String,
    /// `apns` or `fcm`.
    pub token_type: String,
}

/// Where push tokens come from. The platform shell owns the real implementation.
pub trait PushTokenProvider: Send + Sync {
    fn expo_push_token(&self) -> impl Future<Output = Result<String, PushError>> + Send;

    fn device_push_token(&self) -> impl Future<Output = Result<DevicePushToken, PushError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub expo_token: String,
    pub native_token: String,
    pub native_token_type: String,
    pub topics: Vec<String>,
}

/// The notification server's device/topic registration endpoints.
pub trait SubscriptionApi: Send + Sync {
    fn subscribe(
        &self,
        request: &SubscribeRequest,
    ) -> impl Future<Output = Result<(), PushError>> + Send;

    fn unregister_device(
        &self,
        expo_token: &str,
    ) -> impl Future<Output = Result<(), PushError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpSubscriptionApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSubscriptionApi {
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self, PushError> {
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, PushError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl SubscriptionApi for HttpSubscriptionApi {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<(), PushError> {
        let url = self.endpoint(&["api", "subscribe"])?;
        let resp = self.client.post(url).json(request).send().await?;
        if !resp.status().is_success() {
            return Err(PushError::Status(resp.status()));
        }
        Ok(())
    }

    async fn unregister_device(&self, expo_token: &str) -> Result<(), PushError> {
        // The token is a single path segment; the url crate percent-encodes it.
        let url = self.endpoint(&["api", "device", expo_token])?;
        let resp = self.client.delete(url).send().await?;
        if !resp.status().is_success() {
            return Err(PushError::Status(resp.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The server now has this many topics for the device.
    Subscribed(usize),
    /// Same topic set as the last successful call; no request was made.
    Unchanged,
    /// Logged and dropped. The cached set is untouched so the next call retries.
    Failed,
}

pub struct PushSubscriptions<P, A> {
    tokens: P,
    api: A,
    data_dir: PathBuf,
    // Held across the network call so overlapping subscribes do not double-post.
    last_subscribed: tokio::sync::Mutex<HashSet<String>>,
    expo_token: std::sync::Mutex<Option<String>>,
}

impl<P, A> PushSubscriptions<P, A>
where
    P: PushTokenProvider,
    A: SubscriptionApi,
{
    pub fn new(tokens: P, api: A, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let expo_token = load_push_token(&data_dir);
        Self {
            tokens,
            api,
            data_dir,
            last_subscribed: tokio::sync::Mutex::new(HashSet::new()),
            expo_token: std::sync::Mutex::new(expo_token),
        }
    }

    pub fn expo_token(&self) -> Option<String> {
        self.token_slot().clone()
    }

    pub async fn last_subscribed_topics(&self) -> HashSet<String> {
        self.last_subscribed.lock().await.clone()
    }

    pub async fn subscribe(
        &self,
        address: &str,
        conversations: &[SubscribableConversation],
        blocked: &HashSet<String>,
    ) -> SubscribeOutcome {
        let topics = desired_topics(address, conversations, blocked);

        let (expo, native) =
            tokio::join!(self.tokens.expo_push_token(), self.tokens.device_push_token());
        let (expo_token, native) = match (expo, native) {
            (Ok(expo), Ok(native)) => (expo, native),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(%e, "push: could not get push tokens");
                return SubscribeOutcome::Failed;
            }
        };
        self.remember_token(&expo_token);

        let mut last = self.last_subscribed.lock().await;
        if *last == topics {
            tracing::debug!(count = topics.len(), "push: topics unchanged, skipping subscribe");
            return SubscribeOutcome::Unchanged;
        }

        let mut sorted: Vec<String> = topics.iter().cloned().collect();
        sorted.sort();
        let request = SubscribeRequest {
            expo_token,
            native_token: native.data,
            native_token_type: native.token_type,
            topics: sorted,
        };
        match self.api.subscribe(&request).await {
            Ok(()) => {
                let count = topics.len();
                *last = topics;
                tracing::info!(count, "push: subscribed to topics");
                SubscribeOutcome::Subscribed(count)
            }
            Err(e) => {
                tracing::warn!(%e, "push: could not subscribe to notifications");
                SubscribeOutcome::Failed
            }
        }
    }

    /// Unregister this device from the server and forget its token. Returns
    /// `false` if there was no token or the server call failed; the token is
    /// forgotten either way.
    pub async fn disable(&self) -> bool {
        let Some(token) = self.token_slot().take() else {
            return false;
        };
        let path = self.data_dir.join(PUSH_TOKEN_FILE);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(%e, "push: could not remove stored token");
            }
        }

        let mut last = self.last_subscribed.lock().await;
        last.clear();
        match self.api.unregister_device(&token).await {
            Ok(()) => {
                tracing::info!("push: unregistered device");
                true
            }
            Err(e) => {
                tracing::warn!(%e, "push: could not unsubscribe from notifications");
                false
            }
        }
    }

    fn remember_token(&self, token: &str) {
        let mut slot = self.token_slot();
        if slot.as_deref() == Some(token) {
            return;
        }
        *slot = Some(token.to_string());
        drop(slot);
        if let Err(e) = std::fs::write(self.data_dir.join(PUSH_TOKEN_FILE), token) {
            tracing::warn!(%e, "push: could not persist push token");
        }
    }

    fn token_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.expo_token.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

fn load_push_token(data_dir: &Path) -> Option<String> {
    let token = std::fs::read_to_string(data_dir.join(PUSH_TOKEN_FILE)).ok()?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
