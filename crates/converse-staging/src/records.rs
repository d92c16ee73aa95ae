use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Content type assumed when a staged message does not carry one.
pub const DEFAULT_CONTENT_TYPE: &str = "xmtp.org/text:1.0";

/// Conversation inferred from a push payload by the notification handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedConversation {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<StagedContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedContext {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StagedContext {
    /// An empty id with no metadata carries nothing worth persisting.
    pub fn is_informative(&self) -> bool {
        !self.conversation_id.is_empty() || !self.metadata.is_empty()
    }
}

/// Message inferred from a push payload by the notification handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedMessage {
    pub id: String,
    pub topic: String,
    pub sender_address: String,
    pub sent: i64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_via_converse: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl StagedMessage {
    pub fn content_type_or_default(&self) -> &str {
        self.content_type
            .as_deref()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// What the notification handler needs to title a notification for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDict {
    pub peer_address: String,
    pub short_address: String,
    pub title: String,
}

impl ConversationDict {
    pub fn new(peer_address: &str, title: Option<&str>) -> Self {
        let short = short_address(peer_address);
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| short.clone());
        Self {
            peer_address: peer_address.to_string(),
            short_address: short,
            title,
        }
    }
}

/// `0x1234...abcd` form of a wallet address. Short inputs are returned as is.
pub fn short_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 7 {
        return address.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Rows read from one staged list. Rows that fail to decode are reported in
/// `rejected` instead of failing the whole load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBatch<T> {
    pub records: Vec<T>,
    pub rejected: Vec<RejectedRecord>,
    /// Highest row sequence included in this batch, `0` when nothing was staged.
    pub high_water: i64,
}

impl<T> StagedBatch<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            rejected: Vec::new(),
            high_water: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub seq: i64,
    pub reason: String,
}
