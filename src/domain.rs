use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::external::RemoteClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MobileId(pub String);

impl std::fmt::Display for MobileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MobileId {
    fn from(s: &str) -> Self {
        MobileId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Strips the MTProto "-100" broadcast-channel prefix some callers pass in raw.
    pub fn from_raw(raw: &str) -> Self {
        let stripped = raw.strip_prefix("-100").unwrap_or(raw);
        ChannelId(stripped.to_string())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub channel_id: ChannelId,
    pub title: String,
    pub username: Option<String>,
    pub participants_count: u64,
    pub broadcast: bool,
    pub restricted: bool,
    pub can_send_msgs: bool,
    pub available_msgs: Vec<String>,
    pub banned: bool,
    pub last_message_time: Option<i64>,
    pub word_restriction: u32,
}

impl ChannelMeta {
    pub fn new(channel_id: ChannelId, title: impl Into<String>) -> Self {
        Self {
            channel_id,
            title: title.into(),
            username: None,
            participants_count: 0,
            broadcast: false,
            restricted: false,
            can_send_msgs: true,
            available_msgs: vec!["0".to_string()],
            banned: false,
            last_message_time: None,
            word_restriction: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromotionResult {
    pub success: bool,
    pub count: u64,
    pub error_message: Option<String>,
    pub last_check_timestamp: i64,
}

/// Mutable per-mobile record. Synchronization lives one layer up in
/// `SessionStore` (one `tokio::sync::Mutex` per mobile).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub channels: Vec<ChannelId>,
    pub channel_index: usize,
    pub promotion_results: HashMap<ChannelId, PromotionResult>,
    pub promote_msgs: HashMap<String, String>,
    pub last_message_time: i64,
    pub last_checked_time: i64,
    pub sleep_time: i64,
    pub release_time: i64,
    pub success_count: u64,
    pub failed_count: u64,
    pub temp_fail_count: u64,
    pub message_count: u64,
    pub converted: i64,
    pub days_left: i32,
    #[serde(skip)]
    pub is_promoting: bool,
    pub failure_reason: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            channel_index: 0,
            promotion_results: HashMap::new(),
            promote_msgs: HashMap::new(),
            last_message_time: 0,
            last_checked_time: 0,
            sleep_time: 0,
            release_time: 0,
            success_count: 0,
            failed_count: 0,
            temp_fail_count: 0,
            message_count: 0,
            converted: 0,
            days_left: 0,
            is_promoting: false,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingVerification {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub variant_index: String,
    pub timestamp: i64,
}

pub type VerificationFifo = VecDeque<PendingVerification>;

/// A live registry entry for a mobile. Not serialized — entirely in-memory.
pub struct ActiveConnection {
    pub mobile: MobileId,
    pub client: Arc<dyn RemoteClient>,
    pub created_at: Instant,
    pub last_health_check: Instant,
    pub last_deep_check: Instant,
    pub is_active: bool,
}

impl ActiveConnection {
    pub fn new(mobile: MobileId, client: Arc<dyn RemoteClient>) -> Self {
        let now = Instant::now();
        Self {
            mobile,
            client,
            created_at: now,
            last_health_check: now,
            last_deep_check: now,
            is_active: true,
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
