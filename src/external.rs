//! External collaborators this crate depends on but does not implement in production:
//! the MTProto transport, channel/template/account storage, and outbound notification.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ChannelId, ChannelMeta, MobileId};
use crate::errors::{SendError, TransportError};

#[derive(Debug, Clone)]
pub struct SelfInfo {
    pub username: Option<String>,
    pub first_name: String,
}

#[derive(Debug, Clone)]
pub struct DialogEntity {
    pub id: ChannelId,
    pub title: String,
    pub username: Option<String>,
    pub participants_count: u64,
    pub broadcast: bool,
    pub restricted: bool,
    pub send_messages_banned: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: i64,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: i64,
}

/// The opaque MTProto session handle. Production implementations wrap a real client;
/// this crate never speaks the protocol itself.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    async fn get_self(&self) -> Result<SelfInfo, TransportError>;
    async fn get_dialogs(&self, limit: usize) -> Result<Vec<DialogEntity>, TransportError>;
    async fn get_entity(&self, id: &ChannelId) -> Result<DialogEntity, TransportError>;
    async fn get_messages(&self, channel: &ChannelId, min_id: i64) -> Result<Vec<RemoteMessage>, TransportError>;
    async fn send_message(&self, target: &ChannelId, message: &str) -> Result<SentMessage, SendError>;
}

impl std::fmt::Debug for dyn RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient").field("is_connected", &self.is_connected()).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    pub last_message_time: Option<i64>,
    pub banned: Option<bool>,
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_one(&self, id: &ChannelId) -> anyhow::Result<Option<ChannelMeta>>;
    async fn upsert(&self, meta: ChannelMeta) -> anyhow::Result<()>;
    async fn update(&self, id: &ChannelId, patch: ChannelPatch) -> anyhow::Result<()>;
    async fn remove_from_available_msgs(&self, id: &ChannelId, variant_index: &str) -> anyhow::Result<()>;
    async fn active_channels(&self, limit: usize, skip: usize, exclude_ids: &[ChannelId]) -> anyhow::Result<Vec<ChannelMeta>>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find_one(&self) -> anyhow::Result<HashMap<String, String>>;
}

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub client_id: String,
    pub promote_mobiles: Vec<MobileId>,
    pub days_left: i32,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_active_clients(&self) -> anyhow::Result<Vec<AccountRecord>>;
    async fn mark_expired(&self, mobile: &MobileId) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, detail: &str);
}

/// No-op notifier used when `notifier_webhook_url` is unset.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: &str, _detail: &str) {}
}

pub type SharedRemoteClient = Arc<dyn RemoteClient>;
pub type SharedChannelStore = Arc<dyn ChannelStore>;
pub type SharedTemplateStore = Arc<dyn TemplateStore>;
pub type SharedAccountStore = Arc<dyn AccountStore>;
pub type SharedNotifier = Arc<dyn Notifier>;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct MockRemoteClient {
        pub connected: std::sync::atomic::AtomicBool,
        pub fail_connect: bool,
        pub self_info: SelfInfo,
        pub dialogs: Vec<DialogEntity>,
        pub messages: StdMutex<HashMap<ChannelId, Vec<RemoteMessage>>>,
        pub next_message_id: std::sync::atomic::AtomicI64,
        pub send_behavior: StdMutex<Box<dyn FnMut(&ChannelId, &str) -> Result<SentMessage, SendError> + Send>>,
    }

    impl MockRemoteClient {
        pub fn new() -> Self {
            Self {
                connected: std::sync::atomic::AtomicBool::new(false),
                fail_connect: false,
                self_info: SelfInfo { username: Some("mock".into()), first_name: "Mock".into() },
                dialogs: Vec::new(),
                messages: StdMutex::new(HashMap::new()),
                next_message_id: std::sync::atomic::AtomicI64::new(1),
                send_behavior: StdMutex::new(Box::new(|_, _| Err(SendError::Other("unconfigured".into())))),
            }
        }

        pub fn always_succeeds() -> Self {
            let mock = Self::new();
            *mock.send_behavior.lock().unwrap() = Box::new(|_, _| Ok(SentMessage { id: 1 }));
            mock
        }
    }

    #[async_trait]
    impl RemoteClient for MockRemoteClient {
        async fn connect(&self) -> Result<(), TransportError> {
            if self.fail_connect {
                return Err(TransportError::Other("mock refuses to connect".into()));
            }
            self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn get_self(&self) -> Result<SelfInfo, TransportError> {
            Ok(self.self_info.clone())
        }

        async fn get_dialogs(&self, limit: usize) -> Result<Vec<DialogEntity>, TransportError> {
            Ok(self.dialogs.iter().take(limit).cloned().collect())
        }

        async fn get_entity(&self, id: &ChannelId) -> Result<DialogEntity, TransportError> {
            self.dialogs
                .iter()
                .find(|d| &d.id == id)
                .cloned()
                .ok_or_else(|| TransportError::Other("entity not found".into()))
        }

        async fn get_messages(&self, channel: &ChannelId, _min_id: i64) -> Result<Vec<RemoteMessage>, TransportError> {
            Ok(self.messages.lock().unwrap().get(channel).cloned().unwrap_or_default())
        }

        async fn send_message(&self, target: &ChannelId, message: &str) -> Result<SentMessage, SendError> {
            (self.send_behavior.lock().unwrap())(target, message)
        }
    }

    #[derive(Default)]
    pub struct MockChannelStore {
        pub channels: StdMutex<HashMap<ChannelId, ChannelMeta>>,
    }

    impl MockChannelStore {
        pub fn with(channels: Vec<ChannelMeta>) -> Self {
            let mut map = HashMap::new();
            for c in channels {
                map.insert(c.channel_id.clone(), c);
            }
            Self { channels: StdMutex::new(map) }
        }
    }

    #[async_trait]
    impl ChannelStore for MockChannelStore {
        async fn find_one(&self, id: &ChannelId) -> anyhow::Result<Option<ChannelMeta>> {
            Ok(self.channels.lock().unwrap().get(id).cloned())
        }

        async fn upsert(&self, meta: ChannelMeta) -> anyhow::Result<()> {
            self.channels.lock().unwrap().insert(meta.channel_id.clone(), meta);
            Ok(())
        }

        async fn update(&self, id: &ChannelId, patch: ChannelPatch) -> anyhow::Result<()> {
            if let Some(meta) = self.channels.lock().unwrap().get_mut(id) {
                if let Some(t) = patch.last_message_time {
                    meta.last_message_time = Some(t);
                }
                if let Some(b) = patch.banned {
                    meta.banned = b;
                }
            }
            Ok(())
        }

        async fn remove_from_available_msgs(&self, id: &ChannelId, variant_index: &str) -> anyhow::Result<()> {
            if let Some(meta) = self.channels.lock().unwrap().get_mut(id) {
                meta.available_msgs.retain(|v| v != variant_index);
            }
            Ok(())
        }

        async fn active_channels(&self, limit: usize, skip: usize, exclude_ids: &[ChannelId]) -> anyhow::Result<Vec<ChannelMeta>> {
            let guard = self.channels.lock().unwrap();
            let mut all: Vec<_> = guard
                .values()
                .filter(|c| !c.banned && !exclude_ids.contains(&c.channel_id))
                .cloned()
                .collect();
            all.sort_by(|a, b| b.participants_count.cmp(&a.participants_count));
            Ok(all.into_iter().skip(skip).take(limit).collect())
        }
    }

    #[derive(Default)]
    pub struct MockTemplateStore {
        pub templates: HashMap<String, String>,
    }

    #[async_trait]
    impl TemplateStore for MockTemplateStore {
        async fn find_one(&self) -> anyhow::Result<HashMap<String, String>> {
            Ok(self.templates.clone())
        }
    }

    #[derive(Default)]
    pub struct MockAccountStore {
        pub accounts: StdMutex<Vec<AccountRecord>>,
        pub expired: StdMutex<Vec<MobileId>>,
    }

    #[async_trait]
    impl AccountStore for MockAccountStore {
        async fn get_active_clients(&self) -> anyhow::Result<Vec<AccountRecord>> {
            Ok(self.accounts.lock().unwrap().clone())
        }

        async fn mark_expired(&self, mobile: &MobileId) -> anyhow::Result<()> {
            self.expired.lock().unwrap().push(mobile.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockNotifier {
        pub events: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify(&self, event: &str, detail: &str) {
            self.events.lock().unwrap().push((event.to_string(), detail.to_string()));
        }
    }
}
