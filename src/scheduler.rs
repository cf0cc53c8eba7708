//! Drives one promotion tick over the active, healthy mobiles in capped-concurrency
//! batches, then drains the verification queue for messages sent on prior ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{now_millis, ChannelId, MobileId, PendingVerification};
use crate::errors::SendError;
use crate::external::{DialogEntity, SharedAccountStore, SharedChannelStore, SharedNotifier, SharedRemoteClient, SharedTemplateStore};
use crate::registry::{classify_permanent, ClientRegistry};
use crate::rotation::RotationEngine;
use crate::session::{Outcome, SessionStore};
use crate::verification::VerificationQueue;

const DEEP_CHECK_STALE: Duration = Duration::from_secs(2 * 60 * 60);
const BATCH_SIZE: usize = 3;
const GREETINGS: &[&str] = &["Hey there!", "Quick heads up!", "Check this out:"];

pub struct PromotionScheduler {
    registry: Arc<ClientRegistry>,
    rotation: Arc<RotationEngine>,
    sessions: Arc<SessionStore>,
    queue: Arc<VerificationQueue>,
    channel_store: SharedChannelStore,
    template_store: SharedTemplateStore,
    account_store: SharedAccountStore,
    notifier: SharedNotifier,
}

impl PromotionScheduler {
    pub fn new(
        registry: Arc<ClientRegistry>,
        rotation: Arc<RotationEngine>,
        sessions: Arc<SessionStore>,
        queue: Arc<VerificationQueue>,
        channel_store: SharedChannelStore,
        template_store: SharedTemplateStore,
        account_store: SharedAccountStore,
        notifier: SharedNotifier,
    ) -> Self {
        Self { registry, rotation, sessions, queue, channel_store, template_store, account_store, notifier }
    }

    /// One global tick: healthy mobiles in capped-concurrency batches, plus a
    /// verification drain over the same tick.
    pub async fn tick(&self) {
        let active = self.rotation.current_active().await;
        let mut healthy = Vec::new();
        for mobile in active {
            if self.sessions.is_healthy(&mobile).await {
                healthy.push(mobile);
            }
        }

        for batch in healthy.chunks(BATCH_SIZE) {
            let mut handles = Vec::new();
            for mobile in batch.iter() {
                let stagger = Duration::from_millis(crate::rng::shared_rng().lock().unwrap().gen_range(0..=500));
                let mobile = mobile.clone();
                let this = self.clone_refs();
                handles.push(tokio::spawn(async move {
                    tokio::time::sleep(stagger).await;
                    this.send_one(&mobile).await;
                }));
            }
            futures::future::join_all(handles).await;
        }

        let mut clients: HashMap<MobileId, SharedRemoteClient> = HashMap::new();
        for mobile in self.registry.registered_mobiles().await {
            if let Some(c) = self.registry.get(&mobile).await {
                clients.insert(mobile, c);
            }
        }
        self.queue.drain(now_millis(), &clients, &self.channel_store, &self.notifier).await;
    }

    fn clone_refs(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            rotation: self.rotation.clone(),
            sessions: self.sessions.clone(),
            queue: self.queue.clone(),
            channel_store: self.channel_store.clone(),
            template_store: self.template_store.clone(),
            account_store: self.account_store.clone(),
            notifier: self.notifier.clone(),
        }
    }

    async fn send_one(&self, mobile: &MobileId) {
        let client = match self.registry.acquire(mobile).await {
            Ok(c) => c,
            Err(e) => {
                warn!(mobile = %mobile, error = %e, "failed to acquire client for promotion");
                return;
            }
        };

        let deep_stale = self.registry.last_deep_check_age(mobile).await.map(|a| a >= DEEP_CHECK_STALE).unwrap_or(true);
        if deep_stale {
            match tokio::time::timeout(Duration::from_secs(10), client.get_self()).await {
                Ok(Ok(_)) => self.registry.touch_deep_check(mobile).await,
                _ => {
                    warn!(mobile = %mobile, "deep probe failed before promotion, skipping tick");
                    return;
                }
            }
        }

        if self.sessions.channel_count(mobile).await == 0 {
            if let Err(e) = self.fetch_dialogs(mobile, &client).await {
                warn!(mobile = %mobile, error = %e, "dialog refill failed");
                return;
            }
            if self.sessions.channel_count(mobile).await == 0 {
                return;
            }
        }

        let Some(channel_id) = self.sessions.current_channel(mobile).await else { return };

        if self.sessions.banned_channels(mobile).await.contains(&channel_id) {
            self.sessions.advance_channel(mobile).await;
            return;
        }

        if !self.sessions.try_start_promoting(mobile).await {
            return;
        }
        let result = self.send_to_channel(mobile, &client, &channel_id).await;
        self.sessions.stop_promoting(mobile).await;

        if let Err(e) = result {
            warn!(mobile = %mobile, channel = %channel_id, error = %e, "promotion step failed");
        }

        self.sessions.advance_channel(mobile).await;
    }

    async fn send_to_channel(&self, mobile: &MobileId, client: &SharedRemoteClient, channel_id: &ChannelId) -> anyhow::Result<()> {
        let correlation_id = Uuid::new_v4();
        let meta = match self.channel_store.find_one(channel_id).await? {
            Some(m) => m,
            None => {
                let entity = client.get_entity(channel_id).await?;
                let meta = entity_to_meta(entity);
                self.channel_store.upsert(meta.clone()).await?;
                meta
            }
        };

        let templates = self.template_store.find_one().await?;
        let variant_index = pick_variant(&meta.available_msgs);
        let template = templates.get(&variant_index).cloned().unwrap_or_default();

        let message = if meta.word_restriction == 0 && crate::rng::shared_rng().lock().unwrap().gen_bool(0.5) {
            let greeting = GREETINGS[crate::rng::shared_rng().lock().unwrap().gen_range(0..GREETINGS.len())];
            format!("{greeting} {template}")
        } else {
            template
        };

        match client.send_message(channel_id, &message).await {
            Ok(sent) => {
                self.sessions.update_last_message_time(mobile, None).await;
                self.sessions.inc_success(mobile).await;
                self.sessions.inc_msg_count(mobile).await;
                self.sessions.record_outcome(mobile, channel_id, Outcome { success: true, error_message: None, count_delta: 1 }).await;
                self.queue
                    .push(
                        mobile,
                        PendingVerification { channel_id: channel_id.clone(), message_id: sent.id, variant_index, timestamp: now_millis() },
                    )
                    .await;
                crate::log_send_success!(mobile, channel_id, correlation_id);
                Ok(())
            }
            Err(SendError::FloodWait(seconds)) => {
                self.sessions.set_sleep(mobile, now_millis() + seconds as i64 * 1000).await;
                self.sessions
                    .record_outcome(mobile, channel_id, Outcome { success: false, error_message: Some(format!("FLOOD_WAIT:{seconds}")), count_delta: 0 })
                    .await;
                self.sessions.inc_failed(mobile).await;
                crate::log_send_failure!(mobile, channel_id, correlation_id, format!("flood_wait:{seconds}s"));
                Ok(())
            }
            Err(SendError::ChannelPrivate) => {
                if let Some(username) = &meta.username {
                    let target = ChannelId(username.clone());
                    if let Ok(sent) = client.send_message(&target, &message).await {
                        self.sessions.update_last_message_time(mobile, None).await;
                        self.sessions.inc_success(mobile).await;
                        self.sessions.inc_msg_count(mobile).await;
                        self.sessions.record_outcome(mobile, channel_id, Outcome { success: true, error_message: None, count_delta: 1 }).await;
                        self.queue
                            .push(mobile, PendingVerification { channel_id: channel_id.clone(), message_id: sent.id, variant_index, timestamp: now_millis() })
                            .await;
                        crate::log_send_success!(mobile, channel_id, correlation_id);
                        return Ok(());
                    }
                }
                self.sessions
                    .record_outcome(mobile, channel_id, Outcome { success: false, error_message: Some("CHANNEL_PRIVATE".into()), count_delta: 0 })
                    .await;
                self.sessions.inc_failed(mobile).await;
                crate::log_send_failure!(mobile, channel_id, correlation_id, "channel_private");
                Ok(())
            }
            Err(SendError::UserBanned) => {
                self.sessions
                    .record_outcome(mobile, channel_id, Outcome { success: false, error_message: Some("USER_BANNED_IN_CHANNEL".into()), count_delta: 0 })
                    .await;
                self.sessions.inc_failed(mobile).await;
                crate::log_send_failure!(mobile, channel_id, correlation_id, "user_banned_in_channel");
                self.notifier.notify("user_banned_in_channel", &format!("mobile={mobile} channel={channel_id}")).await;
                Ok(())
            }
            Err(other) => {
                if let Some(perm) = classify_permanent(&other.to_string()) {
                    self.account_store.mark_expired(mobile).await?;
                    self.registry.release(mobile).await;
                    warn!(mobile = %mobile, failure = %perm, "account permanently failed, evicted");
                    return Ok(());
                }
                self.sessions
                    .record_outcome(mobile, channel_id, Outcome { success: false, error_message: Some(other.to_string()), count_delta: 0 })
                    .await;
                self.sessions.inc_failed(mobile).await;
                crate::log_send_failure!(mobile, channel_id, correlation_id, other.to_string());
                Ok(())
            }
        }
    }

    /// Refill a mobile's channel list from the transport's dialog list.
    async fn fetch_dialogs(&self, mobile: &MobileId, client: &SharedRemoteClient) -> anyhow::Result<()> {
        let dialogs = client.get_dialogs(500).await?;
        let already_failed = self.sessions.failed_channels(mobile).await;

        let mut candidates: Vec<DialogEntity> = dialogs
            .into_iter()
            .filter(|d| !d.broadcast)
            .filter(|d| !d.send_messages_banned)
            .filter(|d| !d.restricted)
            .filter(|d| d.participants_count > 500)
            .filter(|d| !already_failed.contains(&d.id))
            .collect();

        candidates.sort_by(|a, b| b.participants_count.cmp(&a.participants_count));
        candidates.truncate(250);

        let mut channel_ids: Vec<ChannelId> = candidates.into_iter().map(|d| d.id).collect();
        channel_ids.sort();
        channel_ids.dedup();

        let mut rng = crate::rng::mobile_rng(&mobile.0);
        crate::rng::shuffle(&mut rng, &mut channel_ids);

        self.sessions.set_channels(mobile, channel_ids).await;
        Ok(())
    }
}

fn entity_to_meta(entity: DialogEntity) -> crate::domain::ChannelMeta {
    let mut meta = crate::domain::ChannelMeta::new(entity.id, entity.title);
    meta.username = entity.username;
    meta.participants_count = entity.participants_count;
    meta.broadcast = entity.broadcast;
    meta.restricted = entity.restricted;
    meta.can_send_msgs = !entity.send_messages_banned;
    meta
}

fn pick_variant(available: &[String]) -> String {
    if available.is_empty() {
        return "0".to_string();
    }
    let idx = crate::rng::shared_rng().lock().unwrap().gen_range(0..available.len());
    available[idx].clone()
}

/// Pull the candidate mobile pool from the external account store.
pub async fn load_candidate_pool(account_store: &SharedAccountStore, sessions: &SessionStore) -> anyhow::Result<Vec<MobileId>> {
    let accounts = account_store.get_active_clients().await?;
    let mut pool = Vec::new();
    for account in accounts {
        for mobile in account.promote_mobiles {
            let handle = sessions.ensure(&mobile).await;
            handle.lock().await.days_left = account.days_left;
            pool.push(mobile);
        }
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::{MockAccountStore, MockChannelStore, MockNotifier, MockRemoteClient, MockTemplateStore};
    use crate::external::AccountRecord;
    use crate::registry::ClientFactory;
    use std::sync::Arc;

    struct AlwaysSucceed;
    #[async_trait::async_trait]
    impl ClientFactory for AlwaysSucceed {
        async fn create(&self, _m: &MobileId) -> Result<SharedRemoteClient, crate::errors::CoreError> {
            Ok(Arc::new(MockRemoteClient::always_succeeds()))
        }
    }

    fn harness() -> (Arc<ClientRegistry>, Arc<RotationEngine>, Arc<SessionStore>, Arc<VerificationQueue>) {
        let registry = Arc::new(ClientRegistry::new(Arc::new(AlwaysSucceed), 100, Duration::from_secs(1), Duration::from_secs(1)));
        let rotation = Arc::new(RotationEngine::new(registry.clone(), 4, 0.3, Duration::from_secs(3600), Duration::from_secs(3000), Duration::from_secs(4000), 50));
        let sessions = Arc::new(SessionStore::new(5000));
        let queue = Arc::new(VerificationQueue::new(1000, 10_000));
        (registry, rotation, sessions, queue)
    }

    #[tokio::test]
    async fn send_to_channel_records_success_and_enqueues_verification() {
        let (registry, rotation, sessions, queue) = harness();
        let channel = ChannelId("c1".into());
        let channel_store: SharedChannelStore = Arc::new(MockChannelStore::with(vec![crate::domain::ChannelMeta::new(channel.clone(), "c")]));
        let template_store: SharedTemplateStore = Arc::new(MockTemplateStore { templates: [("0".to_string(), "hi".to_string())].into() });
        let account_store: SharedAccountStore = Arc::new(MockAccountStore::default());
        let notifier: SharedNotifier = Arc::new(MockNotifier::default());

        let scheduler = PromotionScheduler::new(registry.clone(), rotation, sessions.clone(), queue.clone(), channel_store, template_store, account_store, notifier);

        let mobile = MobileId::from("m1");
        let client = registry.acquire(&mobile).await.unwrap();
        scheduler.send_to_channel(&mobile, &client, &channel).await.unwrap();

        assert_eq!(queue.len(&mobile).await, 1);
        let snap = sessions.snapshot(&mobile).await.unwrap();
        assert_eq!(snap.success_count, 1);
    }

    #[tokio::test]
    async fn candidate_pool_carries_days_left_from_account_store() {
        let sessions = SessionStore::new(5000);
        let account_store: SharedAccountStore = Arc::new(MockAccountStore {
            accounts: std::sync::Mutex::new(vec![AccountRecord { client_id: "a".into(), promote_mobiles: vec![MobileId::from("m1")], days_left: 3 }]),
            ..Default::default()
        });
        let pool = load_candidate_pool(&account_store, &sessions).await.unwrap();
        assert_eq!(pool, vec![MobileId::from("m1")]);
        let snap = sessions.snapshot(&MobileId::from("m1")).await.unwrap();
        assert_eq!(snap.days_left, 3);
    }
}
