//! Bounded per-mobile FIFO of sent messages awaiting a survival probe, with
//! drop-oldest overflow handling.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::{now_millis, ChannelId, MobileId, PendingVerification};
use crate::external::{ChannelPatch, SharedChannelStore, SharedNotifier, SharedRemoteClient};

pub struct VerificationOutcome {
    pub mobile: MobileId,
    pub channel: ChannelId,
    pub survived: bool,
}

pub struct VerificationQueue {
    queues: RwLock<HashMap<MobileId, Arc<Mutex<VecDeque<PendingVerification>>>>>,
    max_queue_size: usize,
    check_delay_ms: i64,
}

impl VerificationQueue {
    pub fn new(max_queue_size: usize, check_delay_ms: i64) -> Self {
        Self { queues: RwLock::new(HashMap::new()), max_queue_size, check_delay_ms }
    }

    async fn queue_for(&self, mobile: &MobileId) -> Arc<Mutex<VecDeque<PendingVerification>>> {
        if let Some(q) = self.queues.read().await.get(mobile) {
            return q.clone();
        }
        let mut guard = self.queues.write().await;
        guard.entry(mobile.clone()).or_insert_with(|| Arc::new(Mutex::new(VecDeque::new()))).clone()
    }

    /// Enqueue a just-sent message for deferred survival probing. Overflow drops the
    /// oldest 10%.
    pub async fn push(&self, mobile: &MobileId, item: PendingVerification) {
        let queue = self.queue_for(mobile).await;
        let mut guard = queue.lock().await;
        if guard.len() >= self.max_queue_size {
            let drop_count = (self.max_queue_size / 10).max(1);
            warn!(mobile = %mobile, drop_count, "verification queue full, dropping oldest entries");
            for _ in 0..drop_count {
                guard.pop_front();
            }
        }
        guard.push_back(item);
    }

    pub async fn len(&self, mobile: &MobileId) -> usize {
        self.queue_for(mobile).await.lock().await.len()
    }

    /// Drain every entry older than the check delay across all mobiles, probing each
    /// for survival and mutating channel metadata per the deletion policy.
    pub async fn drain(
        &self,
        now: i64,
        clients: &HashMap<MobileId, SharedRemoteClient>,
        channel_store: &SharedChannelStore,
        notifier: &SharedNotifier,
    ) -> Vec<VerificationOutcome> {
        let mobiles: Vec<MobileId> = self.queues.read().await.keys().cloned().collect();
        let mut outcomes = Vec::new();

        for mobile in mobiles {
            let queue = self.queue_for(&mobile).await;
            let due: Vec<PendingVerification> = {
                let mut guard = queue.lock().await;
                let mut due = Vec::new();
                let mut remaining = VecDeque::new();
                while let Some(item) = guard.pop_front() {
                    if now - item.timestamp >= self.check_delay_ms {
                        due.push(item);
                    } else {
                        remaining.push_back(item);
                    }
                }
                *guard = remaining;
                due
            };

            let Some(client) = clients.get(&mobile) else { continue };

            for item in due {
                match self.probe(client, channel_store, notifier, &mobile, &item).await {
                    Ok(survived) => outcomes.push(VerificationOutcome { mobile: mobile.clone(), channel: item.channel_id.clone(), survived }),
                    Err(e) => warn!(mobile = %mobile, channel = %item.channel_id, error = %e, "verification probe failed"),
                }
            }
        }

        outcomes
    }

    async fn probe(
        &self,
        client: &SharedRemoteClient,
        channel_store: &SharedChannelStore,
        notifier: &SharedNotifier,
        mobile: &MobileId,
        item: &PendingVerification,
    ) -> anyhow::Result<bool> {
        let messages = client.get_messages(&item.channel_id, item.message_id - 2).await?;
        let survived = messages.first().map(|m| m.id == item.message_id).unwrap_or(false);

        if survived {
            channel_store
                .update(&item.channel_id, ChannelPatch { last_message_time: Some(now_millis()), banned: None })
                .await?;
            return Ok(true);
        }

        self.apply_deletion(channel_store, notifier, mobile, item).await?;
        Ok(false)
    }

    async fn apply_deletion(
        &self,
        channel_store: &SharedChannelStore,
        notifier: &SharedNotifier,
        mobile: &MobileId,
        item: &PendingVerification,
    ) -> anyhow::Result<()> {
        let meta = channel_store.find_one(&item.channel_id).await?;
        let available_after: Vec<String> = meta
            .map(|m| m.available_msgs.into_iter().filter(|v| v != &item.variant_index).collect())
            .unwrap_or_default();

        if item.variant_index == "0" && available_after.is_empty() {
            channel_store.update(&item.channel_id, ChannelPatch { last_message_time: None, banned: Some(true) }).await?;
            notifier
                .notify("channel_banned", &format!("mobile={mobile} channel={}", item.channel_id))
                .await;
            info!(mobile = %mobile, channel = %item.channel_id, "channel banned: canary variant deleted with no variants left");
        } else {
            channel_store.remove_from_available_msgs(&item.channel_id, &item.variant_index).await?;
            notifier
                .notify("variant_removed", &format!("mobile={mobile} channel={} variant={}", item.channel_id, item.variant_index))
                .await;
            info!(mobile = %mobile, channel = %item.channel_id, variant = %item.variant_index, "message deleted: variant removed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::{MockChannelStore, MockNotifier, MockRemoteClient};
    use crate::domain::ChannelMeta;
    use std::sync::Arc;

    fn pending(channel: &str, message_id: i64, variant: &str, timestamp: i64) -> PendingVerification {
        PendingVerification { channel_id: ChannelId(channel.into()), message_id, variant_index: variant.into(), timestamp }
    }

    #[tokio::test]
    async fn push_drops_oldest_tenth_on_overflow() {
        let queue = VerificationQueue::new(10, 10_000);
        let mobile = MobileId::from("m1");
        for i in 0..10 {
            queue.push(&mobile, pending("c", i, "0", i)).await;
        }
        queue.push(&mobile, pending("c", 100, "0", 100)).await;
        assert_eq!(queue.len(&mobile).await, 10);
    }

    #[tokio::test]
    async fn surviving_message_refreshes_channel() {
        let queue = VerificationQueue::new(1000, 0);
        let mobile = MobileId::from("m1");
        let channel = ChannelId("c1".into());
        let mock_client = Arc::new(MockRemoteClient::new());
        mock_client.messages.lock().unwrap().insert(channel.clone(), vec![crate::external::RemoteMessage { id: 42 }]);
        let mut clients: HashMap<MobileId, SharedRemoteClient> = HashMap::new();
        clients.insert(mobile.clone(), mock_client);

        let channel_store: SharedChannelStore = Arc::new(MockChannelStore::with(vec![ChannelMeta::new(channel.clone(), "c")]));
        let notifier: SharedNotifier = Arc::new(MockNotifier::default());

        queue.push(&mobile, pending("c1", 42, "0", now_millis() - 100_000)).await;
        let outcomes = queue.drain(now_millis(), &clients, &channel_store, &notifier).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].survived);
    }

    #[tokio::test]
    async fn deleted_canary_with_no_variants_left_bans_channel() {
        let queue = VerificationQueue::new(1000, 0);
        let mobile = MobileId::from("m1");
        let channel = ChannelId("c1".into());
        let mock_client = Arc::new(MockRemoteClient::new()); // no stored messages => deletion
        let mut clients: HashMap<MobileId, SharedRemoteClient> = HashMap::new();
        clients.insert(mobile.clone(), mock_client);

        let mut meta = ChannelMeta::new(channel.clone(), "c");
        meta.available_msgs = vec!["0".to_string()];
        let channel_store: SharedChannelStore = Arc::new(MockChannelStore::with(vec![meta]));
        let notifier: SharedNotifier = Arc::new(MockNotifier::default());

        queue.push(&mobile, pending("c1", 42, "0", now_millis() - 100_000)).await;
        queue.drain(now_millis(), &clients, &channel_store, &notifier).await;

        let updated = channel_store.find_one(&channel).await.unwrap().unwrap();
        assert!(updated.banned);
    }

    #[tokio::test]
    async fn deleted_non_canary_removes_variant_only() {
        let queue = VerificationQueue::new(1000, 0);
        let mobile = MobileId::from("m1");
        let channel = ChannelId("c1".into());
        let mock_client = Arc::new(MockRemoteClient::new());
        let mut clients: HashMap<MobileId, SharedRemoteClient> = HashMap::new();
        clients.insert(mobile.clone(), mock_client);

        let mut meta = ChannelMeta::new(channel.clone(), "c");
        meta.available_msgs = vec!["0".to_string(), "1".to_string()];
        let channel_store: SharedChannelStore = Arc::new(MockChannelStore::with(vec![meta]));
        let notifier: SharedNotifier = Arc::new(MockNotifier::default());

        queue.push(&mobile, pending("c1", 42, "1", now_millis() - 100_000)).await;
        queue.drain(now_millis(), &clients, &channel_store, &notifier).await;

        let updated = channel_store.find_one(&channel).await.unwrap().unwrap();
        assert!(!updated.banned);
        assert_eq!(updated.available_msgs, vec!["0".to_string()]);
    }
}
