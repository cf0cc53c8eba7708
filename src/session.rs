//! Per-mobile state keyed behind one `tokio::sync::Mutex` each, so concurrent
//! promotion ticks never contend on a single global lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::domain::{now_millis, ChannelId, MobileId, PromotionResult, SessionState};
use crate::rng::{mobile_rng, shuffle};

pub struct Outcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub count_delta: u64,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<MobileId, Arc<Mutex<SessionState>>>>,
    max_results_size: usize,
}

impl SessionStore {
    pub fn new(max_results_size: usize) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), max_results_size }
    }

    pub async fn ensure(&self, mobile: &MobileId) -> Arc<Mutex<SessionState>> {
        if let Some(s) = self.sessions.read().await.get(mobile) {
            return s.clone();
        }
        let mut guard = self.sessions.write().await;
        guard.entry(mobile.clone()).or_insert_with(|| Arc::new(Mutex::new(SessionState::default()))).clone()
    }

    pub async fn insert(&self, mobile: MobileId, state: SessionState) {
        self.sessions.write().await.insert(mobile, Arc::new(Mutex::new(state)));
    }

    pub async fn remove(&self, mobile: &MobileId) {
        self.sessions.write().await.remove(mobile);
    }

    pub async fn mobiles(&self) -> Vec<MobileId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self, mobile: &MobileId) -> Option<SessionState> {
        let handle = self.sessions.read().await.get(mobile)?.clone();
        let state = handle.lock().await.clone();
        Some(state)
    }

    /// Healthy-for-scheduling predicate: not past the week-7 cutoff, past its
    /// send-cadence floor, and not currently asleep.
    pub async fn is_healthy(&self, mobile: &MobileId) -> bool {
        let handle = match self.sessions.read().await.get(mobile) {
            Some(h) => h.clone(),
            None => return false,
        };
        let state = handle.lock().await;
        let now = now_millis();

        if state.days_left >= 7 {
            return false;
        }
        let message_cadence_ok = if state.days_left < 1 {
            state.last_message_time < now - 12 * 60 * 1000
        } else {
            state.last_message_time < now - 3 * 60 * 1000
        };
        message_cadence_ok && state.sleep_time < now
    }

    pub async fn update_last_message_time(&self, mobile: &MobileId, t: Option<i64>) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.last_message_time = t.unwrap_or_else(now_millis);
    }

    pub async fn update_last_checked_time(&self, mobile: &MobileId, t: Option<i64>) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.last_checked_time = t.unwrap_or_else(now_millis);
    }

    pub async fn inc_success(&self, mobile: &MobileId) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.success_count += 1;
        state.temp_fail_count = 0;
    }

    pub async fn inc_failed(&self, mobile: &MobileId) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.failed_count += 1;
        state.temp_fail_count += 1;
    }

    pub async fn inc_msg_count(&self, mobile: &MobileId) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.message_count += 1;
    }

    pub async fn set_sleep(&self, mobile: &MobileId, until: i64) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.sleep_time = until;
    }

    pub async fn set_failure_reason(&self, mobile: &MobileId, reason: Option<String>) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.failure_reason = reason;
    }

    /// Re-entrancy guard. Returns `true` if this call transitioned the flag from
    /// `false` to `true` (i.e. the caller now owns the critical section).
    pub async fn try_start_promoting(&self, mobile: &MobileId) -> bool {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        if state.is_promoting {
            false
        } else {
            state.is_promoting = true;
            true
        }
    }

    pub async fn stop_promoting(&self, mobile: &MobileId) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.is_promoting = false;
    }

    pub async fn set_channels(&self, mobile: &MobileId, channels: Vec<ChannelId>) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        state.channels = channels;
        state.channel_index = 0;
    }

    pub async fn current_channel(&self, mobile: &MobileId) -> Option<ChannelId> {
        let handle = self.ensure(mobile).await;
        let state = handle.lock().await;
        state.channels.get(state.channel_index).cloned()
    }

    pub async fn channel_count(&self, mobile: &MobileId) -> usize {
        let handle = self.ensure(mobile).await;
        state_len(&handle).await
    }

    /// Advance the cursor; reshuffle on wrap-around when more than one channel exists,
    /// using the mobile's seeded PRNG for reproducible order.
    pub async fn advance_channel(&self, mobile: &MobileId) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        if state.channels.is_empty() {
            return;
        }
        state.channel_index += 1;
        if state.channel_index >= state.channels.len() {
            state.channel_index = 0;
            if state.channels.len() > 1 {
                let mut rng = mobile_rng(&mobile.0);
                shuffle(&mut rng, &mut state.channels);
            }
        }
    }

    pub async fn record_outcome(&self, mobile: &MobileId, channel: &ChannelId, outcome: Outcome) {
        let handle = self.ensure(mobile).await;
        let mut state = handle.lock().await;
        let entry = state.promotion_results.entry(channel.clone()).or_default();
        entry.success = outcome.success;
        entry.error_message = outcome.error_message;
        entry.count += outcome.count_delta;
        entry.last_check_timestamp = now_millis();

        if state.promotion_results.len() > self.max_results_size {
            let mut by_count: Vec<(ChannelId, PromotionResult)> =
                state.promotion_results.drain().collect();
            by_count.sort_by(|a, b| b.1.count.cmp(&a.1.count));
            by_count.truncate(self.max_results_size);
            state.promotion_results = by_count.into_iter().collect();
        }
    }

    /// Channels this mobile must skip because of a recent `USER_BANNED_IN_CHANNEL`
    /// within the last 3 days.
    pub async fn banned_channels(&self, mobile: &MobileId) -> Vec<ChannelId> {
        let handle = self.ensure(mobile).await;
        let state = handle.lock().await;
        let now = now_millis();
        let three_days_ms = 3 * 24 * 60 * 60 * 1000;
        state
            .promotion_results
            .iter()
            .filter(|(_, r)| {
                !r.success
                    && r.error_message.as_deref() == Some("USER_BANNED_IN_CHANNEL")
                    && r.last_check_timestamp > now - three_days_ms
            })
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Every channel this mobile has a recorded failed outcome for, regardless of
    /// reason. Used to keep a fresh dialog refill from re-adding channels already
    /// known not to work for this mobile.
    pub async fn failed_channels(&self, mobile: &MobileId) -> std::collections::HashSet<ChannelId> {
        let handle = self.ensure(mobile).await;
        let state = handle.lock().await;
        state.promotion_results.iter().filter(|(_, r)| !r.success).map(|(c, _)| c.clone()).collect()
    }

    /// TTL cleanup (outcome history older than 3 days) and size cleanup
    /// (keep top `max_results_size` by count), run from the same driver as autosave.
    pub async fn cleanup(&self) {
        let mobiles = self.mobiles().await;
        let now = now_millis();
        let three_days_ms = 3 * 24 * 60 * 60 * 1000;
        for mobile in mobiles {
            let handle = self.ensure(&mobile).await;
            let mut state = handle.lock().await;
            state.promotion_results.retain(|_, r| r.last_check_timestamp >= now - three_days_ms);
            if state.days_left < 0 {
                state.promotion_results.clear();
            }
        }
    }
}

async fn state_len(handle: &Arc<Mutex<SessionState>>) -> usize {
    handle.lock().await.channels.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_healthy_respects_sleep_time() {
        let store = SessionStore::new(5000);
        let mobile = MobileId::from("m1");
        store
            .insert(
                mobile.clone(),
                SessionState { last_message_time: 0, sleep_time: now_millis() + 60_000, days_left: 0, ..Default::default() },
            )
            .await;
        assert!(!store.is_healthy(&mobile).await);
    }

    #[tokio::test]
    async fn is_healthy_respects_cadence_for_days_left_zero_vs_positive() {
        let store = SessionStore::new(5000);
        let m0 = MobileId::from("m0");
        store.insert(m0.clone(), SessionState { last_message_time: now_millis() - 13 * 60 * 1000, days_left: 0, ..Default::default() }).await;
        assert!(store.is_healthy(&m0).await);

        let m1 = MobileId::from("m1");
        store.insert(m1.clone(), SessionState { last_message_time: now_millis() - 4 * 60 * 1000, days_left: 1, ..Default::default() }).await;
        assert!(store.is_healthy(&m1).await);

        let m2 = MobileId::from("m2");
        store.insert(m2.clone(), SessionState { last_message_time: now_millis() - 4 * 60 * 1000, days_left: 0, ..Default::default() }).await;
        assert!(!store.is_healthy(&m2).await);
    }

    #[tokio::test]
    async fn is_healthy_false_past_week_threshold() {
        let store = SessionStore::new(5000);
        let mobile = MobileId::from("m1");
        store.insert(mobile.clone(), SessionState { days_left: 7, ..Default::default() }).await;
        assert!(!store.is_healthy(&mobile).await);
    }

    #[tokio::test]
    async fn promoting_guard_is_exclusive() {
        let store = SessionStore::new(5000);
        let mobile = MobileId::from("m1");
        assert!(store.try_start_promoting(&mobile).await);
        assert!(!store.try_start_promoting(&mobile).await);
        store.stop_promoting(&mobile).await;
        assert!(store.try_start_promoting(&mobile).await);
    }

    #[tokio::test]
    async fn advance_channel_wraps_and_reshuffles() {
        let store = SessionStore::new(5000);
        let mobile = MobileId::from("m1");
        let channels = vec![ChannelId("a".into()), ChannelId("b".into()), ChannelId("c".into())];
        store.set_channels(&mobile, channels.clone()).await;
        store.advance_channel(&mobile).await;
        store.advance_channel(&mobile).await;
        store.advance_channel(&mobile).await;
        let handle = store.ensure(&mobile).await;
        assert_eq!(handle.lock().await.channel_index, 0);
    }

    #[tokio::test]
    async fn banned_channel_is_reported_within_window() {
        let store = SessionStore::new(5000);
        let mobile = MobileId::from("m1");
        let channel = ChannelId("c1".into());
        store
            .record_outcome(
                &mobile,
                &channel,
                Outcome { success: false, error_message: Some("USER_BANNED_IN_CHANNEL".into()), count_delta: 0 },
            )
            .await;
        assert_eq!(store.banned_channels(&mobile).await, vec![channel]);
    }

    #[tokio::test]
    async fn results_are_trimmed_to_max_size() {
        let store = SessionStore::new(2);
        let mobile = MobileId::from("m1");
        for i in 0..5 {
            let channel = ChannelId(format!("c{i}"));
            store.record_outcome(&mobile, &channel, Outcome { success: true, error_message: None, count_delta: i as u64 }).await;
        }
        let handle = store.ensure(&mobile).await;
        assert_eq!(handle.lock().await.promotion_results.len(), 2);
    }
}
