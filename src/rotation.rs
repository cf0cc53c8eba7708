//! Picks a fresh active subset of the candidate pool on a jittered timer, diffing
//! against the previous active set to issue connect/disconnect deltas.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{now_millis, MobileId};
use crate::registry::ClientRegistry;

/// Advisory only — not enforced by `rotate()`, which always reshuffles the full
/// active set rather than guaranteeing a minimum amount of churn.
#[allow(dead_code)]
const MIN_ACTIVE_CHANGE_PERCENTAGE: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct RotationHistoryEntry {
    pub timestamp: i64,
    pub selected: Vec<MobileId>,
}

#[derive(Debug, Clone, Default)]
pub struct RotationStatus {
    pub active: Vec<MobileId>,
    pub available: Vec<MobileId>,
}

struct RotationState {
    candidate_pool: Vec<MobileId>,
    available: Vec<MobileId>,
    active: Vec<MobileId>,
    history: VecDeque<RotationHistoryEntry>,
}

pub struct RotationEngine {
    registry: Arc<ClientRegistry>,
    state: RwLock<RotationState>,
    active_slots: usize,
    jitter_percentage: f64,
    base_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    max_history: usize,
}

impl RotationEngine {
    pub fn new(
        registry: Arc<ClientRegistry>,
        active_slots: usize,
        jitter_percentage: f64,
        base_interval: Duration,
        min_interval: Duration,
        max_interval: Duration,
        max_history: usize,
    ) -> Self {
        Self {
            registry,
            state: RwLock::new(RotationState {
                candidate_pool: Vec::new(),
                available: Vec::new(),
                active: Vec::new(),
                history: VecDeque::new(),
            }),
            active_slots,
            jitter_percentage,
            base_interval,
            min_interval,
            max_interval,
            max_history,
        }
    }

    /// Seed the candidate pool and connect an initial active subset.
    pub async fn initialize(&self, pool: Vec<MobileId>) {
        {
            let mut state = self.state.write().await;
            state.candidate_pool = pool.clone();
            state.available = pool;
        }
        self.rotate().await;
    }

    /// Sample a fresh active subset and issue the connect/disconnect deltas.
    pub async fn rotate(&self) {
        let (to_add, to_remove) = {
            let mut state = self.state.write().await;
            let mut shuffled = state.available.clone();
            let slots = self.active_slots.min(shuffled.len());
            shuffled.shuffle(&mut *crate::rng::shared_rng().lock().unwrap());
            let new_active: Vec<MobileId> = shuffled.drain(..slots).collect();

            let old_active: std::collections::HashSet<_> = state.active.iter().cloned().collect();
            let new_set: std::collections::HashSet<_> = new_active.iter().cloned().collect();
            let to_add: Vec<_> = new_active.iter().filter(|m| !old_active.contains(*m)).cloned().collect();
            let to_remove: Vec<_> = state.active.iter().filter(|m| !new_set.contains(*m)).cloned().collect();

            state.active = new_active.clone();
            state.available = state.candidate_pool.clone();
            state.history.push_back(RotationHistoryEntry { timestamp: now_millis(), selected: new_active.clone() });
            while state.history.len() > self.max_history {
                state.history.pop_front();
            }

            (to_add, to_remove)
        };

        for mobile in &to_remove {
            self.registry.release(mobile).await;
        }
        for mobile in &to_add {
            if let Err(e) = self.registry.acquire(mobile).await {
                tracing::warn!(mobile = %mobile, error = %e, "rotation failed to acquire client");
            }
        }

        crate::log_rotation_event!(to_add, to_remove, Uuid::new_v4());
    }

    /// Intersect the candidate pool with registry health, dropping newly-unhealthy
    /// mobiles from `active`.
    pub async fn refresh_available(&self) {
        let health = self.registry.health_map().await;
        let mut state = self.state.write().await;
        state.available = state
            .candidate_pool
            .iter()
            .filter(|m| health.get(*m).copied().unwrap_or(false))
            .cloned()
            .collect();
        let available = state.available.clone();
        state.active.retain(|m| available.contains(m));
    }

    pub async fn current_active(&self) -> Vec<MobileId> {
        self.state.read().await.active.clone()
    }

    pub async fn available(&self) -> Vec<MobileId> {
        self.state.read().await.available.clone()
    }

    pub async fn status(&self) -> RotationStatus {
        let state = self.state.read().await;
        RotationStatus { active: state.active.clone(), available: state.available.clone() }
    }

    pub async fn history(&self) -> Vec<RotationHistoryEntry> {
        self.state.read().await.history.iter().cloned().collect()
    }

    /// Base interval jittered uniformly by ± `jitter_percentage`, clamped to [min, max].
    pub fn next_interval(&self) -> Duration {
        let base = self.base_interval.as_secs_f64();
        let jitter = crate::rng::shared_rng().lock().unwrap().gen_range(-self.jitter_percentage..=self.jitter_percentage);
        let jittered = base * (1.0 + jitter);
        let clamped = jittered.clamp(self.min_interval.as_secs_f64(), self.max_interval.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::MockRemoteClient;
    use crate::registry::ClientFactory;
    use std::sync::Arc;

    struct Factory;
    #[async_trait::async_trait]
    impl ClientFactory for Factory {
        async fn create(&self, _m: &MobileId) -> Result<crate::external::SharedRemoteClient, crate::errors::CoreError> {
            Ok(Arc::new(MockRemoteClient::always_succeeds()))
        }
    }

    fn engine() -> (Arc<ClientRegistry>, RotationEngine) {
        let registry = Arc::new(ClientRegistry::new(Arc::new(Factory), 100, Duration::from_secs(1), Duration::from_secs(1)));
        let rotation = RotationEngine::new(registry.clone(), 2, 0.3, Duration::from_secs(3600), Duration::from_secs(3000), Duration::from_secs(4000), 50);
        (registry, rotation)
    }

    #[tokio::test]
    async fn active_set_never_exceeds_slots() {
        let (_r, rotation) = engine();
        let pool: Vec<MobileId> = (0..10).map(|i| MobileId::from(format!("m{i}").as_str())).collect();
        rotation.initialize(pool).await;
        assert!(rotation.current_active().await.len() <= 2);
    }

    #[tokio::test]
    async fn active_set_has_no_duplicates() {
        let (_r, rotation) = engine();
        let pool: Vec<MobileId> = (0..10).map(|i| MobileId::from(format!("m{i}").as_str())).collect();
        rotation.initialize(pool).await;
        let active = rotation.current_active().await;
        let unique: std::collections::HashSet<_> = active.iter().collect();
        assert_eq!(unique.len(), active.len());
    }

    #[tokio::test]
    async fn jittered_interval_stays_within_clamp() {
        let (_r, rotation) = engine();
        for _ in 0..50 {
            let interval = rotation.next_interval();
            assert!(interval >= Duration::from_secs(3000) && interval <= Duration::from_secs(4000));
        }
    }

    #[tokio::test]
    async fn refresh_available_drops_unhealthy_from_active() {
        let (registry, rotation) = engine();
        let pool: Vec<MobileId> = vec![MobileId::from("m1"), MobileId::from("m2")];
        rotation.initialize(pool).await;
        let active = rotation.current_active().await;
        let victim = active[0].clone();
        registry.mark_unhealthy(&victim).await;
        rotation.refresh_available().await;
        assert!(!rotation.current_active().await.contains(&victim));
    }
}
