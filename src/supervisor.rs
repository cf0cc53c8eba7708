//! Wires up the components, spawns the periodic drivers, and owns their lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::domain::MobileId;
use crate::external::{SharedAccountStore, SharedChannelStore, SharedNotifier, SharedTemplateStore};
use crate::health::HealthChecker;
use crate::registry::{ClientFactory, ClientRegistry};
use crate::rotation::RotationEngine;
use crate::scheduler::{load_candidate_pool, PromotionScheduler};
use crate::session::SessionStore;
use crate::persistence::StatePersistence;

#[derive(Debug, Clone, Default)]
pub struct SupervisorStatus {
    pub is_running: bool,
    pub healthy_mobiles: usize,
    pub active_mobiles: usize,
}

pub struct Supervisor {
    config: Config,
    registry: Arc<ClientRegistry>,
    rotation: Arc<RotationEngine>,
    sessions: Arc<SessionStore>,
    scheduler: Arc<PromotionScheduler>,
    persistence: Arc<StatePersistence>,
    health_checker: Arc<HealthChecker>,
    account_store: SharedAccountStore,
    is_running: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        factory: Arc<dyn ClientFactory>,
        channel_store: SharedChannelStore,
        template_store: SharedTemplateStore,
        account_store: SharedAccountStore,
        notifier: SharedNotifier,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new(
            factory,
            config.max_concurrent_connections,
            config.connection_timeout(),
            config.disconnect_timeout(),
        ));
        let rotation = Arc::new(RotationEngine::new(
            registry.clone(),
            config.active_slots,
            config.rotation_jitter_percentage,
            config.rotation_interval(),
            config.min_rotation_interval(),
            config.max_rotation_interval(),
            config.max_rotation_history,
        ));
        let sessions = Arc::new(SessionStore::new(config.max_results_size));
        let queue = Arc::new(crate::verification::VerificationQueue::new(
            config.max_queue_size,
            config.message_check_delay_secs as i64 * 1000,
        ));
        let persistence = Arc::new(StatePersistence::new(config.state_dir.clone()));
        let health_checker = Arc::new(HealthChecker::new(
            registry.clone(),
            rotation.clone(),
            Duration::from_secs(2 * 60 * 60),
            Duration::from_secs(10),
        ));
        let scheduler = Arc::new(PromotionScheduler::new(
            registry.clone(),
            rotation.clone(),
            sessions.clone(),
            queue,
            channel_store,
            template_store,
            account_store.clone(),
            notifier,
        ));

        Self {
            config,
            registry,
            rotation,
            sessions,
            scheduler,
            persistence,
            health_checker,
            account_store,
            is_running: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let pool = load_candidate_pool(&self.account_store, &self.sessions).await?;
        self.persistence.load_all(&self.sessions, &pool).await;
        self.rotation.initialize(pool).await;

        self.is_running.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_promotion_loop());
        tasks.push(self.spawn_health_loop());
        tasks.push(self.spawn_rotation_loop());
        tasks.push(self.spawn_autosave_loop());

        info!("supervisor started");
        Ok(())
    }

    fn spawn_promotion_loop(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let running = self.is_running.clone();
        let interval = self.config.promotion_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                scheduler.tick().await;
            }
        })
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let checker = self.health_checker.clone();
        let running = self.is_running.clone();
        let interval = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                checker.run_once().await;
            }
        })
    }

    fn spawn_rotation_loop(&self) -> JoinHandle<()> {
        let rotation = self.rotation.clone();
        let running = self.is_running.clone();
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let wait = rotation.next_interval();
                tokio::time::sleep(wait).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                rotation.rotate().await;
            }
        })
    }

    fn spawn_autosave_loop(&self) -> JoinHandle<()> {
        let persistence = self.persistence.clone();
        let sessions = self.sessions.clone();
        let running = self.is_running.clone();
        let interval = self.config.auto_save_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                sessions.cleanup().await;
                persistence.save_all(&sessions).await;
            }
        })
    }

    /// Stop all periodic drivers, let in-flight sends finish, then flush persistence,
    /// bounded by a 60s total timeout.
    pub async fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        let flush = self.persistence.save_all(&self.sessions);
        let _ = tokio::time::timeout(Duration::from_secs(60), flush).await;
        self.registry.release_all().await;
        info!("supervisor stopped");
    }

    pub async fn status(&self) -> SupervisorStatus {
        let health = self.registry.health_map().await;
        SupervisorStatus {
            is_running: self.is_running.load(Ordering::SeqCst),
            healthy_mobiles: health.values().filter(|h| **h).count(),
            active_mobiles: self.rotation.current_active().await.len(),
        }
    }

    pub async fn active_mobiles(&self) -> Vec<MobileId> {
        self.rotation.current_active().await
    }
}
