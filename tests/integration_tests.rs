use std::sync::Arc;
use std::time::Duration;

use promo_control::external::mocks::{MockAccountStore, MockChannelStore, MockNotifier, MockRemoteClient, MockTemplateStore};
use promo_control::external::{AccountRecord, SharedRemoteClient};
use promo_control::registry::ClientFactory;
use promo_control::{
    AccountStore, ChannelId, ChannelMeta, ChannelStore, Config, CoreError, HealthChecker, MobileId, Notifier, RotationEngine, Supervisor,
    TemplateStore,
};

struct AlwaysSucceedFactory;

#[async_trait::async_trait]
impl ClientFactory for AlwaysSucceedFactory {
    async fn create(&self, _mobile: &MobileId) -> Result<SharedRemoteClient, CoreError> {
        Ok(Arc::new(MockRemoteClient::always_succeeds()))
    }
}

fn fast_config(state_dir: std::path::PathBuf) -> Config {
    Config {
        active_slots: 2,
        promotion_interval_secs: 1,
        health_check_interval_secs: 1,
        auto_save_interval_secs: 1,
        rotation_interval_secs: 3600,
        min_rotation_interval_secs: 3600,
        max_rotation_interval_secs: 3600,
        state_dir,
        ..Config::default()
    }
}

/// Exercises the full Supervisor wiring: periodic promotion/health/rotation/autosave
/// loops against mocked externals, then a clean stop that flushes state to disk.
#[tokio::test]
async fn supervisor_runs_a_full_cycle_and_persists_on_stop() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = fast_config(dir.path().to_path_buf());

    let account_store: Arc<dyn AccountStore> = Arc::new(MockAccountStore {
        accounts: std::sync::Mutex::new(vec![AccountRecord {
            client_id: "acct".into(),
            promote_mobiles: vec![MobileId::from("m1"), MobileId::from("m2")],
            days_left: 3,
        }]),
        ..Default::default()
    });
    let channel_store: Arc<dyn ChannelStore> = Arc::new(MockChannelStore::with(vec![ChannelMeta::new(ChannelId("c1".into()), "Channel One")]));
    let template_store: Arc<dyn TemplateStore> =
        Arc::new(MockTemplateStore { templates: [("0".to_string(), "hello".to_string())].into() });
    let notifier: Arc<dyn Notifier> = Arc::new(MockNotifier::default());
    let factory: Arc<dyn ClientFactory> = Arc::new(AlwaysSucceedFactory);

    let supervisor = Arc::new(Supervisor::new(config, factory, channel_store, template_store, account_store, notifier));
    supervisor.start().await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let status = supervisor.status().await;
    assert!(status.is_running);
    assert!(status.active_mobiles > 0, "rotation should have picked at least one active mobile");

    supervisor.stop().await;

    let persisted = std::fs::read_dir(dir.path())?.count();
    assert!(persisted > 0, "expected at least one persisted mobile snapshot after stop");

    Ok(())
}

/// A mobile marked unhealthy mid-rotation is dropped from the active set once the
/// health checker's pass runs and refreshes the rotation engine's availability.
#[tokio::test]
async fn unhealthy_mobile_is_excluded_from_rotation_after_health_check() -> anyhow::Result<()> {
    let registry = Arc::new(promo_control::ClientRegistry::new(
        Arc::new(AlwaysSucceedFactory),
        10,
        Duration::from_secs(1),
        Duration::from_secs(1),
    ));
    let rotation = Arc::new(RotationEngine::new(
        registry.clone(),
        2,
        0.1,
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        10,
    ));

    rotation.initialize(vec![MobileId::from("a"), MobileId::from("b")]).await;
    let active = rotation.current_active().await;
    assert_eq!(active.len(), 2);

    let victim = active[0].clone();
    registry.mark_unhealthy(&victim).await;

    let checker = HealthChecker::new(registry, rotation.clone(), Duration::from_secs(3600), Duration::from_secs(5));
    checker.run_once().await;

    let active_after = rotation.current_active().await;
    assert!(!active_after.contains(&victim));
    assert_eq!(active_after.len(), 1);

    Ok(())
}
