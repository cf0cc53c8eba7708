//! Periodic probe driver for registered mobiles: lightweight reconnect check plus
//! an occasional deep probe, feeding results back into rotation availability.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::MobileId;
use crate::registry::ClientRegistry;
use crate::rotation::RotationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

pub struct HealthChecker {
    registry: Arc<ClientRegistry>,
    rotation: Arc<RotationEngine>,
    deep_check_interval: Duration,
    deep_probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<ClientRegistry>, rotation: Arc<RotationEngine>, deep_check_interval: Duration, deep_probe_timeout: Duration) -> Self {
        Self { registry, rotation, deep_check_interval, deep_probe_timeout }
    }

    /// One full pass over every registered mobile.
    pub async fn run_once(&self) {
        let mobiles = self.registry.registered_mobiles().await;
        for mobile in mobiles {
            let status = self.check_one(&mobile, false).await;
            if status == HealthStatus::Unhealthy {
                self.registry.mark_unhealthy(&mobile).await;
            }
        }
        self.rotation.refresh_available().await;
    }

    pub async fn force_check(&self, mobile: &MobileId) -> HealthStatus {
        let status = self.check_one(mobile, true).await;
        if status == HealthStatus::Unhealthy {
            self.registry.mark_unhealthy(mobile).await;
        }
        self.rotation.refresh_available().await;
        status
    }

    async fn check_one(&self, mobile: &MobileId, force_deep: bool) -> HealthStatus {
        self.registry.touch_health_check(mobile).await;

        let client = match self.registry.get(mobile).await {
            Some(c) => c,
            None => return HealthStatus::Unhealthy,
        };

        if !client.is_connected() {
            match tokio::time::timeout(Duration::from_secs(5), client.connect()).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!(mobile = %mobile, "reconnect failed during health check");
                    return HealthStatus::Unhealthy;
                }
            }
        }

        let deep_due = force_deep
            || self
                .registry
                .last_deep_check_age(mobile)
                .await
                .map(|age| age >= self.deep_check_interval)
                .unwrap_or(true);

        if deep_due {
            match tokio::time::timeout(self.deep_probe_timeout, client.get_self()).await {
                Ok(Ok(_)) => {
                    self.registry.touch_deep_check(mobile).await;
                }
                _ => {
                    warn!(mobile = %mobile, "deep health probe failed");
                    return HealthStatus::Unhealthy;
                }
            }
        }

        info!(mobile = %mobile, "health check passed");
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::MockRemoteClient;
    use crate::registry::ClientFactory;
    use crate::rotation::RotationEngine;
    use std::sync::Arc;

    struct OneShotFactory;
    #[async_trait::async_trait]
    impl ClientFactory for OneShotFactory {
        async fn create(&self, _m: &MobileId) -> Result<crate::external::SharedRemoteClient, crate::errors::CoreError> {
            Ok(Arc::new(MockRemoteClient::always_succeeds()))
        }
    }

    fn test_registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(Arc::new(OneShotFactory), 10, Duration::from_secs(1), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn healthy_connected_client_passes() {
        let registry = test_registry();
        let rotation = Arc::new(RotationEngine::new(registry.clone(), 4, 0.3, Duration::from_secs(3600), Duration::from_secs(3600), Duration::from_secs(3600), 50));
        let mobile = MobileId::from("m1");
        registry.acquire(&mobile).await.unwrap();

        let checker = HealthChecker::new(registry, rotation, Duration::from_secs(7200), Duration::from_secs(10));
        let status = checker.force_check(&mobile).await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn missing_client_is_unhealthy() {
        let registry = test_registry();
        let rotation = Arc::new(RotationEngine::new(registry.clone(), 4, 0.3, Duration::from_secs(3600), Duration::from_secs(3600), Duration::from_secs(3600), 50));
        let checker = HealthChecker::new(registry, rotation, Duration::from_secs(7200), Duration::from_secs(10));
        let status = checker.force_check(&MobileId::from("ghost")).await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }
}
