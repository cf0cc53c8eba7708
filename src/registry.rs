//! Owns live `RemoteClient` connections keyed by mobile, with single-flight
//! creation so concurrent callers never race to connect the same mobile twice.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{ActiveConnection, MobileId};
use crate::errors::{CoreError, PermanentFailure, TransportError};
use crate::external::SharedRemoteClient;

/// Builds a fresh `RemoteClient` for a mobile. Production wires this to whatever
/// session-authentication layer owns MTProto credentials; out of scope here.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, mobile: &MobileId) -> Result<SharedRemoteClient, CoreError>;
}

pub struct ClientRegistry {
    connections: RwLock<HashMap<MobileId, ActiveConnection>>,
    creation_locks: RwLock<HashMap<MobileId, Arc<Mutex<()>>>>,
    factory: Arc<dyn ClientFactory>,
    max_connections: usize,
    connection_timeout: std::time::Duration,
    disconnect_timeout: std::time::Duration,
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, max_connections: usize, connection_timeout: std::time::Duration, disconnect_timeout: std::time::Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            creation_locks: RwLock::new(HashMap::new()),
            factory,
            max_connections,
            connection_timeout,
            disconnect_timeout,
        }
    }

    async fn lock_for(&self, mobile: &MobileId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.creation_locks.read().await.get(mobile) {
            return lock.clone();
        }
        let mut guard = self.creation_locks.write().await;
        guard.entry(mobile.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Return an existing healthy connection, else create one (single-flight per mobile).
    pub async fn acquire(&self, mobile: &MobileId) -> Result<SharedRemoteClient, CoreError> {
        if let Some(client) = self.get(mobile).await {
            return Ok(client);
        }

        let lock = self.lock_for(mobile).await;
        let _guard = lock.lock().await;

        // Re-check: another caller may have created it while we waited for the lock.
        if let Some(client) = self.get(mobile).await {
            return Ok(client);
        }

        {
            let connections = self.connections.read().await;
            if connections.len() >= self.max_connections {
                return Err(CoreError::LimitReached(self.max_connections));
            }
        }

        let client = self.factory.create(mobile).await?;
        let connect = tokio::time::timeout(self.connection_timeout, client.connect()).await;
        match connect {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(classify_connect_failure(e)),
            Err(_) => return Err(CoreError::Transport(TransportError::Timeout)),
        }

        let entry = ActiveConnection::new(mobile.clone(), client.clone());
        self.connections.write().await.insert(mobile.clone(), entry);
        crate::log_mobile_operation!(info, mobile, Uuid::new_v4(), "acquire");
        Ok(client)
    }

    pub async fn get(&self, mobile: &MobileId) -> Option<SharedRemoteClient> {
        let connections = self.connections.read().await;
        connections.get(mobile).filter(|c| c.is_active).map(|c| c.client.clone())
    }

    pub async fn release(&self, mobile: &MobileId) {
        let client = {
            let mut connections = self.connections.write().await;
            connections.remove(mobile).map(|mut c| {
                c.is_active = false;
                c.client
            })
        };
        if let Some(client) = client {
            match tokio::time::timeout(self.disconnect_timeout, client.disconnect()).await {
                Ok(Ok(())) => crate::log_mobile_operation!(info, mobile, Uuid::new_v4(), "release"),
                Ok(Err(e)) => warn!(mobile = %mobile, error = %e, "disconnect returned an error, evicting anyway"),
                Err(_) => warn!(mobile = %mobile, "disconnect timed out, evicting anyway"),
            }
        }
    }

    pub async fn release_all(&self) {
        let mobiles: Vec<MobileId> = self.connections.read().await.keys().cloned().collect();
        let futures = mobiles.iter().map(|m| self.release(m));
        futures::future::join_all(futures).await;
    }

    pub async fn health_map(&self) -> HashMap<MobileId, bool> {
        let connections = self.connections.read().await;
        connections.iter().map(|(m, c)| (m.clone(), c.is_active && c.client.is_connected())).collect()
    }

    pub async fn mark_unhealthy(&self, mobile: &MobileId) {
        if let Some(conn) = self.connections.write().await.get_mut(mobile) {
            conn.is_active = false;
        }
    }

    pub async fn touch_health_check(&self, mobile: &MobileId) {
        if let Some(conn) = self.connections.write().await.get_mut(mobile) {
            conn.last_health_check = std::time::Instant::now();
        }
    }

    pub async fn touch_deep_check(&self, mobile: &MobileId) {
        if let Some(conn) = self.connections.write().await.get_mut(mobile) {
            conn.last_deep_check = std::time::Instant::now();
        }
    }

    pub async fn last_deep_check_age(&self, mobile: &MobileId) -> Option<std::time::Duration> {
        self.connections.read().await.get(mobile).map(|c| c.last_deep_check.elapsed())
    }

    pub async fn registered_mobiles(&self) -> Vec<MobileId> {
        self.connections.read().await.keys().cloned().collect()
    }
}

fn classify_connect_failure(err: TransportError) -> CoreError {
    CoreError::Transport(err)
}

/// Convert a known-permanent transport error string into a `PermanentFailure` the
/// caller should evict the mobile for. Classification lives here so both the registry
/// and the scheduler agree on what "permanent" means.
pub fn classify_permanent(message: &str) -> Option<PermanentFailure> {
    match message {
        "USER_DEACTIVATED" | "USER_DEACTIVATED_BAN" => Some(PermanentFailure::UserDeactivated),
        "AUTH_KEY_UNREGISTERED" => Some(PermanentFailure::AuthKeyUnregistered),
        "SESSION_REVOKED" => Some(PermanentFailure::SessionRevoked),
        "PHONE_NUMBER_BANNED" => Some(PermanentFailure::PhoneBanned),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::MockRemoteClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFactory {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClientFactory for CountingFactory {
        async fn create(&self, _mobile: &MobileId) -> Result<SharedRemoteClient, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockRemoteClient::always_succeeds()))
        }
    }

    fn registry(factory: Arc<CountingFactory>) -> ClientRegistry {
        ClientRegistry::new(factory, 100, Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn acquire_creates_once_for_concurrent_callers() {
        let factory = Arc::new(CountingFactory { calls: AtomicUsize::new(0) });
        let registry = Arc::new(registry(factory.clone()));
        let mobile = MobileId::from("m1");

        let r1 = registry.clone();
        let m1 = mobile.clone();
        let r2 = registry.clone();
        let m2 = mobile.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.acquire(&m1).await }),
            tokio::spawn(async move { r2.acquire(&m2).await }),
        );
        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_evicts_and_is_idempotent() {
        let factory = Arc::new(CountingFactory { calls: AtomicUsize::new(0) });
        let registry = registry(factory);
        let mobile = MobileId::from("m1");
        registry.acquire(&mobile).await.unwrap();
        assert!(registry.get(&mobile).await.is_some());
        registry.release(&mobile).await;
        assert!(registry.get(&mobile).await.is_none());
        registry.release(&mobile).await; // idempotent
    }

    #[tokio::test]
    async fn acquire_rejects_past_capacity() {
        let factory = Arc::new(CountingFactory { calls: AtomicUsize::new(0) });
        let registry = ClientRegistry::new(factory, 1, Duration::from_secs(1), Duration::from_secs(1));
        registry.acquire(&MobileId::from("m1")).await.unwrap();
        let err = registry.acquire(&MobileId::from("m2")).await.unwrap_err();
        assert!(matches!(err, CoreError::LimitReached(1)));
    }
}
