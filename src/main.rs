use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tracing::{info, warn};

use promo_control::{AccountStore, ChannelStore, Config, CoreError, MobileId, Supervisor, TemplateStore, WebhookNotifier};
use promo_control::external::{AccountRecord, ChannelPatch, Notifier, NullNotifier, SharedRemoteClient};
use promo_control::registry::ClientFactory;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            warn!("failed to load .env file: {}", e);
        }
    } else {
        info!("loaded environment variables from .env file");
    }

    let config = Config::load()?;
    promo_control::setup_logging(&config.log_level)?;

    info!("starting promo-control v{}", env!("CARGO_PKG_VERSION"));

    #[cfg(debug_assertions)]
    warn!("running in DEBUG mode - rebuild with --release for production");

    info!(
        active_slots = config.active_slots,
        promotion_interval_secs = config.promotion_interval_secs,
        "configuration loaded"
    );

    let notifier: Arc<dyn Notifier> = match &config.notifier_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NullNotifier),
    };

    let channel_store: Arc<dyn ChannelStore> = Arc::new(InMemoryChannelStore::default());
    let template_store: Arc<dyn TemplateStore> = Arc::new(EmptyTemplateStore);
    let account_store: Arc<dyn AccountStore> = Arc::new(EnvAccountStore);
    let factory: Arc<dyn ClientFactory> = Arc::new(UnconfiguredClientFactory);

    let supervisor = Arc::new(Supervisor::new(config, factory, channel_store, template_store, account_store, notifier));
    supervisor.start().await?;

    info!("promo-control is running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("received shutdown signal");

    supervisor.stop().await;
    info!("promo-control stopped");
    Ok(())
}

/// Real deployments supply a `ClientFactory` backed by their own MTProto session
/// management; this crate treats the transport as opaque.
struct UnconfiguredClientFactory;

#[async_trait]
impl ClientFactory for UnconfiguredClientFactory {
    async fn create(&self, mobile: &MobileId) -> Result<SharedRemoteClient, CoreError> {
        Err(CoreError::AccountNotFound(format!(
            "no RemoteClient factory configured for {mobile}; link promo-control as a library and provide one"
        )))
    }
}

/// Minimal in-process `ChannelStore` so the binary runs standalone; production
/// deployments back this with the same database the rest of the product uses.
#[derive(Default)]
struct InMemoryChannelStore {
    channels: tokio::sync::Mutex<HashMap<promo_control::ChannelId, promo_control::ChannelMeta>>,
}

#[async_trait]
impl ChannelStore for InMemoryChannelStore {
    async fn find_one(&self, id: &promo_control::ChannelId) -> Result<Option<promo_control::ChannelMeta>> {
        Ok(self.channels.lock().await.get(id).cloned())
    }

    async fn upsert(&self, meta: promo_control::ChannelMeta) -> Result<()> {
        self.channels.lock().await.insert(meta.channel_id.clone(), meta);
        Ok(())
    }

    async fn update(&self, id: &promo_control::ChannelId, patch: ChannelPatch) -> Result<()> {
        if let Some(meta) = self.channels.lock().await.get_mut(id) {
            if let Some(t) = patch.last_message_time {
                meta.last_message_time = Some(t);
            }
            if let Some(b) = patch.banned {
                meta.banned = b;
            }
        }
        Ok(())
    }

    async fn remove_from_available_msgs(&self, id: &promo_control::ChannelId, variant_index: &str) -> Result<()> {
        if let Some(meta) = self.channels.lock().await.get_mut(id) {
            meta.available_msgs.retain(|v| v != variant_index);
        }
        Ok(())
    }

    async fn active_channels(&self, limit: usize, skip: usize, exclude_ids: &[promo_control::ChannelId]) -> Result<Vec<promo_control::ChannelMeta>> {
        let guard = self.channels.lock().await;
        let mut all: Vec<_> = guard.values().filter(|c| !c.banned && !exclude_ids.contains(&c.channel_id)).cloned().collect();
        all.sort_by(|a, b| b.participants_count.cmp(&a.participants_count));
        Ok(all.into_iter().skip(skip).take(limit).collect())
    }
}

struct EmptyTemplateStore;

#[async_trait]
impl TemplateStore for EmptyTemplateStore {
    async fn find_one(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Reads a candidate mobile pool from `PROMOTE_MOBILES` (comma-separated) so the
/// binary has something to rotate over without a full account database wired in.
struct EnvAccountStore;

#[async_trait]
impl AccountStore for EnvAccountStore {
    async fn get_active_clients(&self) -> Result<Vec<AccountRecord>> {
        let mobiles = std::env::var("PROMOTE_MOBILES").unwrap_or_default();
        let promote_mobiles: Vec<MobileId> = mobiles.split(',').filter(|s| !s.is_empty()).map(MobileId::from).collect();
        if promote_mobiles.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![AccountRecord { client_id: "env".to_string(), promote_mobiles, days_left: 0 }])
    }

    async fn mark_expired(&self, mobile: &MobileId) -> Result<()> {
        warn!(%mobile, "account marked expired (no-op: EnvAccountStore has no backing store)");
        Ok(())
    }
}
