//! Atomic per-mobile JSON snapshots: serialize to a tempfile, then rename over the
//! target so a crash mid-write never corrupts a prior snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{ChannelId, MobileId, PromotionResult, SessionState};
use crate::session::SessionStore;

#[derive(Debug, Serialize, Deserialize)]
struct MobileStats {
    message_count: u64,
    success_count: u64,
    failed_count: u64,
    days_left: i32,
    last_checked_time: i64,
    sleep_time: i64,
    release_time: i64,
    last_message_time: i64,
    converted: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    mobile_stats: MobileStats,
    promotion_results: HashMap<ChannelId, PromotionResult>,
    saved_at: String,
    version: String,
}

pub struct StatePersistence {
    state_dir: PathBuf,
}

impl StatePersistence {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: state_dir.into() }
    }

    fn path_for(&self, mobile: &MobileId) -> PathBuf {
        self.state_dir.join(format!("mobileStats-{}.json", mobile.0))
    }

    /// Atomic write: serialize to a tempfile in the same directory, then rename over
    /// the target so a crash mid-write never corrupts a prior snapshot.
    pub async fn save(&self, mobile: &MobileId, state: &SessionState) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;

        let snapshot = Snapshot {
            mobile_stats: MobileStats {
                message_count: state.message_count,
                success_count: state.success_count,
                failed_count: state.failed_count,
                days_left: state.days_left,
                last_checked_time: state.last_checked_time,
                sleep_time: state.sleep_time,
                release_time: state.release_time,
                last_message_time: state.last_message_time,
                converted: state.converted,
            },
            promotion_results: state.promotion_results.clone(),
            saved_at: Utc::now().to_rfc3339(),
            version: "1.0".to_string(),
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        let target = self.path_for(mobile);

        let dir = self.state_dir.clone();
        let target_clone = target.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            use std::io::Write;
            tmp.write_all(json.as_bytes())?;
            tmp.persist(&target_clone)?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    /// Missing file is normal (first run); parse errors are logged and treated as missing.
    pub async fn load(&self, mobile: &MobileId) -> Option<SessionState> {
        let path = self.path_for(mobile);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return None,
        };

        match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) => {
                let mut state = SessionState::default();
                state.message_count = snapshot.mobile_stats.message_count;
                state.success_count = snapshot.mobile_stats.success_count;
                state.failed_count = snapshot.mobile_stats.failed_count;
                state.days_left = snapshot.mobile_stats.days_left;
                state.last_checked_time = snapshot.mobile_stats.last_checked_time;
                state.sleep_time = snapshot.mobile_stats.sleep_time;
                state.release_time = snapshot.mobile_stats.release_time;
                state.last_message_time = snapshot.mobile_stats.last_message_time;
                state.converted = snapshot.mobile_stats.converted;
                state.promotion_results = snapshot.promotion_results;
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot failed to parse, treating as missing");
                None
            }
        }
    }

    /// Autosave across all sessions in parallel; individual failures are logged, never
    /// propagated.
    pub async fn save_all(&self, store: &SessionStore) {
        let mobiles = store.mobiles().await;
        let futures = mobiles.into_iter().map(|mobile| async move {
            if let Some(state) = store.snapshot(&mobile).await {
                if let Err(e) = self.save(&mobile, &state).await {
                    warn!(mobile = %mobile, error = %e, "autosave failed");
                }
            }
        });
        futures::future::join_all(futures).await;
        info!("autosave pass complete");
    }

    pub async fn load_all(&self, store: &SessionStore, mobiles: &[MobileId]) {
        for mobile in mobiles {
            if let Some(state) = self.load(mobile).await {
                store.insert(mobile.clone(), state).await;
            }
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_counters_and_results() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let mobile = MobileId::from("m1");

        let mut state = SessionState::default();
        state.success_count = 7;
        state.days_left = 2;
        state.promotion_results.insert(
            ChannelId("c1".into()),
            PromotionResult { success: true, count: 3, error_message: None, last_check_timestamp: 12345 },
        );

        persistence.save(&mobile, &state).await.unwrap();
        let loaded = persistence.load(&mobile).await.unwrap();
        assert_eq!(loaded.success_count, 7);
        assert_eq!(loaded.days_left, 2);
        assert_eq!(loaded.promotion_results.get(&ChannelId("c1".into())).unwrap().count, 3);
    }

    #[tokio::test]
    async fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        assert!(persistence.load(&MobileId::from("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let mobile = MobileId::from("m1");
        tokio::fs::write(persistence.path_for(&mobile), b"not json").await.unwrap();
        assert!(persistence.load(&mobile).await.is_none());
    }
}
