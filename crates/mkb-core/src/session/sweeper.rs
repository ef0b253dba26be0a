//! Background eviction of idle plan sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SessionStore;

/// How often the sweeper runs and how long a session may sit idle.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub ttl: Duration,
}

impl SweeperConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            ttl: Self::DEFAULT_TTL,
        }
    }
}

/// Spawn the periodic sweep task. It runs until `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    config: SweeperConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let threshold =
        chrono::Duration::from_std(config.ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be stale yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("session sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.sweep_expired(Utc::now(), threshold).await;
                    if removed > 0 {
                        tracing::info!(removed, "evicted idle plan sessions");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweeper_evicts_idle_sessions_and_stops_on_cancel() {
        let store = Arc::new(SessionStore::new());
        let session = store.create("u1", "q", serde_json::Value::Null).await;

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            Arc::clone(&store),
            SweeperConfig {
                interval: Duration::from_millis(20),
                ttl: Duration::from_millis(1),
            },
            cancel.clone(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(session.id()).await.is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "sweeper did not evict the idle session"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_keeps_sessions_within_ttl() {
        let store = Arc::new(SessionStore::new());
        let session = store.create("u1", "q", serde_json::Value::Null).await;

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            Arc::clone(&store),
            SweeperConfig {
                interval: Duration::from_millis(10),
                ttl: Duration::from_secs(3600),
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(session.id()).await.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn default_config_is_hourly_with_one_day_ttl() {
        let cfg = SweeperConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(3600));
        assert_eq!(cfg.ttl, Duration::from_secs(86_400));
    }
}
