//! Reclaim of abandoned leases and cleanup of expired messages

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::{ExpirationConfig, HeartbeatConfig};
use crate::message::offset_before;
use crate::persistence::{LeaseStore, StoreError};

/// Periodically resets leases whose heartbeat stopped advancing
///
/// Every reset is a compare-and-swap on the heartbeat observed by the scan,
/// so a lease renewed between scan and reset is left alone and concurrent
/// sweepers reclaim each lease at most once.
pub struct Sweeper {
    store: Arc<dyn LeaseStore>,
    heartbeat: HeartbeatConfig,
    expiration: ExpirationConfig,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        heartbeat: HeartbeatConfig,
        expiration: ExpirationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            heartbeat,
            expiration,
            shutdown,
        }
    }

    /// Reclaim leases that timed out as of now
    pub async fn reclaim_expired(&self) -> Result<usize, StoreError> {
        self.reclaim_dead_before(offset_before(Utc::now(), self.heartbeat.timeout))
            .await
    }

    /// Reclaim leases whose last heartbeat is older than `dead_before`
    #[instrument(skip(self))]
    pub async fn reclaim_dead_before(&self, dead_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = self.store.find_expired_leases(dead_before).await?;
        let delay = (!self.heartbeat.reclaim_delay.is_zero()).then_some(self.heartbeat.reclaim_delay);

        let mut reclaimed = 0;
        for lease in expired {
            let affected = self
                .store
                .reset_lease(lease.id, lease.heartbeat, delay)
                .await?;
            if affected > 0 {
                reclaimed += 1;
            } else {
                debug!(message_id = %lease.id, "lease renewed or reclaimed elsewhere, skipped");
            }
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Delete Waiting messages whose expiration passed
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let deleted = self.store.delete_expired(Utc::now()).await?;
        if deleted > 0 {
            info!(count = deleted, "deleted expired messages");
        }
        Ok(deleted)
    }

    /// Run both loops until shutdown; disabled loops never tick
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reclaim = self
                .heartbeat
                .enabled
                .then(|| ticker(self.heartbeat.sweep_interval));
            let mut purge = self
                .expiration
                .enabled
                .then(|| ticker(self.expiration.interval));

            loop {
                tokio::select! {
                    _ = tick(&mut reclaim) => {
                        if let Err(e) = self.reclaim_expired().await {
                            error!(error = %e, "lease reclaim failed");
                        }
                    }
                    _ = tick(&mut purge) => {
                        if let Err(e) = self.purge_expired().await {
                            error!(error = %e, "expired message cleanup failed");
                        }
                    }
                    _ = self.shutdown.cancelled() => {
                        debug!("sweeper: shutdown requested");
                        break;
                    }
                }
            }

            debug!("sweeper exited");
        })
    }
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::message::{MessageStatus, NewMessage};
    use crate::persistence::{DequeueFilter, InMemoryLeaseStore};

    fn sweeper(store: Arc<InMemoryLeaseStore>, reclaim_delay: Duration) -> Sweeper {
        let heartbeat = HeartbeatConfig {
            reclaim_delay,
            ..HeartbeatConfig::default()
        };
        Sweeper::new(
            store,
            heartbeat,
            ExpirationConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_reclaims_dead_lease() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let id = store.send(NewMessage::new(vec![])).await.unwrap().id();
        store.dequeue(&DequeueFilter::new(Utc::now())).await.unwrap();

        let sweeper = sweeper(store.clone(), Duration::ZERO);

        // Fresh lease is not dead yet
        assert_eq!(sweeper.reclaim_expired().await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(sweeper.reclaim_dead_before(later).await.unwrap(), 1);

        let message = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Waiting);
        assert_eq!(message.heartbeat, None);

        // Nothing left to reclaim
        assert_eq!(sweeper.reclaim_dead_before(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_delay_pushes_process_time() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let id = store.send(NewMessage::new(vec![])).await.unwrap().id();
        store.dequeue(&DequeueFilter::new(Utc::now())).await.unwrap();

        let sweeper = sweeper(store.clone(), Duration::from_secs(60));
        let later = Utc::now() + chrono::Duration::seconds(5);
        sweeper.reclaim_dead_before(later).await.unwrap();

        let message = store.get_message(id).await.unwrap().unwrap();
        assert!(message.queue_process_time > Utc::now() + chrono::Duration::seconds(30));
        assert!(store
            .dequeue(&DequeueFilter::new(Utc::now()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store
            .send(NewMessage::new(vec![]).with_expiration(Duration::from_millis(1)))
            .await
            .unwrap();
        store.send(NewMessage::new(vec![])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let sweeper = sweeper(store.clone(), Duration::ZERO);
        assert_eq!(sweeper.purge_expired().await.unwrap(), 1);
        assert_eq!(store.count(None).await.unwrap(), 1);
    }
}
