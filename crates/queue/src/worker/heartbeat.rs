//! Lease renewal for in-flight messages

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::dispatch::LeaseState;
use crate::message::{MessageId, MessageStatus};
use crate::persistence::{HeartbeatResult, LeaseStore, StoreError};

/// Leases currently held by one consumer
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    leases: Arc<DashMap<MessageId, Arc<LeaseState>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `lease` until the returned registration is dropped
    ///
    /// A message leased again while an older lease on it is still tracked
    /// was reclaimed in between, so the older lease is marked lost.
    pub fn register(&self, lease: Arc<LeaseState>) -> LeaseRegistration {
        let id = lease.id();
        if let Some(previous) = self.leases.insert(id, lease.clone()) {
            previous.mark_lost();
        }
        LeaseRegistration {
            leases: self.leases.clone(),
            lease,
        }
    }

    pub fn get(&self, id: MessageId) -> Option<Arc<LeaseState>> {
        self.leases.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Leases held right now; the map is not locked while they are renewed
    pub fn snapshot(&self) -> Vec<Arc<LeaseState>> {
        self.leases.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Removes its lease from the registry when dropped
#[derive(Debug)]
pub struct LeaseRegistration {
    leases: Arc<DashMap<MessageId, Arc<LeaseState>>>,
    lease: Arc<LeaseState>,
}

impl Drop for LeaseRegistration {
    fn drop(&mut self) {
        // Only our own entry; a newer lease on the same message may have replaced it
        self.leases
            .remove_if(&self.lease.id(), |_, current| Arc::ptr_eq(current, &self.lease));
    }
}

/// Periodically renews every registered lease
///
/// A renewal that finds the message no longer Processing marks the lease
/// lost, which cancels the handler working on it.
pub struct HeartbeatSender {
    store: Arc<dyn LeaseStore>,
    registry: LeaseRegistry,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HeartbeatSender {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        registry: LeaseRegistry,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            interval,
            shutdown,
        }
    }

    /// Renew every registered lease once, returning how many were renewed
    pub async fn renew_all(&self) -> usize {
        let mut renewed = 0;
        for lease in self.registry.snapshot() {
            match self.renew(&lease).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => {
                    // Transient: the next tick retries, the sweeper decides on expiry
                    error!(message_id = %lease.id(), error = %e, "heartbeat failed");
                }
            }
        }
        renewed
    }

    /// Renew one lease under its heartbeat lock
    async fn renew(&self, lease: &LeaseState) -> Result<bool, StoreError> {
        let mut heartbeat = lease.heartbeat_lock().lock().await;
        if lease.is_finalized() || lease.is_lost() {
            return Ok(false);
        }

        match self
            .store
            .send_heartbeat(lease.id(), MessageStatus::Processing)
            .await?
        {
            HeartbeatResult::Renewed(at) => {
                trace!(message_id = %lease.id(), %at, "lease renewed");
                *heartbeat = Some(at);
                Ok(true)
            }
            HeartbeatResult::LeaseLost => {
                lease.mark_lost();
                Ok(false)
            }
        }
    }

    /// Run the renewal loop until shutdown
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.renew_all().await;
                    }
                    _ = self.shutdown.cancelled() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("heartbeat loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::message::NewMessage;
    use crate::persistence::{DequeueFilter, Dequeued, InMemoryLeaseStore};

    async fn lease(store: &InMemoryLeaseStore) -> Arc<LeaseState> {
        store.send(NewMessage::new(vec![])).await.unwrap();
        let filter = DequeueFilter::new(Utc::now()).with_heartbeat(true);
        let Some(Dequeued::Message(m)) = store.dequeue(&filter).await.unwrap() else {
            panic!("expected a message");
        };
        Arc::new(LeaseState::new(m.id, m.heartbeat, &CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_registration_drop_unregisters() {
        let store = InMemoryLeaseStore::new();
        let registry = LeaseRegistry::new();
        let lease = lease(&store).await;

        let registration = registry.register(lease.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(lease.id()).is_some());

        drop(registration);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_of_superseded_lease_keeps_newer_one() {
        let store = InMemoryLeaseStore::new();
        let registry = LeaseRegistry::new();
        let old = lease(&store).await;
        let newer = Arc::new(LeaseState::new(old.id(), None, &CancellationToken::new()));

        let old_registration = registry.register(old.clone());
        let _newer_registration = registry.register(newer.clone());
        assert!(old.is_lost());
        assert!(!newer.is_lost());

        drop(old_registration);
        let tracked = registry.get(old.id()).unwrap();
        assert!(Arc::ptr_eq(&tracked, &newer));
    }

    #[tokio::test]
    async fn test_renewal_advances_heartbeat() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let registry = LeaseRegistry::new();
        let lease = lease(&store).await;
        let before = lease.last_heartbeat().await;
        let _registration = registry.register(lease.clone());

        let sender = HeartbeatSender::new(
            store.clone(),
            registry,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert_eq!(sender.renew_all().await, 1);

        let after = lease.last_heartbeat().await;
        assert!(after > before);
        let stored = store.get_message(lease.id()).await.unwrap().unwrap();
        assert_eq!(stored.heartbeat, after);
    }

    #[tokio::test]
    async fn test_reclaimed_lease_is_marked_lost() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let registry = LeaseRegistry::new();
        let lease = lease(&store).await;
        let token = lease.cancellation_token();
        let _registration = registry.register(lease.clone());

        let heartbeat = lease.last_heartbeat().await.unwrap();
        assert_eq!(store.reset_lease(lease.id(), heartbeat, None).await.unwrap(), 1);

        let sender = HeartbeatSender::new(
            store.clone(),
            registry,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert_eq!(sender.renew_all().await, 0);
        assert!(lease.is_lost());
        assert!(token.is_cancelled());
    }
}
