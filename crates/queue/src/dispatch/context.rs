//! Per-message lease state and the single-use finalizer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handler::Interrupted;
use crate::message::MessageId;
use crate::persistence::{ErrorDetails, LeaseStore, StoreError};
use crate::worker::LeaseRegistration;

/// Lease state shared between a message's context and the heartbeat sender
///
/// The heartbeat lock is held across store calls that depend on the last
/// known heartbeat, so renewals and finalization never interleave.
#[derive(Debug)]
pub struct LeaseState {
    id: MessageId,
    heartbeat: tokio::sync::Mutex<Option<DateTime<Utc>>>,
    lost: AtomicBool,
    finalized: AtomicBool,

    /// Cancelled on lease loss or on consumer cancellation
    cancel: CancellationToken,
}

impl LeaseState {
    pub fn new(
        id: MessageId,
        heartbeat: Option<DateTime<Utc>>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id,
            heartbeat: tokio::sync::Mutex::new(heartbeat),
            lost: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            cancel: parent.child_token(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Last heartbeat written by this consumer
    pub async fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.heartbeat.lock().await
    }

    pub(crate) fn heartbeat_lock(
        &self,
    ) -> &tokio::sync::Mutex<Option<DateTime<Utc>>> {
        &self.heartbeat
    }

    /// The store no longer has this lease; work on the message must stop
    pub fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            warn!(message_id = %self.id, "lease lost");
        }
        self.cancel.cancel();
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    fn set_finalized(&self) {
        self.finalized.store(true, Ordering::SeqCst);
    }

    /// Token cancelled when the lease is lost or processing is cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Finalizer for one leased message
///
/// Exactly one of [`commit`](Self::commit), [`rollback`](Self::rollback) or
/// [`move_to_error`](Self::move_to_error) consumes the context. A context
/// dropped without being finalized rolls the message back on a best-effort
/// basis and logs a warning.
pub struct MessageContext {
    store: Arc<dyn LeaseStore>,
    lease: Arc<LeaseState>,
    finalized: bool,
    _registration: Option<LeaseRegistration>,
}

impl MessageContext {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        lease: Arc<LeaseState>,
        registration: Option<LeaseRegistration>,
    ) -> Self {
        Self {
            store,
            lease,
            finalized: false,
            _registration: registration,
        }
    }

    pub fn id(&self) -> MessageId {
        self.lease.id()
    }

    pub fn lease(&self) -> &Arc<LeaseState> {
        &self.lease
    }

    /// Increment the retry count for `error_type`
    pub async fn record_error(&self, error_type: &str) -> Result<u32, StoreError> {
        self.store.record_error(self.id(), error_type).await
    }

    /// Delete the message; processing succeeded
    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.finalized = true;
        let _heartbeat = self.lease.heartbeat_lock().lock().await;
        self.lease.set_finalized();

        self.store.commit(self.id()).await?;
        debug!(message_id = %self.id(), "committed");
        Ok(())
    }

    /// Return the message to Waiting, optionally delayed
    ///
    /// Guarded by the last known heartbeat so a lease reclaimed and re-leased
    /// elsewhere is left alone. Returns whether the message went back.
    pub async fn rollback(mut self, delay: Option<Duration>) -> Result<bool, StoreError> {
        self.finalized = true;
        let heartbeat = self.lease.heartbeat_lock().lock().await;
        self.lease.set_finalized();

        let affected = self.store.rollback(self.id(), *heartbeat, delay).await?;
        debug!(message_id = %self.id(), affected, ?delay, "rolled back");
        Ok(affected > 0)
    }

    /// Promote the message to the error store
    pub async fn move_to_error(mut self, details: &ErrorDetails) -> Result<(), StoreError> {
        self.finalized = true;
        let _heartbeat = self.lease.heartbeat_lock().lock().await;
        self.lease.set_finalized();

        self.store.move_to_error(self.id(), details).await
    }

    /// Finalize after an interruption
    ///
    /// A cancelled message goes back to Waiting without recording an error.
    /// A lost lease belongs to someone else, so nothing is written.
    pub async fn release(self, reason: &Interrupted) -> Result<(), StoreError> {
        match reason {
            Interrupted::LeaseLost => {
                self.abandon();
                Ok(())
            }
            Interrupted::Canceled | Interrupted::Scheduler(_) => {
                self.rollback(None).await.map(|_| ())
            }
        }
    }

    /// Give up the message without touching the store
    pub fn abandon(mut self) {
        self.finalized = true;
        self.lease.set_finalized();
        debug!(message_id = %self.id(), "abandoned lease");
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("id", &self.id())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Drop for MessageContext {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        self.lease.set_finalized();

        if self.lease.is_lost() {
            return;
        }

        warn!(message_id = %self.id(), "message context dropped without finalization, rolling back");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(message_id = %self.id(), "no runtime available, message left to the sweeper");
            return;
        };

        let store = self.store.clone();
        let lease = self.lease.clone();
        runtime.spawn(async move {
            let heartbeat = lease.heartbeat_lock().lock().await;
            if let Err(e) = store.rollback(lease.id(), *heartbeat, None).await {
                warn!(message_id = %lease.id(), error = %e, "best-effort rollback failed");
            }
        });
    }
}
