//! Queue consumer
//!
//! Ties the lease store, the scheduler and a [`MessageHandler`] together:
//! leases messages while there is room, dispatches them, and finalizes each
//! one by commit, retry or promotion to the error store.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::heartbeat::{HeartbeatSender, LeaseRegistry};
use super::poller::MessagePoller;
use super::sweeper::Sweeper;
use crate::config::QueueConfig;
use crate::dispatch::{
    route_failure, DispatchHandler, Dispatched, FailureOutcome, HandlerContext, LeaseState,
    MessageContext, MessageHandler, PANIC_ERROR_TYPE, POISON_ERROR_TYPE,
};
use crate::error::{ConsumerError, ReceiveError};
use crate::message::{Message, MessageId};
use crate::persistence::{Dequeued, ErrorDetails, LeaseStore, StoreError};
use crate::scheduler::{panic_message, SchedulerConfig, TaskFactory, TaskOutcome, TaskScheduler};

/// Consumer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Scheduler and background loops are being set up
    Starting,
    /// Receiving and processing messages
    Running,
    /// No longer receiving; in-flight messages are finishing
    Draining,
    Stopped,
}

/// Result of one receive
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A leased message and its finalizer
    Message {
        message: Message,
        context: MessageContext,
    },

    /// A leased row whose payload could not be reconstructed
    Poison {
        context: MessageContext,
        reason: String,
    },

    /// Nothing eligible right now
    Empty,
}

/// How one message was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Committed,
    Retrying { retry: u32, delay: Duration },
    MovedToError { retries: u32 },

    /// Returned to Waiting without recording an error
    Canceled,

    /// Reclaimed by the sweeper while processing; left to the new owner
    LeaseLost,
}

impl From<FailureOutcome> for ProcessOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Retrying { retry, delay } => Self::Retrying { retry, delay },
            FailureOutcome::MovedToError { retries } => Self::MovedToError { retries },
        }
    }
}

struct Shared {
    store: Arc<dyn LeaseStore>,
    config: QueueConfig,
    handler: Arc<dyn MessageHandler>,
    scheduler: TaskScheduler,
    registry: LeaseRegistry,

    /// Stops receiving and admission
    stop: CancellationToken,

    /// Parent of every lease token; cancels running handlers
    cancel: CancellationToken,

    /// Stops heartbeat renewal and sweeping once work has drained
    background: CancellationToken,

    /// One entry per dispatched message until it is finalized
    in_flight: TaskTracker,
}

impl Shared {
    async fn receive(&self) -> Result<ReceiveOutcome, ReceiveError> {
        if self.stop.is_cancelled() {
            return Err(ReceiveError::ShuttingDown);
        }

        let filter = self
            .config
            .dequeue
            .filter(Utc::now(), self.config.heartbeat.enabled);

        Ok(match self.store.dequeue(&filter).await? {
            None => ReceiveOutcome::Empty,
            Some(Dequeued::Message(message)) => {
                let context = self.lease(message.id, message.heartbeat);
                ReceiveOutcome::Message { message, context }
            }
            Some(Dequeued::Poison {
                id,
                heartbeat,
                reason,
            }) => ReceiveOutcome::Poison {
                context: self.lease(id, heartbeat),
                reason,
            },
        })
    }

    fn lease(&self, id: MessageId, heartbeat: Option<DateTime<Utc>>) -> MessageContext {
        let lease = Arc::new(LeaseState::new(id, heartbeat, &self.cancel));
        let registration = self.registry.register(lease.clone());
        MessageContext::new(self.store.clone(), lease, Some(registration))
    }

    async fn process(
        &self,
        message: Message,
        context: MessageContext,
    ) -> Result<ProcessOutcome, StoreError> {
        let id = message.id;
        let lease = context.lease().clone();
        let handler_context = HandlerContext::new(lease.clone());

        let result = AssertUnwindSafe(self.handler.handle(&handler_context, message))
            .catch_unwind()
            .await;

        if lease.is_lost() {
            warn!(message_id = %id, "lease lost during processing, result discarded");
            context.abandon();
            return Ok(ProcessOutcome::LeaseLost);
        }

        let policy = &self.config.error_policy;
        match result {
            Ok(Ok(())) => {
                context.commit().await?;
                Ok(ProcessOutcome::Committed)
            }
            Ok(Err(err)) if err.is_canceled() || handler_context.is_cancelled() => {
                debug!(message_id = %id, error = %err, "handler canceled, returning message");
                context.rollback(None).await?;
                Ok(ProcessOutcome::Canceled)
            }
            Ok(Err(err)) => route_failure(context, &err.to_details(), err.retryable, policy)
                .await
                .map(Into::into),
            Err(panic) => {
                let reason = panic_message(&panic);
                error!(message_id = %id, panic = %reason, "handler panicked");
                route_failure(
                    context,
                    &ErrorDetails::new(PANIC_ERROR_TYPE, reason),
                    true,
                    policy,
                )
                .await
                .map(Into::into)
            }
        }
    }

    async fn route_poison(&self, context: MessageContext, reason: String) {
        let id = context.id();
        warn!(message_id = %id, %reason, "poison message received");

        let details = ErrorDetails::new(POISON_ERROR_TYPE, reason);
        if let Err(e) = route_failure(context, &details, true, &self.config.error_policy).await {
            error!(message_id = %id, error = %e, "failed to route poison message");
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        dispatcher: &DispatchHandler,
        message: Message,
        context: MessageContext,
    ) {
        let id = message.id;
        let shared = self.clone();
        let admitted = dispatcher
            .dispatch(context, move |context| async move {
                shared.process(message, context).await
            })
            .await;

        let handle = match admitted {
            Ok(handle) => handle,
            Err(reason) => {
                debug!(message_id = %id, %reason, "message not dispatched");
                return;
            }
        };

        self.in_flight.spawn(async move {
            match handle.join().await {
                TaskOutcome::Completed(Dispatched::Ran(outcome)) => {
                    debug!(message_id = %id, ?outcome, "message processed");
                }
                TaskOutcome::Completed(Dispatched::Interrupted(reason)) => {
                    debug!(message_id = %id, %reason, "message released before start");
                }
                TaskOutcome::Failed(e) => {
                    // Left Processing; the sweeper reclaims it once the lease expires
                    error!(message_id = %id, error = %e, "failed to finalize message");
                }
                TaskOutcome::Panicked(reason) => {
                    error!(message_id = %id, panic = %reason, "message processing panicked");
                }
                TaskOutcome::Canceled => {
                    warn!(message_id = %id, "message processing aborted");
                }
            }
        });
    }
}

async fn run_receive_loop(shared: Arc<Shared>, dispatcher: DispatchHandler) {
    let mut poller = MessagePoller::new(shared.config.poller.clone(), shared.stop.clone());
    let mut consecutive_errors: u32 = 0;

    loop {
        if poller.is_shutdown() {
            break;
        }

        // Lease only what can be admitted
        tokio::select! {
            _ = shared.scheduler.wait_for_room(dispatcher.group()) => {}
            _ = shared.stop.cancelled() => break,
        }

        match shared.receive().await {
            Ok(ReceiveOutcome::Message { message, context }) => {
                consecutive_errors = 0;
                poller.on_message();
                shared.dispatch(&dispatcher, message, context).await;
            }
            Ok(ReceiveOutcome::Poison { context, reason }) => {
                consecutive_errors = 0;
                poller.on_message();
                shared.route_poison(context, reason).await;
            }
            Ok(ReceiveOutcome::Empty) => {
                consecutive_errors = 0;
                poller.on_empty();
                if poller.wait().await {
                    break;
                }
            }
            Err(ReceiveError::ShuttingDown) => break,
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let delay = shared.config.receive_backoff.delay_for(consecutive_errors);
                warn!(
                    error = %e,
                    consecutive_errors,
                    delay_ms = delay.as_millis() as u64,
                    "receive failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.stop.cancelled() => break,
                }
            }
        }
    }

    shared.scheduler.unsubscribe();
    debug!("receive loop exited");
}

/// Consumes one queue with a [`MessageHandler`]
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use durable_queue::config::QueueConfig;
/// use durable_queue::dispatch::handler_fn;
/// use durable_queue::worker::QueueConsumer;
/// use durable_queue::InMemoryLeaseStore;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(InMemoryLeaseStore::new());
/// let consumer = QueueConsumer::new(
///     store,
///     QueueConfig::new("thumbnails"),
///     handler_fn(|_ctx, message| async move {
///         println!("processing {}", message.id);
///         Ok(())
///     }),
/// )?;
///
/// consumer.start().await?;
/// // ...
/// consumer.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueConsumer {
    shared: Arc<Shared>,
    status: RwLock<ConsumerStatus>,
    receive_handle: Mutex<Option<JoinHandle<()>>>,
    background_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueConsumer {
    /// Create a consumer; the configuration is validated here
    pub fn new<H: MessageHandler>(
        store: Arc<dyn LeaseStore>,
        config: QueueConfig,
        handler: H,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        let scheduler = TaskScheduler::new(config.scheduler.clone())?;

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                config,
                handler: Arc::new(handler),
                scheduler,
                registry: LeaseRegistry::new(),
                stop: CancellationToken::new(),
                cancel: CancellationToken::new(),
                background: CancellationToken::new(),
                in_flight: TaskTracker::new(),
            }),
            status: RwLock::new(ConsumerStatus::Stopped),
            receive_handle: Mutex::new(None),
            background_handles: Mutex::new(Vec::new()),
        })
    }

    /// Start the scheduler, the background loops and the receive loop
    #[instrument(skip(self), fields(queue = %self.shared.config.name))]
    pub async fn start(&self) -> Result<(), ConsumerError> {
        {
            let mut status = self.status.write();
            match *status {
                ConsumerStatus::Starting | ConsumerStatus::Running => {
                    return Err(ConsumerError::AlreadyRunning)
                }
                ConsumerStatus::Draining => return Err(ConsumerError::Stopped),
                ConsumerStatus::Stopped if self.shared.stop.is_cancelled() => {
                    return Err(ConsumerError::Stopped)
                }
                ConsumerStatus::Stopped => *status = ConsumerStatus::Starting,
            }
        }

        if let Err(e) = self.launch() {
            *self.status.write() = ConsumerStatus::Stopped;
            return Err(e);
        }

        *self.status.write() = ConsumerStatus::Running;
        info!(
            max_threads = self.shared.config.scheduler.max_threads,
            work_group = ?self.shared.config.work_group.as_ref().map(|g| &g.name),
            heartbeat = self.shared.config.heartbeat.enabled,
            "consumer started"
        );
        Ok(())
    }

    fn launch(&self) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        let config = &shared.config;

        shared.scheduler.start()?;
        let group = match &config.work_group {
            Some(group) => Some(shared.scheduler.add_work_group(
                &group.name,
                group.concurrency_level,
                group.max_queue_size,
            )?),
            None => None,
        };

        let mut background = Vec::new();
        if config.heartbeat.enabled {
            background.push(
                HeartbeatSender::new(
                    shared.store.clone(),
                    shared.registry.clone(),
                    config.heartbeat.interval,
                    shared.background.clone(),
                )
                .spawn(),
            );
        }
        if config.heartbeat.enabled || config.expiration.enabled {
            background.push(
                Sweeper::new(
                    shared.store.clone(),
                    config.heartbeat.clone(),
                    config.expiration.clone(),
                    shared.background.clone(),
                )
                .spawn(),
            );
        }
        *self.background_handles.lock() = background;

        shared.scheduler.subscribe();
        let dispatcher = DispatchHandler::new(
            TaskFactory::new(shared.scheduler.clone()),
            group,
            shared.stop.clone(),
        );
        *self.receive_handle.lock() = Some(tokio::spawn(run_receive_loop(shared.clone(), dispatcher)));
        Ok(())
    }

    /// Stop receiving and drain in-flight messages
    ///
    /// Handlers still running after `shutdown_timeout` are canceled; the
    /// scheduler aborts whatever remains after its own drain timeout.
    /// Canceled messages go back to Waiting.
    #[instrument(skip(self), fields(queue = %self.shared.config.name))]
    pub async fn shutdown(&self) -> Result<(), ConsumerError> {
        {
            let mut status = self.status.write();
            if matches!(*status, ConsumerStatus::Stopped | ConsumerStatus::Draining) {
                return Ok(());
            }
            *status = ConsumerStatus::Draining;
        }

        let shared = &self.shared;
        info!(in_flight = shared.in_flight.len(), "initiating graceful shutdown");
        shared.stop.cancel();

        let receive = self.receive_handle.lock().take();
        if let Some(handle) = receive {
            if let Err(e) = handle.await {
                error!(error = %e, "receive loop ended abnormally");
            }
        }

        shared.in_flight.close();
        let drained = tokio::time::timeout(shared.config.shutdown_timeout, shared.in_flight.wait())
            .await
            .is_ok();
        let remaining = shared.in_flight.len();
        if !drained {
            warn!(remaining, "shutdown timeout reached, canceling in-flight handlers");
        }

        shared.cancel.cancel();
        shared.scheduler.dispose().await;
        shared.in_flight.wait().await;

        shared.background.cancel();
        let background: Vec<_> = self.background_handles.lock().drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                error!(error = %e, "background loop ended abnormally");
            }
        }

        *self.status.write() = ConsumerStatus::Stopped;
        info!("consumer stopped");

        if drained {
            Ok(())
        } else {
            Err(ConsumerError::ShutdownTimeout { remaining })
        }
    }

    /// Lease the next eligible message without processing it
    ///
    /// The returned context must be finalized by the caller. Its lease is
    /// renewed by the heartbeat loop while the consumer runs.
    pub async fn receive_message(&self) -> Result<ReceiveOutcome, ReceiveError> {
        self.shared.receive().await
    }

    /// Run the handler on a received message and finalize it
    pub async fn process(
        &self,
        message: Message,
        context: MessageContext,
    ) -> Result<ProcessOutcome, StoreError> {
        self.shared.process(message, context).await
    }

    pub fn status(&self) -> ConsumerStatus {
        *self.status.read()
    }

    /// Dispatched messages not yet finalized
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Leases currently held (dispatched or received manually)
    pub fn leases(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        self.shared.scheduler.config()
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.shared.store
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        // Background loops hold the shared state; stop them with the consumer
        self.shared.stop.cancel();
        self.shared.background.cancel();
    }
}
