//! Message handlers and the dispatch loop that admits them into the scheduler

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::context::{LeaseState, MessageContext};
use super::failure::POISON_ERROR_TYPE;
use crate::message::{Message, MessageId};
use crate::persistence::ErrorDetails;
use crate::scheduler::{Admission, SchedulerError, TaskFactory, TaskHandle, WorkGroup};

/// Error type for handler failures
///
/// `error_type` is the key retry counts are tracked under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    pub message: String,

    /// Error type/code for retry bookkeeping
    pub error_type: String,

    /// Non-retryable errors move the message to the error store immediately
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    pub const DEFAULT_TYPE: &'static str = "HandlerError";
    pub const CANCELED_TYPE: &'static str = "Canceled";

    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Self::DEFAULT_TYPE.to_string(),
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    /// The handler stopped because it was asked to
    pub fn canceled() -> Self {
        Self::retryable("canceled").with_type(Self::CANCELED_TYPE)
    }

    /// The payload cannot be decoded; retrying will not help
    pub fn poison(message: impl Into<String>) -> Self {
        Self::retryable(message).with_type(POISON_ERROR_TYPE)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.error_type == Self::CANCELED_TYPE
    }

    pub fn to_details(&self) -> ErrorDetails {
        ErrorDetails::new(self.error_type.clone(), self.message.clone())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Context provided to handlers during execution
///
/// # Example
///
/// ```ignore
/// async fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<(), HandlerError> {
///     for chunk in chunks(&message.body) {
///         if ctx.is_cancelled() {
///             return Err(HandlerError::canceled());
///         }
///         process(chunk).await?;
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HandlerContext {
    lease: Arc<LeaseState>,
}

impl HandlerContext {
    pub fn new(lease: Arc<LeaseState>) -> Self {
        Self { lease }
    }

    pub fn message_id(&self) -> MessageId {
        self.lease.id()
    }

    /// Cancellation was requested or the lease was lost
    pub fn is_cancelled(&self) -> bool {
        self.lease.cancellation_token().is_cancelled()
    }

    pub fn is_lease_lost(&self) -> bool {
        self.lease.is_lost()
    }

    /// Resolves when cancellation is requested or the lease is lost
    pub async fn cancelled(&self) {
        self.lease.cancellation_token().cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.lease.cancellation_token()
    }
}

/// Processes one message
///
/// Returning `Ok` commits the message. An error is recorded under its
/// `error_type` and the message is retried or moved to the error store.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), message).await
    }
}

/// Handler that decodes the body as JSON before calling the closure
///
/// A body that does not decode is a poison message.
pub struct JsonHandler<T, F> {
    f: F,
    _body: PhantomData<fn() -> T>,
}

pub fn json_handler<T, F, Fut>(f: F) -> JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(HandlerContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    JsonHandler {
        f,
        _body: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(HandlerContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<(), HandlerError> {
        let body: T = message
            .body_json()
            .map_err(|e| HandlerError::poison(format!("undecodable body: {e}")))?;
        (self.f)(ctx.clone(), body).await
    }
}

/// Why a message was not (or no longer) processed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("processing canceled")]
    Canceled,

    #[error("lease lost")]
    LeaseLost,

    #[error("scheduler unavailable: {0}")]
    Scheduler(SchedulerError),
}

/// Result of dispatched work
#[derive(Debug)]
pub enum Dispatched<T> {
    /// The work ran to completion
    Ran(T),

    /// Shutdown or lease loss was observed right before the work would start
    Interrupted(Interrupted),
}

/// Admits leased messages into the scheduler
///
/// Waits on the free-capacity signal while the scope is full, giving up on
/// shutdown or lease loss. Never leaves a message unfinalized: an
/// interrupted message is released through its context.
#[derive(Clone)]
pub struct DispatchHandler {
    factory: TaskFactory,
    group: Option<WorkGroup>,
    shutdown: CancellationToken,
}

impl DispatchHandler {
    pub fn new(factory: TaskFactory, group: Option<WorkGroup>, shutdown: CancellationToken) -> Self {
        Self {
            factory,
            group,
            shutdown,
        }
    }

    pub fn group(&self) -> Option<&WorkGroup> {
        self.group.as_ref()
    }

    fn interruption(&self, lease: &LeaseState) -> Option<Interrupted> {
        if lease.is_lost() {
            Some(Interrupted::LeaseLost)
        } else if self.shutdown.is_cancelled() || lease.cancellation_token().is_cancelled() {
            Some(Interrupted::Canceled)
        } else {
            None
        }
    }

    /// Admit `work` for the message held by `context`
    ///
    /// The work receives the context once it runs. If shutdown or lease loss
    /// is observed first, either while waiting for room or immediately before
    /// the work starts, the context is released instead.
    pub async fn dispatch<W, Fut, T, E>(
        &self,
        context: MessageContext,
        work: W,
    ) -> Result<TaskHandle<Dispatched<T>, E>, Interrupted>
    where
        W: FnOnce(MessageContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let lease = context.lease().clone();
        let slot = Arc::new(Mutex::new(Some(context)));

        let mut job = {
            let slot = slot.clone();
            let lease = lease.clone();
            let shutdown = self.shutdown.clone();
            move || async move {
                let taken = slot.lock().take();
                let Some(context) = taken else {
                    return Ok(Dispatched::Interrupted(Interrupted::Canceled));
                };

                let reason = if lease.is_lost() {
                    Some(Interrupted::LeaseLost)
                } else if shutdown.is_cancelled() || lease.cancellation_token().is_cancelled() {
                    Some(Interrupted::Canceled)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    debug!(message_id = %context.id(), %reason, "interrupted before start");
                    if let Err(e) = context.release(&reason).await {
                        warn!(error = %e, "failed to release interrupted message");
                    }
                    return Ok(Dispatched::Interrupted(reason));
                }

                work(context).await.map(Dispatched::Ran)
            }
        };

        let closing = self.factory.scheduler().closing_token();

        loop {
            if let Some(reason) = self.interruption(&lease) {
                return Err(self.release(&slot, reason).await);
            }

            let attempt = self.factory.try_start_new(job, self.group.as_ref());
            match attempt {
                Ok(Admission::Admitted(handle)) => return Ok(handle),
                Ok(Admission::Rejected(returned)) => job = returned,
                Err(SchedulerError::Disposed) => {
                    return Err(self.release(&slot, Interrupted::Canceled).await)
                }
                Err(e) => return Err(self.release(&slot, Interrupted::Scheduler(e)).await),
            }

            trace!(message_id = %lease.id(), "no room, waiting for capacity");
            let lease_token = lease.cancellation_token();
            tokio::select! {
                _ = self.factory.scheduler().wait_for_room(self.group.as_ref()) => {}
                _ = self.shutdown.cancelled() => {}
                _ = lease_token.cancelled() => {}
                _ = closing.cancelled() => {
                    return Err(self.release(&slot, Interrupted::Canceled).await);
                }
            }
        }
    }

    async fn release(&self, slot: &Mutex<Option<MessageContext>>, reason: Interrupted) -> Interrupted {
        let context = slot.lock().take();
        if let Some(context) = context {
            debug!(message_id = %context.id(), %reason, "dispatch interrupted");
            if let Err(e) = context.release(&reason).await {
                warn!(error = %e, "failed to release interrupted message");
            }
        }
        reason
    }
}
