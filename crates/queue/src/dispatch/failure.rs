//! Failure routing: retry with delay, or promote to the error store

use std::time::Duration;

use tracing::{info, warn};

use super::context::MessageContext;
use crate::persistence::{ErrorDetails, StoreError};
use crate::reliability::ErrorPolicy;

/// Error type recorded for messages whose payload cannot be decoded
pub const POISON_ERROR_TYPE: &str = "PoisonMessage";

/// Error type recorded for handlers that panicked
pub const PANIC_ERROR_TYPE: &str = "Panic";

/// Where a failed message went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to Waiting; eligible again after `delay`
    Retrying { retry: u32, delay: Duration },

    /// Retries exhausted (or the error is not retryable)
    MovedToError { retries: u32 },
}

/// Record a failure and route the message accordingly
///
/// `count = record_error(type)`; when `count` exceeds the policy's
/// `max_retries` for that type, or the failure is not retryable, the message
/// moves to the error store. Otherwise it is rolled back with the policy's
/// delay for that retry.
pub async fn route_failure(
    context: MessageContext,
    details: &ErrorDetails,
    retryable: bool,
    policy: &ErrorPolicy,
) -> Result<FailureOutcome, StoreError> {
    let id = context.id();
    let count = context.record_error(&details.error_type).await?;
    let retry_policy = policy.for_error_type(&details.error_type);

    if !retryable || retry_policy.is_exhausted(count) {
        context.move_to_error(details).await?;
        warn!(
            message_id = %id,
            error_type = %details.error_type,
            retries = count,
            error = %details.message,
            "message moved to error store"
        );
        return Ok(FailureOutcome::MovedToError { retries: count });
    }

    let delay = retry_policy.delay_for_retry(count);
    context
        .rollback((!delay.is_zero()).then_some(delay))
        .await?;
    info!(
        message_id = %id,
        error_type = %details.error_type,
        retry = count,
        delay_ms = delay.as_millis() as u64,
        error = %details.message,
        "message scheduled for retry"
    );
    Ok(FailureOutcome::Retrying {
        retry: count,
        delay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use crate::dispatch::LeaseState;
    use crate::message::{MessageId, MessageStatus, NewMessage};
    use crate::persistence::{
        DequeueFilter, Dequeued, InMemoryLeaseStore, LeaseStore, Pagination,
    };
    use crate::reliability::RetryPolicy;

    async fn lease(store: &Arc<InMemoryLeaseStore>) -> Option<MessageContext> {
        let filter = DequeueFilter::new(Utc::now() + chrono::Duration::hours(1));
        match store.dequeue(&filter).await.unwrap()? {
            Dequeued::Message(m) => {
                let lease = LeaseState::new(m.id, m.heartbeat, &CancellationToken::new());
                Some(MessageContext::new(store.clone(), Arc::new(lease), None))
            }
            Dequeued::Poison { .. } => panic!("unexpected poison"),
        }
    }

    fn policy(max_retries: u32) -> ErrorPolicy {
        ErrorPolicy::new(RetryPolicy::fixed(Duration::from_millis(10), max_retries))
    }

    #[tokio::test]
    async fn test_retries_then_moves_to_error() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let id = store.send(NewMessage::new(vec![])).await.unwrap().id();
        let details = ErrorDetails::new("Timeout", "upstream timed out");
        let policy = policy(2);

        for retry in 1..=2 {
            let ctx = lease(&store).await.expect("message available");
            let outcome = route_failure(ctx, &details, true, &policy).await.unwrap();
            assert_eq!(
                outcome,
                FailureOutcome::Retrying {
                    retry,
                    delay: Duration::from_millis(10)
                }
            );
            assert_eq!(
                store.get_message(id).await.unwrap().unwrap().status,
                MessageStatus::Waiting
            );
        }

        let ctx = lease(&store).await.expect("message available");
        let outcome = route_failure(ctx, &details, true, &policy).await.unwrap();
        assert_eq!(outcome, FailureOutcome::MovedToError { retries: 3 });

        assert!(store.get_message(id).await.unwrap().is_none());
        let errors = store.list_errors(Pagination::default()).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "Timeout");
        assert_eq!(errors[0].retry_count, 3);
    }

    #[tokio::test]
    async fn test_counts_are_per_error_type() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let id = store.send(NewMessage::new(vec![])).await.unwrap().id();
        let policy = policy(1);

        for error_type in ["A", "B"] {
            let ctx = lease(&store).await.expect("message available");
            let outcome = route_failure(ctx, &ErrorDetails::new(error_type, "x"), true, &policy)
                .await
                .unwrap();
            assert!(matches!(outcome, FailureOutcome::Retrying { retry: 1, .. }));
        }

        assert_eq!(store.retry_count(id, "A"), 1);
        assert_eq!(store.retry_count(id, "B"), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_goes_straight_to_error() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.send(NewMessage::new(vec![])).await.unwrap();

        let ctx = lease(&store).await.expect("message available");
        let outcome = route_failure(ctx, &ErrorDetails::new("Invalid", "bad input"), false, &policy(5))
            .await
            .unwrap();

        assert_eq!(outcome, FailureOutcome::MovedToError { retries: 1 });
        assert_eq!(store.count(Some(MessageStatus::Error)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_poison_default_policy_does_not_retry() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let id = store.insert_undecodable("bad headers");

        let filter = DequeueFilter::new(Utc::now());
        let Some(Dequeued::Poison { id: poison_id, heartbeat, reason }) =
            store.dequeue(&filter).await.unwrap()
        else {
            panic!("expected poison");
        };
        assert_eq!(poison_id, id);

        let lease = LeaseState::new(poison_id, heartbeat, &CancellationToken::new());
        let ctx = MessageContext::new(store.clone(), Arc::new(lease), None);
        let outcome = route_failure(
            ctx,
            &ErrorDetails::new(POISON_ERROR_TYPE, reason),
            true,
            &ErrorPolicy::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, FailureOutcome::MovedToError { retries: 1 });
        assert!(store.get_message(MessageId(id.as_i64())).await.unwrap().is_none());
    }
}
