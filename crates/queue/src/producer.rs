//! Producer side of the queue

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::SendError;
use crate::message::NewMessage;
use crate::persistence::{LeaseStore, SendOutcome};

/// Sends messages to a queue
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use durable_queue::{InMemoryLeaseStore, NewMessage, QueueProducer};
///
/// # tokio_test::block_on(async {
/// let producer = QueueProducer::new(Arc::new(InMemoryLeaseStore::new()));
///
/// producer.send(NewMessage::new(b"hello".to_vec())).await.unwrap();
/// producer.send_json(&serde_json::json!({"order": 42})).await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct QueueProducer {
    store: Arc<dyn LeaseStore>,
}

impl QueueProducer {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, message), fields(job_name = ?message.job_name))]
    pub async fn send(&self, message: NewMessage) -> Result<SendOutcome, SendError> {
        let outcome = self.store.send(message).await?;
        debug!(message_id = %outcome.id(), "message sent");
        Ok(outcome)
    }

    /// Send a JSON-encoded body
    pub async fn send_json<T: Serialize>(&self, body: &T) -> Result<SendOutcome, SendError> {
        self.send(NewMessage::json(body)?).await
    }

    /// Send several messages in order
    pub async fn send_batch(
        &self,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<SendOutcome>, SendError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let outcomes = self.store.send_batch(messages).await?;
        debug!(count = outcomes.len(), "batch sent");
        Ok(outcomes)
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }
}
