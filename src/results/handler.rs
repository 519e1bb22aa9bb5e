use crate::consumers::{BrokerAction, Handler, HandlerError, Incoming};
use crate::results::{decode, DecodeError, PersistenceError, ResultStore};
use std::sync::Arc;

/// Decodes count results and hands them over to a [`ResultStore`].
///
/// - A body that cannot be decoded is a poison message: [`ErrorType::Fatal`](crate::consumers::ErrorType::Fatal).
/// - A failed save might succeed later on: [`ErrorType::Transient`](crate::consumers::ErrorType::Transient).
///   What happens to the message is up to the consumer's transient error hook.
/// - A successful save acknowledges the message.
pub struct ResultHandler<S> {
    store: Arc<S>,
}

impl<S: ResultStore> ResultHandler<S> {
    /// The store is shared: keep a clone of the `Arc` around if you need to inspect it.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("Invalid count result payload.")]
    Decode(#[source] DecodeError),
    #[error(transparent)]
    Persist(PersistenceError),
}

#[async_trait::async_trait]
impl<S: ResultStore> Handler for ResultHandler<S> {
    type Error = IngestError;

    #[tracing::instrument(name = "ingest_count_result", skip_all)]
    async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError<IngestError>> {
        let body = &incoming.message.data;
        tracing::info!(
            queue_name = %incoming.queue_name,
            body = %String::from_utf8_lossy(body),
            "New message"
        );

        let record = decode(body).map_err(|e| HandlerError::fatal(IngestError::Decode(e)))?;
        self.store
            .save(&record)
            .await
            .map_err(|e| HandlerError::transient(IngestError::Persist(e)))?;

        tracing::info!(
            queue_name = %incoming.queue_name,
            outcome = "persisted",
            record_id = %record.id,
            count = record.count,
            "Count result persisted"
        );
        Ok(BrokerAction::Ack)
    }
}
