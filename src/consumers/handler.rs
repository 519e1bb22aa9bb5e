use crate::consumers::{BrokerAction, HandlerError, Incoming};

/// Implementers of the `Handler` trait can be used by a [`QueueConsumer`]
/// to process messages retrieved from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying broker channel.
/// The consumer takes care of settling the message with the broker according to the outcome
/// of processing (check out [`HandlerError`] for more details).
/// This decouples the low-level interactions with the message broker and the retry policy from
/// the actual business logic associated with the processing of a message.
///
/// # Concurrency
///
/// The consumer invokes `handle` from several workers at once, one message per invocation.
/// Any resource shared across invocations (e.g. a database pool) must be safe to use concurrently.
///
/// [`QueueConsumer`]: crate::consumers::QueueConsumer
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(
        &self,
        incoming: &Incoming,
    ) -> Result<BrokerAction, HandlerError<Self::Error>>;
}
