use crate::consumers::{BrokerAction, Delivery};

#[async_trait::async_trait]
/// A hook to determine what happens to messages whose processing failed due to a transient error.
///
/// # Use case
///
/// A failed persistence attempt does not necessarily mean that the message is broken: the store
/// might just be unavailable for a while.
///
/// If the error encountered during processing is marked as [`ErrorType::Transient`]
/// you can inject your own logic to determine if the failed message should be requeued,
/// dead-lettered or dropped using a transient error hook.
///
/// # On fatal errors
///
/// A transient error hook, as the name implies, is only invoked on transient errors.
/// Errors marked as [`ErrorType::Fatal`] denote poison messages: they are acknowledged and
/// never requeued.
///
/// # Plug and play implementations
///
/// You can find ready-to-go hooks in the [`hooks::transient_error`] module -
/// [`NeverRequeue`], [`AlwaysRequeue`] and [`RequeueUntil`].
///
/// [`ErrorType::Transient`]: crate::consumers::ErrorType::Transient
/// [`ErrorType::Fatal`]: crate::consumers::ErrorType::Fatal
/// [`hooks::transient_error`]: crate::consumers::hooks::transient_error
/// [`NeverRequeue`]: crate::consumers::hooks::transient_error::NeverRequeue
/// [`AlwaysRequeue`]: crate::consumers::hooks::transient_error::AlwaysRequeue
/// [`RequeueUntil`]: crate::consumers::hooks::transient_error::RequeueUntil
pub trait ConsumerTransientErrorHook: Send + Sync + 'static {
    /// If [`ShouldRequeue::Requeue`] is returned, the message will be requeued and become
    /// _immediately_ available again for consumption.
    /// If [`ShouldRequeue::Discard`] is returned, the message will be acknowledged: it will not
    /// be requeued and it will not end up in the dead letter exchange if configured.
    /// If [`ShouldRequeue::DeadLetterOrDiscard`] is returned, the message will be not be requeued
    /// and it will end up in the dead letter exchange if configured.
    async fn on_transient_error(&self, delivery: &Delivery) -> ShouldRequeue;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Determines if a failed message should be re-queued.
///
/// Check out [`ConsumerTransientErrorHook`]'s documentation for more details.
pub enum ShouldRequeue {
    Requeue,
    Discard,
    DeadLetterOrDiscard,
}

impl From<ShouldRequeue> for BrokerAction {
    fn from(value: ShouldRequeue) -> Self {
        match value {
            ShouldRequeue::Requeue => BrokerAction::Nack,
            ShouldRequeue::Discard => BrokerAction::Ack,
            ShouldRequeue::DeadLetterOrDiscard => BrokerAction::Reject,
        }
    }
}
