use crate::consumers::{ConsumerTransientErrorHook, Delivery, ErrorType, HandlerError};
use crate::transport::Acker;
use std::fmt;

/// The action we ask the broker to take when finalising the processing of
/// the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    /// This happens if the message was processed successfully, if it turned out to be a poison
    /// message or if the transient error hook chose to drop it.
    Ack,
    /// Negative acknowledgement - the message was not processed successfully and should be requeued
    /// to retry processing.
    Nack,
    /// Rejection. The message was not processed successfully and should NOT be requeued.
    /// The message will be sent to the dead letter exchange if configured.
    Reject,
}

impl BrokerAction {
    pub(crate) async fn execute(&self, acker: &dyn Acker) -> Result<(), anyhow::Error> {
        match self {
            Self::Ack => acker.ack().await,
            // Put the message back to the queue
            Self::Nack => acker.nack().await,
            // Remove the message from the queue and send it to the DLQ (if configured)
            Self::Reject => acker.reject().await,
        }
    }
}

impl fmt::Display for BrokerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Nack => write!(f, "nack"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Based on the outcome of processing, determine what the broker should do with the message.
///
/// Poison messages (fatal errors) are acknowledged.
/// For transient errors we defer to the transient error hook.
pub(crate) async fn ack_or_nack<E>(
    transient_error_hook: &dyn ConsumerTransientErrorHook,
    message: &Delivery,
    outcome: &Result<BrokerAction, HandlerError<E>>,
) -> BrokerAction {
    match outcome {
        Ok(action) => *action,
        Err(e) => match e.error_type {
            ErrorType::Fatal => BrokerAction::Ack,
            ErrorType::Transient => transient_error_hook
                .on_transient_error(message)
                .await
                .into(),
        },
    }
}
