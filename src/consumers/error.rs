use crate::consumers::ConsumerStatus;
use crate::transport::ConnectionError;
use std::fmt;

/// The error type returned by message handlers.
///
/// It contains all the information we need to decide what to tell the broker about the message,
/// as well as what to report.
#[derive(Debug)]
pub struct HandlerError<E> {
    /// The underlying error returned by the message handler.
    pub inner_error: E,
    /// `error_type` distinguishes two classes of errors:
    /// - transient errors; message processing might succeed if retried after a short delay
    /// - fatal errors; no matter how many times you retry, processing will never succeed
    ///
    /// Check out [`ErrorType`]'s documentation for more details.
    pub error_type: ErrorType,
}

impl<E> HandlerError<E> {
    /// Wrap an error that will never go away, no matter how many times the message is redelivered.
    pub fn fatal(inner_error: E) -> Self {
        Self {
            inner_error,
            error_type: ErrorType::Fatal,
        }
    }

    /// Wrap an error that might go away if the message is processed again later on.
    pub fn transient(inner_error: E) -> Self {
        Self {
            inner_error,
            error_type: ErrorType::Transient,
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for HandlerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner_error)
    }
}

impl<E: fmt::Display> fmt::Display for HandlerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of a message failed due to a {} issue - {}",
            self.error_type, self.inner_error
        )
    }
}

/// Types of failure when handling a message.
/// Used by the consumer to pick the disposition of the failed message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Message processing might succeed if retried after a short delay.
    ///
    /// E.g. the result store timed out while we were trying to persist the record.
    ///
    /// The consumer asks the [transient error hook](crate::consumers::ConsumerTransientErrorHook)
    /// what should happen to the message.
    Transient,
    /// Message processing will never succeed, no matter how many times you retry or how long
    /// you wait.
    ///
    /// E.g. the message payload is malformed and cannot be deserialized.
    ///
    /// The message is a poison message: it gets acknowledged and dropped.
    Fatal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// A message handler panicked while processing a message.
#[derive(thiserror::Error, Debug)]
#[error("The message handler panicked: {message}")]
pub struct HandlerPanic {
    pub message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self { message }
    }
}

/// Errors returned by the lifecycle operations of a [`QueueConsumer`].
///
/// [`QueueConsumer`]: crate::consumers::QueueConsumer
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    /// We could not reach the broker to establish the subscription.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The operation is not allowed in the current lifecycle state.
    #[error("Cannot {operation} a consumer that is {status}.")]
    InvalidState {
        operation: &'static str,
        status: ConsumerStatus,
    },
}
