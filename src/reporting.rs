//! The sink for faults the consumer cannot hand back to anybody.
//!
//! There are two independent channels:
//! - processing faults, tied to a specific message (malformed payload, failed write, failed ack);
//! - transport faults, tied to the connection with the broker rather than to a message.
//!
//! Reporting is a pure side effect: it never changes what happens to a message or to the consumer.
use crate::consumers::BrokerAction;
use std::fmt;

/// Records faults encountered while consuming a queue.
///
/// Implementations must not panic and must be cheap: they are invoked inline by the workers.
pub trait ErrorReporter: Send + Sync + 'static {
    /// Processing of a specific message failed.
    fn processing_fault(&self, fault: &ProcessingFault<'_>);

    /// The transport failed independently of any message (e.g. the connection dropped).
    fn transport_fault(&self, queue_name: &str, error: &anyhow::Error);
}

/// Everything we know about a failure to process a message.
#[derive(Debug)]
pub struct ProcessingFault<'a> {
    pub queue_name: &'a str,
    pub message_id: Option<&'a str>,
    pub kind: FaultKind,
    /// What we told (or tried to tell) the broker about the message.
    pub disposition: BrokerAction,
    pub error: &'a (dyn std::error::Error + 'static),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The handler returned a fatal error: the message is poison.
    Fatal,
    /// The handler returned a transient error.
    Transient,
    /// The handler panicked.
    Panic,
    /// The handler was done, but we could not settle the message with the broker.
    Acknowledgement,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal_error",
            Self::Transient => "transient_error",
            Self::Panic => "handler_panic",
            Self::Acknowledgement => "acknowledgement_failure",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The default [`ErrorReporter`]: one `tracing` error event per fault.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn processing_fault(&self, fault: &ProcessingFault<'_>) {
        tracing::error!(
            queue_name = %fault.queue_name,
            message_id = fault.message_id,
            outcome = %fault.kind,
            disposition = %fault.disposition,
            error.message = %fault.error,
            error.details = %ErrorChain(fault.error),
            "Failed to process message"
        );
    }

    fn transport_fault(&self, queue_name: &str, error: &anyhow::Error) {
        tracing::error!(
            queue_name = %queue_name,
            outcome = "transport_fault",
            error.message = %error,
            error.details = %ErrorChain(&**error),
            "Transport failure"
        );
    }
}

/// Renders an error followed by its chain of sources, one per line.
pub struct ErrorChain<'a>(pub &'a (dyn std::error::Error + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut current = self.0.source();
        while let Some(cause) = current {
            write!(f, "\n\tCaused by: {}", cause)?;
            current = cause.source();
        }
        Ok(())
    }
}
