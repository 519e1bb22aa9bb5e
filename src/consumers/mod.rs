//! Facilities to consume messages from a queue. Check out [`QueueConsumer`] as a
//! starting point.
pub use broker_action::BrokerAction;
pub use builders::QueueConsumerBuilder;
pub use consumer::{ConsumerStatus, QueueConsumer};
pub use error::{ConsumerError, ErrorType, HandlerError, HandlerPanic};
pub use handler::Handler;
pub use incoming_message::{Delivery, Incoming};
pub use transient_error_hook::{ConsumerTransientErrorHook, ShouldRequeue};

mod broker_action;
mod builders;
mod consumer;
mod error;
mod handler;
pub mod hooks;
mod incoming_message;
mod transient_error_hook;
