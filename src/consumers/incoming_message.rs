use crate::transport::Acker;
use std::fmt;

/// A dequeued message enriched with some auxiliary data, ready for processing.
///
/// `Incoming` is the input type of our message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
#[derive(Debug)]
pub struct Incoming {
    /// `message` is what we received from the broker: payload, message id, delivery count, etc.
    pub message: Delivery,
    /// The name of the queue.
    pub queue_name: String,
}

/// A message delivered by the transport.
pub struct Delivery {
    /// The id assigned to the message by its publisher, if any.
    pub message_id: Option<String>,

    /// How many times the broker has delivered this message, this delivery included.
    /// Only populated by transports that track it (e.g. RabbitMq quorum queues).
    pub delivery_count: Option<u64>,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,

    // Hidden from public interface, to stop a message being acked / rejected inside a message handler.
    // A message must be settled with the broker exactly once.
    pub(crate) acker: Box<dyn Acker>,
}

impl Delivery {
    /// Build a delivery out of its payload and the handle used to settle it with the broker.
    ///
    /// Used by [`Transport`](crate::transport::Transport) implementations.
    pub fn new(data: Vec<u8>, acker: impl Acker) -> Self {
        Self {
            message_id: None,
            delivery_count: None,
            redelivered: false,
            data,
            acker: Box::new(acker),
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub fn with_delivery_count(mut self, delivery_count: u64) -> Self {
        self.delivery_count = Some(delivery_count);
        self
    }

    #[must_use]
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("delivery_count", &self.delivery_count)
            .field("redelivered", &self.redelivered)
            .field("data", &String::from_utf8_lossy(&self.data))
            .finish_non_exhaustive()
    }
}
