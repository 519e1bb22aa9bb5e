//! The seam between the consumption loop and the message broker.
//!
//! A [`Transport`] knows how to open a [`Subscription`] on a named queue: a stream of
//! [`Delivery`]s plus the broker resources backing it. The consumer drives the stream, settles
//! each delivery through its [`Acker`] and hands the resources back when it is done with them.
//!
//! Two implementations are provided: [`AmqpTransport`](crate::amqp::AmqpTransport), on top of
//! `lapin`, and [`MemoryTransport`], an in-process queue.
use crate::consumers::Delivery;
use futures_util::stream::BoxStream;

mod memory;

pub use memory::{MemoryTransport, RecordedDisposition};

/// The deliveries pushed by the broker for a subscription.
///
/// An `Err` item is a transport fault: it does not end the subscription by itself.
/// The subscription is over when the stream returns `None`. A subscription killed by a fault
/// yields that fault as its last item, so that it is reported once.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// An active subscription to a queue.
pub struct Subscription {
    pub deliveries: DeliveryStream,
    pub resources: Box<dyn TransportResources>,
}

/// Types capable of subscribing to a queue on a message broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the broker and start receiving messages from `queue_name`.
    ///
    /// The broker will push at most `prefetch_count` unsettled messages at a time.
    async fn subscribe(
        &self,
        queue_name: &str,
        prefetch_count: u16,
    ) -> Result<Subscription, ConnectionError>;
}

/// The broker resources (connection, channel, consumer tag) backing a [`Subscription`].
#[async_trait::async_trait]
pub trait TransportResources: Send + Sync + 'static {
    /// Ask the broker to stop pushing messages.
    /// Messages already delivered can still be settled afterwards.
    async fn cancel_delivery(&self) -> Result<(), anyhow::Error>;

    /// Close everything. Unsettled messages go back to the queue.
    async fn release(&self) -> Result<(), anyhow::Error>;
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    /// Negative acknowledgement, with requeue.
    async fn nack(&self) -> Result<(), anyhow::Error>;

    /// Negative acknowledgement, without requeue.
    async fn reject(&self) -> Result<(), anyhow::Error>;
}

/// We could not establish a subscription with the broker.
#[derive(thiserror::Error, Debug)]
#[error("Failed to subscribe to queue `{queue_name}`.")]
pub struct ConnectionError {
    pub queue_name: String,
    #[source]
    pub source: anyhow::Error,
}

impl ConnectionError {
    pub fn new(queue_name: &str, source: impl Into<anyhow::Error>) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            source: source.into(),
        }
    }
}
