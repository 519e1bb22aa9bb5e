use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::ConnectionFactory;
use crate::consumers::Delivery;
use crate::transport::{Acker, ConnectionError, Subscription, Transport, TransportResources};
use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::{future, stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::{Channel, ChannelState, Connection, ConnectionState};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// A [`Transport`] talking to a RabbitMq broker.
///
/// Each subscription gets its own connection and channel.
#[derive(Clone)]
pub struct AmqpTransport {
    connection_factory: ConnectionFactory,
    declare_queue: bool,
    priority: Option<i32>,
}

impl AmqpTransport {
    pub fn new(connection_factory: ConnectionFactory) -> Self {
        Self {
            connection_factory,
            declare_queue: false,
            priority: None,
        }
    }

    /// Declare the queue (durable) before consuming from it, creating it if it does not exist.
    #[must_use]
    pub fn with_queue_declaration(mut self, declare_queue: bool) -> Self {
        self.declare_queue = declare_queue;
        self
    }

    /// Sets the `x-priority` consume argument.
    ///
    /// See [RabbitMq Consumer Priorities](https://www.rabbitmq.com/consumer-priority.html).
    #[must_use]
    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = priority;
        self
    }

    async fn open_channel(
        &self,
        queue_name: &str,
        prefetch_count: u16,
        broken_connection: BrokenConnection,
    ) -> Result<(Connection, Channel), anyhow::Error> {
        let connection = self.connection_factory.new_connection().await?;
        connection.on_error(move |e| broken_connection.record(e));

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        if self.declare_queue {
            channel
                .queue_declare(
                    queue_name,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok((connection, channel))
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    #[tracing::instrument(name = "rabbitmq_subscribe", skip(self))]
    async fn subscribe(
        &self,
        queue_name: &str,
        prefetch_count: u16,
    ) -> Result<Subscription, ConnectionError> {
        let broken_connection = BrokenConnection::default();
        let (connection, channel) = self
            .open_channel(queue_name, prefetch_count, broken_connection.clone())
            .await
            .map_err(|e| ConnectionError::new(queue_name, e))?;

        let consumer = channel
            .basic_consume(
                queue_name,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions::default(),
                {
                    let mut args = FieldTable::default();
                    if let Some(priority) = self.priority {
                        args.insert("x-priority".into(), AMQPValue::LongInt(priority));
                    }
                    args
                },
            )
            .await;
        let consumer = match consumer {
            Ok(consumer) => consumer,
            Err(e) => {
                let resources = AmqpResources {
                    connection,
                    channel,
                    consumer_tag: None,
                };
                // Best effort, we are already failing.
                let _ = resources.release().await;
                return Err(ConnectionError::new(queue_name, e));
            }
        };
        let consumer_tag = consumer.tag().as_str().to_owned();

        // A consumer error means the channel is gone: surface it, then end the stream.
        // If the consumer ends quietly, the connection error (if any) is surfaced instead.
        let deliveries = consumer
            .map(Some)
            .chain(stream::once(future::ready(None)))
            .scan(false, move |failed, event| {
                if *failed {
                    return future::ready(None);
                }
                let item = match event {
                    Some(Ok(delivery)) => Ok(into_delivery(delivery)),
                    Some(Err(e)) => {
                        *failed = true;
                        Err(anyhow::Error::from(e).context("RabbitMq consumer error."))
                    }
                    None => {
                        *failed = true;
                        match broken_connection.take() {
                            Some(e) => {
                                Err(anyhow::Error::from(e).context("RabbitMq broken connection."))
                            }
                            None => return future::ready(None),
                        }
                    }
                };
                future::ready(Some(item))
            })
            .boxed();

        Ok(Subscription {
            deliveries,
            resources: Box::new(AmqpResources {
                connection,
                channel,
                consumer_tag: Some(consumer_tag),
            }),
        })
    }
}

/// The last error raised on the connection backing a subscription.
#[derive(Clone, Default)]
struct BrokenConnection(Arc<Mutex<Option<lapin::Error>>>);

impl BrokenConnection {
    fn record(&self, error: lapin::Error) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn take(&self) -> Option<lapin::Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());
    // Quorum queues count the previous deliveries: the header is missing on the first one.
    let delivery_count = delivery
        .properties
        .get_header_u64("x-delivery-count")
        .map(|previous| previous + 1);

    let mut message = Delivery::new(delivery.data, LapinAcker(delivery.acker))
        .with_redelivered(delivery.redelivered);
    if let Some(message_id) = message_id {
        message = message.with_message_id(message_id);
    }
    if let Some(delivery_count) = delivery_count {
        message = message.with_delivery_count(delivery_count);
    }
    message
}

struct AmqpResources {
    connection: Connection,
    channel: Channel,
    consumer_tag: Option<String>,
}

#[async_trait::async_trait]
impl TransportResources for AmqpResources {
    async fn cancel_delivery(&self) -> Result<(), anyhow::Error> {
        if let Some(consumer_tag) = &self.consumer_tag {
            if matches!(self.channel.status().state(), ChannelState::Connected) {
                self.channel
                    .basic_cancel(consumer_tag, BasicCancelOptions::default())
                    .await?;
            }
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), anyhow::Error> {
        if matches!(self.channel.status().state(), ChannelState::Connected) {
            self.channel.close(200, "Consumer stopped").await?;
        }
        if matches!(self.connection.status().state(), ConnectionState::Connected) {
            self.connection.close(200, "Consumer stopped").await?;
        }
        Ok(())
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.0.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), anyhow::Error> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), anyhow::Error> {
        self.0.reject(BasicRejectOptions { requeue: false }).await?;
        Ok(())
    }
}
