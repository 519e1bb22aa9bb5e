use anyhow::Context;
use count_ingestor::amqp::{AmqpTransport, ConnectionFactory};
use count_ingestor::configuration::{ConsumerSettings, Settings, TransportKind};
use count_ingestor::consumers::QueueConsumer;
use count_ingestor::results::{
    InMemoryResultStore, PostgresResultStore, ResultHandler, ResultStore,
};
use count_ingestor::telemetry::init_subscriber;
use count_ingestor::transport::{MemoryTransport, Transport};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let settings = Settings::load().context("Failed to load the configuration.")?;
    init_subscriber(&settings.telemetry)?;

    if settings.database.in_memory {
        tracing::warn!("Count results are kept in memory and will be lost on exit");
        with_transport(&settings, Arc::new(InMemoryResultStore::new())).await
    } else {
        let store = PostgresResultStore::connect_lazy(
            settings.database.connect_options(),
            settings.database.max_connections,
        );
        store
            .ensure_schema()
            .await
            .context("Failed to create the count results table.")?;
        with_transport(&settings, Arc::new(store)).await
    }
}

async fn with_transport<S: ResultStore>(
    settings: &Settings,
    store: Arc<S>,
) -> Result<(), anyhow::Error> {
    match settings.consumer.transport {
        TransportKind::Amqp => {
            let transport = AmqpTransport::new(ConnectionFactory::new_from_config(
                &settings.rabbit_mq,
            )?)
            .with_queue_declaration(settings.consumer.declare_queue)
            .with_priority(settings.consumer.priority);
            run(&settings.consumer, transport, store).await
        }
        TransportKind::Memory => {
            tracing::warn!("Using the in-memory transport: no message will ever be received");
            run(&settings.consumer, MemoryTransport::new(), store).await
        }
    }
}

async fn run<T: Transport, S: ResultStore>(
    settings: &ConsumerSettings,
    transport: T,
    store: Arc<S>,
) -> Result<(), anyhow::Error> {
    let consumer = QueueConsumer::builder(
        settings.queue_name.clone(),
        transport,
        ResultHandler::new(store),
    )
    .with_prefetch_count(settings.prefetch_count)
    .with_concurrency(settings.concurrency)
    .with_shutdown_grace_period(settings.shutdown_grace_period())
    .dyn_transient_error_hook(settings.transient_error_hook())
    .build();

    let shutdown = ShutdownHandler::sigterm()?;
    consumer.start().await?;

    tokio::select! {
        _ = shutdown.wait_for_signal() => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    consumer.stop().await?;
    Ok(())
}
