pub use queue_consumer::QueueConsumerBuilder;

mod queue_consumer;
