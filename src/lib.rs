//! `count-ingestor` consumes count results from a queue and persists them.
//!
//! [`QueueConsumer`](crate::consumers::QueueConsumer) drives the consumption of a queue through
//! any [`Transport`](crate::transport::Transport) and hands each message to a
//! [`Handler`](crate::consumers::Handler).
//! [`ResultHandler`](crate::results::ResultHandler) is the handler that decodes count results
//! and saves them into a [`ResultStore`](crate::results::ResultStore).

pub mod amqp;
pub mod configuration;
pub mod consumers;
pub mod reporting;
pub mod results;
pub mod telemetry;
pub mod transport;
