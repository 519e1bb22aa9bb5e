//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
pub mod convenience;
mod factory;
mod transport;
pub use factory::ConnectionFactory;
pub use transport::AmqpTransport;

pub use lapin::{options, types, BasicProperties};
