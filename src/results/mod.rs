//! The count results domain: what a message carries, how to decode it and where it ends up.
pub use codec::{decode, DecodeError};
pub use handler::{IngestError, ResultHandler};
pub use postgres::PostgresResultStore;
pub use record::ResultRecord;
pub use store::{InMemoryResultStore, PersistenceError, ResultStore};

pub mod codec;
mod handler;
mod postgres;
mod record;
mod store;
