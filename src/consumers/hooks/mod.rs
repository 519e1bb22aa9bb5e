//! Ready-to-use implementations of the consumer hooks.
pub mod transient_error;
