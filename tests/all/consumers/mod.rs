mod processing;

use count_ingestor::consumers::{BrokerAction, Handler, HandlerError, Incoming};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
#[error("Something went wrong.")]
pub struct TestError;

/// Acks every message after `delay`, counting the messages it started and finished.
#[derive(Clone, Default)]
pub struct SleepyHandler {
    pub delay: Duration,
    pub started: Arc<AtomicUsize>,
    pub completed: Arc<AtomicUsize>,
}

impl SleepyHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Handler for SleepyHandler {
    type Error = TestError;

    async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError<TestError>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(BrokerAction::Ack)
    }
}
