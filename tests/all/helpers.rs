use count_ingestor::consumers::{BrokerAction, Handler, QueueConsumer, QueueConsumerBuilder};
use count_ingestor::reporting::{ErrorReporter, FaultKind, ProcessingFault};
use count_ingestor::results::{PersistenceError, ResultRecord, ResultStore};
use count_ingestor::transport::{Acker, MemoryTransport};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A consumer builder wired to `transport` and `reporter`, with a fast reconnect backoff.
pub fn consumer_builder<H: Handler>(
    transport: &MemoryTransport,
    queue_name: &str,
    handler: H,
    reporter: &Arc<RecordingReporter>,
) -> QueueConsumerBuilder<MemoryTransport, H> {
    QueueConsumer::builder(queue_name, transport.clone(), handler)
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .error_reporter(reporter.clone())
}

/// Poll `condition` until it holds, panicking if it does not within a few seconds.
pub async fn eventually(description: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "Timed out waiting for: {}",
            description
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `transport` has received `n` settlement instructions.
pub async fn settled(transport: &MemoryTransport, n: usize) {
    eventually("messages to be settled", || transport.dispositions().len() >= n).await;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFault {
    pub queue_name: String,
    pub message_id: Option<String>,
    pub kind: FaultKind,
    pub disposition: BrokerAction,
    pub error: String,
}

#[derive(Default)]
pub struct RecordingReporter {
    processing: Mutex<Vec<RecordedFault>>,
    transport: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn processing_faults(&self) -> Vec<RecordedFault> {
        self.processing.lock().unwrap().clone()
    }

    pub fn transport_faults(&self) -> Vec<String> {
        self.transport.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn processing_fault(&self, fault: &ProcessingFault<'_>) {
        self.processing.lock().unwrap().push(RecordedFault {
            queue_name: fault.queue_name.to_owned(),
            message_id: fault.message_id.map(ToOwned::to_owned),
            kind: fault.kind,
            disposition: fault.disposition,
            error: fault.error.to_string(),
        });
    }

    fn transport_fault(&self, _queue_name: &str, error: &anyhow::Error) {
        self.transport.lock().unwrap().push(format!("{:#}", error));
    }
}

/// Remembers every record it was asked to save.
#[derive(Default)]
pub struct RecordingStore {
    saved: Mutex<Vec<ResultRecord>>,
    delay: Option<Duration>,
}

impl RecordingStore {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            saved: Mutex::default(),
            delay: Some(delay),
        }
    }

    pub fn saved(&self) -> Vec<ResultRecord> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ResultStore for RecordingStore {
    async fn save(&self, record: &ResultRecord) -> Result<(), PersistenceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.saved.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Fails every save.
#[derive(Default)]
pub struct FailingStore {
    attempts: AtomicUsize,
}

impl FailingStore {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ResultStore for FailingStore {
    async fn save(&self, record: &ResultRecord) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PersistenceError::new(
            record,
            anyhow::anyhow!("The store is unavailable."),
        ))
    }
}

/// Settles nothing: for handlers invoked outside of a consumer.
pub struct NoopAcker;

#[async_trait::async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn nack(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn reject(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// A `tracing` layer collecting the `outcome` field of every event that carries one.
#[derive(Clone, Default)]
pub struct OutcomeRecorder(Arc<Mutex<Vec<String>>>);

impl OutcomeRecorder {
    pub fn outcomes(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl<S: tracing::Subscriber> Layer<S> for OutcomeRecorder {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = OutcomeVisitor::default();
        event.record(&mut visitor);
        if let Some(outcome) = visitor.0 {
            self.0.lock().unwrap().push(outcome);
        }
    }
}

#[derive(Default)]
struct OutcomeVisitor(Option<String>);

impl Visit for OutcomeVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "outcome" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "outcome" {
            self.0 = Some(format!("{:?}", value));
        }
    }
}
