use crate::consumers::TestError;
use crate::helpers::{consumer_builder, eventually, settled, RecordingReporter};
use count_ingestor::consumers::hooks::transient_error::{AlwaysRequeue, RequeueUntil};
use count_ingestor::consumers::{BrokerAction, ErrorType, Handler, HandlerError, Incoming};
use count_ingestor::reporting::FaultKind;
use count_ingestor::transport::MemoryTransport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails (or panics) on the first `failures` deliveries of every message, then returns `action`.
struct FlakyHandler {
    failures: usize,
    error_type: Option<ErrorType>,
    action: BrokerAction,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    fn new(failures: usize, error_type: Option<ErrorType>) -> Self {
        Self {
            failures,
            error_type,
            action: BrokerAction::Ack,
            calls: Arc::default(),
        }
    }
}

#[async_trait::async_trait]
impl Handler for FlakyHandler {
    type Error = TestError;

    async fn handle(&self, _incoming: &Incoming) -> Result<BrokerAction, HandlerError<TestError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.failures {
            return Ok(self.action);
        }
        match self.error_type {
            Some(error_type) => Err(HandlerError {
                inner_error: TestError,
                error_type,
            }),
            None => panic!("The handler blew up."),
        }
    }
}

#[tokio::test]
async fn the_action_returned_by_the_handler_is_executed() {
    for action in [BrokerAction::Ack, BrokerAction::Nack, BrokerAction::Reject] {
        // Arrange
        let transport = MemoryTransport::new();
        let reporter = RecordingReporter::new();
        let handler = FlakyHandler {
            action,
            ..FlakyHandler::new(0, None)
        };
        let consumer = consumer_builder(&transport, "results", handler, &reporter).build();
        consumer.start().await.unwrap();

        // Act
        let message_id = transport.publish("results", "Not relevant");
        settled(&transport, 1).await;
        consumer.stop().await.unwrap();

        // Assert
        assert_eq!(transport.dispositions_for(&message_id)[0], action);
        assert!(reporter.processing_faults().is_empty());
    }
}

#[tokio::test]
async fn fatal_errors_are_acknowledged_and_reported() {
    let transport = MemoryTransport::new();
    let reporter = RecordingReporter::new();
    let handler = FlakyHandler::new(usize::MAX, Some(ErrorType::Fatal));
    // Even with a hook that would requeue transient errors.
    let consumer = consumer_builder(&transport, "results", handler, &reporter)
        .transient_error_hook(AlwaysRequeue)
        .build();
    consumer.start().await.unwrap();

    let message_id = transport.publish("results", "Not relevant");
    settled(&transport, 1).await;
    consumer.stop().await.unwrap();

    assert_eq!(transport.dispositions_for(&message_id), vec![BrokerAction::Ack]);
    let faults = reporter.processing_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Fatal);
    assert_eq!(faults[0].disposition, BrokerAction::Ack);
    assert_eq!(faults[0].message_id.as_deref(), Some(message_id.as_str()));
    assert_eq!(faults[0].queue_name, "results");
}

#[tokio::test]
async fn transient_errors_are_acknowledged_by_default() {
    let transport = MemoryTransport::new();
    let reporter = RecordingReporter::new();
    let handler = FlakyHandler::new(usize::MAX, Some(ErrorType::Transient));
    let calls = handler.calls.clone();
    let consumer = consumer_builder(&transport, "results", handler, &reporter).build();
    consumer.start().await.unwrap();

    let message_id = transport.publish("results", "Not relevant");
    settled(&transport, 1).await;
    // Leave room for a redelivery that must not happen.
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.stop().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.dispositions_for(&message_id), vec![BrokerAction::Ack]);
    let faults = reporter.processing_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Transient);
}

#[tokio::test]
async fn transient_errors_are_requeued_if_the_hook_says_so() {
    let transport = MemoryTransport::new();
    let reporter = RecordingReporter::new();
    let handler = FlakyHandler::new(2, Some(ErrorType::Transient));
    let consumer = consumer_builder(&transport, "results", handler, &reporter)
        .transient_error_hook(AlwaysRequeue)
        .build();
    consumer.start().await.unwrap();

    let message_id = transport.publish("results", "Not relevant");
    settled(&transport, 3).await;
    consumer.stop().await.unwrap();

    assert_eq!(
        transport.dispositions_for(&message_id),
        vec![BrokerAction::Nack, BrokerAction::Nack, BrokerAction::Ack]
    );
    assert_eq!(reporter.processing_faults().len(), 2);
}

#[tokio::test]
async fn messages_are_dead_lettered_once_they_run_out_of_deliveries() {
    // Arrange
    let transport = MemoryTransport::new();
    let reporter = RecordingReporter::new();
    let handler = FlakyHandler::new(usize::MAX, Some(ErrorType::Transient));
    let calls = handler.calls.clone();
    let consumer = consumer_builder(&transport, "results", handler, &reporter)
        .transient_error_hook(RequeueUntil { max_deliveries: 3 })
        .build();
    consumer.start().await.unwrap();

    // Act
    let message_id = transport.publish("results", "Poison");
    settled(&transport, 3).await;
    consumer.stop().await.unwrap();

    // Assert
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        transport.dispositions_for(&message_id),
        vec![
            BrokerAction::Nack,
            BrokerAction::Nack,
            BrokerAction::Reject
        ]
    );
    assert_eq!(
        transport.dead_letters(),
        vec![("results".to_owned(), b"Poison".to_vec())]
    );
    let dispositions: Vec<_> = reporter
        .processing_faults()
        .into_iter()
        .map(|f| f.disposition)
        .collect();
    assert_eq!(
        dispositions,
        vec![
            BrokerAction::Nack,
            BrokerAction::Nack,
            BrokerAction::Reject
        ]
    );
}

#[tokio::test]
async fn a_panicking_handler_does_not_take_the_consumer_down() {
    // Arrange
    let transport = MemoryTransport::new();
    let reporter = RecordingReporter::new();
    let consumer =
        consumer_builder(&transport, "results", FlakyHandler::new(1, None), &reporter).build();
    consumer.start().await.unwrap();

    // Act
    let first = transport.publish("results", "Not relevant");
    settled(&transport, 1).await;
    let second = transport.publish("results", "Not relevant");
    settled(&transport, 2).await;
    consumer.stop().await.unwrap();

    // Assert
    assert_eq!(transport.dispositions_for(&first), vec![BrokerAction::Ack]);
    assert_eq!(transport.dispositions_for(&second), vec![BrokerAction::Ack]);
    let faults = reporter.processing_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Panic);
    assert_eq!(faults[0].disposition, BrokerAction::Ack);
    assert!(faults[0].error.contains("The handler blew up."));
}

#[tokio::test]
async fn acknowledgement_failures_are_reported() {
    let transport = MemoryTransport::new();
    transport.fail_acknowledgements(true);
    let reporter = RecordingReporter::new();
    let consumer =
        consumer_builder(&transport, "results", FlakyHandler::new(0, None), &reporter).build();
    consumer.start().await.unwrap();

    let message_id = transport.publish("results", "Not relevant");
    eventually("the acknowledgement failure", || {
        !reporter.processing_faults().is_empty()
    })
    .await;
    consumer.stop().await.unwrap();

    let faults = reporter.processing_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Acknowledgement);
    assert_eq!(faults[0].message_id.as_deref(), Some(message_id.as_str()));
    assert!(transport.dispositions().is_empty());
}
