use crate::consumers::{
    broker_action::ack_or_nack, BrokerAction, ConsumerError, ConsumerTransientErrorHook, Delivery,
    ErrorType, Handler, HandlerPanic, Incoming,
};
use crate::reporting::{ErrorReporter, FaultKind, ProcessingFault};
use crate::transport::{DeliveryStream, Subscription, Transport, TransportResources};
use futures_util::future::FusedFuture;
use futures_util::{FutureExt, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Where a [`QueueConsumer`] is in its lifecycle.
///
/// ```text
/// Idle --start--> Running --stop--> Stopping --> Stopped
///   \-------------------stop-------------------/
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

enum ConsumerState {
    Idle,
    Running(RunningConsumer),
    Stopping,
    Stopped,
}

impl ConsumerState {
    fn status(&self) -> ConsumerStatus {
        match self {
            Self::Idle => ConsumerStatus::Idle,
            Self::Running(_) => ConsumerStatus::Running,
            Self::Stopping => ConsumerStatus::Stopping,
            Self::Stopped => ConsumerStatus::Stopped,
        }
    }
}

/// The tasks spawned by [`QueueConsumer::start`].
///
/// Dropping it drops `shutdown`, which the background tasks treat as a shutdown signal.
struct RunningConsumer {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    resources: ActiveResources,
}

/// The resources backing the live subscription, if any.
///
/// The dispatcher swaps them on every (re)subscription. [`QueueConsumer::stop`] releases whatever
/// is left in there, even if the dispatcher had to be aborted.
#[derive(Clone, Default)]
struct ActiveResources(Arc<std::sync::Mutex<Option<Arc<dyn TransportResources>>>>);

impl ActiveResources {
    fn set(&self, resources: Box<dyn TransportResources>) {
        *self.lock() = Some(Arc::from(resources));
    }

    fn current(&self) -> Option<Arc<dyn TransportResources>> {
        self.lock().clone()
    }

    fn take(&self) -> Option<Arc<dyn TransportResources>> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn TransportResources>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tuning knobs of a [`QueueConsumer`]. See [`QueueConsumerBuilder`](super::QueueConsumerBuilder).
#[derive(Debug, Clone)]
pub(super) struct ConsumerOptions {
    pub(super) prefetch_count: u16,
    pub(super) concurrency: usize,
    pub(super) shutdown_grace_period: Duration,
    pub(super) initial_reconnect_backoff: Duration,
    pub(super) max_reconnect_backoff: Duration,
}

/// What every worker needs to process a message.
struct ProcessingContext<H: Handler> {
    queue_name: String,
    handler: Arc<H>,
    transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
    reporter: Arc<dyn ErrorReporter>,
}

/// Consumes a single queue, handing every message to a [`Handler`] and settling it with the
/// broker according to the outcome.
///
/// # Delivery model
///
/// The broker pushes messages on a [`Subscription`]. A dispatcher task moves them into a bounded
/// internal queue, drained by a pool of `concurrency` workers: messages are processed
/// concurrently and in no particular order.
///
/// Every message is settled exactly once:
/// - the handler succeeded: the [`BrokerAction`](super::BrokerAction) it returned;
/// - the handler failed with a fatal error (poison message): ack;
/// - the handler failed with a transient error: whatever the transient error hook says;
/// - the handler panicked: ack.
///
/// Failures are routed to the [`ErrorReporter`]; they never stop the consumer.
///
/// # Lifecycle
///
/// Use [`QueueConsumer::builder`] to build one, then [`start`](QueueConsumer::start) and
/// [`stop`](QueueConsumer::stop) it. A consumer cannot be restarted once stopped.
pub struct QueueConsumer<T: Transport, H: Handler> {
    transport: Arc<T>,
    context: Arc<ProcessingContext<H>>,
    options: ConsumerOptions,
    state: Mutex<ConsumerState>,
}

impl<T: Transport, H: Handler> QueueConsumer<T, H> {
    pub(super) fn new(
        queue_name: String,
        transport: Arc<T>,
        handler: Arc<H>,
        transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
        reporter: Arc<dyn ErrorReporter>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            transport,
            context: Arc::new(ProcessingContext {
                queue_name,
                handler,
                transient_error_hook,
                reporter,
            }),
            options,
            state: Mutex::new(ConsumerState::Idle),
        }
    }

    /// The name of the queue we are consuming from.
    pub fn queue_name(&self) -> &str {
        &self.context.queue_name
    }

    pub async fn status(&self) -> ConsumerStatus {
        self.state.lock().await.status()
    }

    /// Subscribe to the queue and start processing messages.
    ///
    /// It fails if the consumer is not [`ConsumerStatus::Idle`] or if the broker cannot be
    /// reached. In the latter case the consumer stays idle and `start` can be retried.
    #[tracing::instrument(skip_all, name = "consumer_start", fields(queue_name = %self.context.queue_name))]
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, ConsumerState::Idle) {
            return Err(ConsumerError::InvalidState {
                operation: "start",
                status: state.status(),
            });
        }

        let queue_name = &self.context.queue_name;
        tracing::info!(queue_name = %queue_name, "Consuming from queue {}", queue_name);
        let Subscription {
            deliveries,
            resources: subscription_resources,
        } = self
            .transport
            .subscribe(queue_name, self.options.prefetch_count)
            .await?;
        let resources = ActiveResources::default();
        resources.set(subscription_resources);

        let (shutdown, shutdown_signal) = watch::channel(false);
        let (sender, receiver) = mpsc::channel(self.options.concurrency);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..self.options.concurrency)
            .map(|_| tokio::spawn(work(self.context.clone(), receiver.clone())))
            .collect();
        let dispatcher = tokio::spawn(dispatch(
            self.transport.clone(),
            self.context.clone(),
            self.options.clone(),
            deliveries,
            resources.clone(),
            sender,
            shutdown_signal,
        ));

        *state = ConsumerState::Running(RunningConsumer {
            shutdown,
            dispatcher,
            workers,
            resources,
        });
        tracing::info!(
            queue_name = %queue_name,
            concurrency = self.options.concurrency,
            prefetch_count = self.options.prefetch_count,
            "Started processing messages"
        );
        Ok(())
    }

    /// Stop consuming and release the subscription.
    ///
    /// The broker is asked to stop pushing messages; messages already received are given
    /// `shutdown_grace_period` to be processed and settled. Workers still busy after that are
    /// aborted and their messages go back to the queue once the connection is closed.
    /// The subscription resources are released in every case.
    ///
    /// Stopping an idle consumer moves it straight to [`ConsumerStatus::Stopped`].
    /// Stopping a consumer that is already stopping or stopped does nothing.
    #[tracing::instrument(skip_all, name = "consumer_stop", fields(queue_name = %self.context.queue_name))]
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let running = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, ConsumerState::Stopping) {
                ConsumerState::Running(running) => running,
                ConsumerState::Idle => {
                    *state = ConsumerState::Stopped;
                    return Ok(());
                }
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        self.shut_down(running).await;

        *self.state.lock().await = ConsumerState::Stopped;
        tracing::info!(
            queue_name = %self.context.queue_name,
            "Connection with the message broker closed"
        );
        Ok(())
    }

    async fn shut_down(&self, running: RunningConsumer) {
        let RunningConsumer {
            shutdown,
            mut dispatcher,
            mut workers,
            resources,
        } = running;
        let grace_period = self.options.shutdown_grace_period;
        let _ = shutdown.send(true);

        match tokio::time::timeout(grace_period, &mut dispatcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.report_transport_fault(anyhow::Error::from(e).context("The dispatcher crashed."));
            }
            Err(_) => {
                dispatcher.abort();
                self.report_transport_fault(anyhow::anyhow!(
                    "The dispatcher did not stop within {:?}.",
                    grace_period
                ));
            }
        }

        // The dispatcher has dropped its end of the internal queue: workers exit once it is drained.
        let drained = tokio::time::timeout(
            grace_period,
            futures_util::future::join_all(workers.iter_mut()),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(
                queue_name = %self.context.queue_name,
                "In-flight messages were not settled within {:?}, aborting them",
                grace_period
            );
            for worker in &workers {
                worker.abort();
            }
        }

        // The dispatcher is gone, one way or another: whatever subscription it left behind is ours.
        if let Some(resources) = resources.take() {
            match tokio::time::timeout(grace_period, resources.release()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.report_transport_fault(e.context("Failed to release the subscription."));
                }
                Err(_) => self.report_transport_fault(anyhow::anyhow!(
                    "The subscription was not released within {:?}.",
                    grace_period
                )),
            }
        }
    }

    fn report_transport_fault(&self, error: anyhow::Error) {
        self.context
            .reporter
            .transport_fault(&self.context.queue_name, &error);
    }
}

enum PumpExit {
    Shutdown,
    /// `after_fault` is set when the last item of the stream was a transport fault: that fault
    /// is why the subscription ended and it has already been reported.
    StreamEnded { after_fault: bool },
}

/// Move deliveries from the subscription into the internal queue, resubscribing if the
/// subscription dies on us.
///
/// The resources of the live subscription are kept in `resources`. On shutdown, delivery is
/// cancelled but the resources are left in place for [`QueueConsumer::stop`] to release.
async fn dispatch<T: Transport, H: Handler>(
    transport: Arc<T>,
    context: Arc<ProcessingContext<H>>,
    options: ConsumerOptions,
    mut deliveries: DeliveryStream,
    resources: ActiveResources,
    sender: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue_name = context.queue_name.as_str();
    // A dropped sender means the consumer itself is gone: stop as well.
    let shutdown_signal = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    }
    .fuse();
    tokio::pin!(shutdown_signal);

    loop {
        let exit = pump(&mut deliveries, &sender, &context, &mut shutdown_signal).await;
        drop(deliveries);

        match exit {
            PumpExit::Shutdown => {
                tracing::info!(queue_name = %queue_name, "Consumer received shutdown event");
                if let Some(active) = resources.current() {
                    if let Err(e) = active.cancel_delivery().await {
                        context.reporter.transport_fault(
                            queue_name,
                            &e.context("Failed to cancel the subscription."),
                        );
                    }
                }
                return;
            }
            PumpExit::StreamEnded { after_fault } => {
                if !after_fault {
                    context.reporter.transport_fault(
                        queue_name,
                        &anyhow::anyhow!("The broker closed the subscription unexpectedly."),
                    );
                }
                if let Some(dead) = resources.take() {
                    if let Err(e) = dead.release().await {
                        context.reporter.transport_fault(
                            queue_name,
                            &e.context("Failed to release the dead subscription."),
                        );
                    }
                }
            }
        }

        let mut backoff = options.initial_reconnect_backoff;
        deliveries = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_signal => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match transport.subscribe(queue_name, options.prefetch_count).await {
                Ok(Subscription {
                    deliveries,
                    resources: subscription_resources,
                }) => {
                    resources.set(subscription_resources);
                    tracing::info!(queue_name = %queue_name, "Subscription re-established");
                    break deliveries;
                }
                Err(e) => {
                    context
                        .reporter
                        .transport_fault(queue_name, &anyhow::Error::from(e));
                    backoff = (backoff * 2).min(options.max_reconnect_backoff);
                }
            }
        };
    }
}

async fn pump<H: Handler>(
    deliveries: &mut DeliveryStream,
    sender: &mpsc::Sender<Delivery>,
    context: &ProcessingContext<H>,
    shutdown_signal: &mut (impl FusedFuture + Unpin),
) -> PumpExit {
    let mut after_fault = false;
    loop {
        // Prefer the handling of shutdowns before going on with processing more messages.
        let delivery = tokio::select! {
            biased;
            _ = &mut *shutdown_signal => return PumpExit::Shutdown,
            event = deliveries.next() => match event {
                None => return PumpExit::StreamEnded { after_fault },
                Some(Err(e)) => {
                    context.reporter.transport_fault(&context.queue_name, &e);
                    after_fault = true;
                    continue;
                }
                Some(Ok(delivery)) => delivery,
            },
        };
        after_fault = false;

        // The internal queue is bounded: wait for a worker to be free, unless we are asked to stop.
        // A message dropped here was never settled - the broker will redeliver it.
        tokio::select! {
            biased;
            _ = &mut *shutdown_signal => return PumpExit::Shutdown,
            sent = sender.send(delivery) => {
                if sent.is_err() {
                    return PumpExit::Shutdown;
                }
            }
        }
    }
}

/// Pull messages from the internal queue until it is closed and drained.
async fn work<H: Handler>(
    context: Arc<ProcessingContext<H>>,
    receiver: Arc<Mutex<mpsc::Receiver<Delivery>>>,
) {
    loop {
        let delivery = receiver.lock().await.recv().await;
        match delivery {
            Some(delivery) => process(&context, delivery).await,
            None => break,
        }
    }
}

/// Process an incoming message - handler, reporting, ack/nack against the broker.
#[tracing::instrument(
    name = "process_message",
    skip_all,
    fields(queue_name = %context.queue_name, message_id = ?delivery.message_id),
    level = tracing::Level::DEBUG
)]
async fn process<H: Handler>(context: &ProcessingContext<H>, delivery: Delivery) {
    let incoming = Incoming {
        message: delivery,
        queue_name: context.queue_name.clone(),
    };
    let queue_name = context.queue_name.as_str();

    // Failing to process one message (even with a panic!) does not tear the whole consumer down.
    let outcome = AssertUnwindSafe(context.handler.handle(&incoming))
        .catch_unwind()
        .await;

    let message = &incoming.message;
    let message_id = message.message_id.as_deref();
    let disposition = match outcome {
        Ok(outcome) => {
            let disposition =
                ack_or_nack(context.transient_error_hook.as_ref(), message, &outcome).await;
            if let Err(e) = &outcome {
                context.reporter.processing_fault(&ProcessingFault {
                    queue_name,
                    message_id,
                    kind: match e.error_type {
                        ErrorType::Fatal => FaultKind::Fatal,
                        ErrorType::Transient => FaultKind::Transient,
                    },
                    disposition,
                    error: &e.inner_error,
                });
            }
            disposition
        }
        Err(payload) => {
            let disposition = BrokerAction::Ack;
            context.reporter.processing_fault(&ProcessingFault {
                queue_name,
                message_id,
                kind: FaultKind::Panic,
                disposition,
                error: &HandlerPanic::from_payload(payload),
            });
            disposition
        }
    };

    if let Err(e) = disposition.execute(message.acker.as_ref()).await {
        context.reporter.processing_fault(&ProcessingFault {
            queue_name,
            message_id,
            kind: FaultKind::Acknowledgement,
            disposition,
            error: &*e,
        });
    }
}
