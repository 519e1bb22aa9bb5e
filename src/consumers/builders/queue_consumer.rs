use crate::consumers::consumer::ConsumerOptions;
use crate::consumers::hooks::transient_error::NeverRequeue;
use crate::consumers::{ConsumerTransientErrorHook, Handler, QueueConsumer};
use crate::reporting::{ErrorReporter, TracingErrorReporter};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

impl<T: Transport, H: Handler> QueueConsumer<T, H> {
    /// Start building a [`QueueConsumer`].
    ///
    /// You need to provide the name of the queue you want to consume messages from, the
    /// transport to reach the broker and the handler that will process each message.
    pub fn builder(
        queue_name: impl Into<String>,
        transport: T,
        handler: H,
    ) -> QueueConsumerBuilder<T, H> {
        QueueConsumerBuilder::new(queue_name.into(), Arc::new(transport), Arc::new(handler))
    }
}

/// A builder to configure a [`QueueConsumer`] with a fluent API.
///
/// Use [`QueueConsumer::builder`] as entrypoint.
pub struct QueueConsumerBuilder<T: Transport, H: Handler> {
    queue_name: String,
    transport: Arc<T>,
    handler: Arc<H>,
    transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
    reporter: Arc<dyn ErrorReporter>,
    options: ConsumerOptions,
}

impl<T: Transport, H: Handler> QueueConsumerBuilder<T, H> {
    pub(crate) const DEFAULT_PREFETCH_COUNT: u16 = 50;
    pub(crate) const DEFAULT_CONCURRENCY: usize = 10;
    pub(crate) const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

    fn new(queue_name: String, transport: Arc<T>, handler: Arc<H>) -> Self {
        Self {
            queue_name,
            transport,
            handler,
            transient_error_hook: Arc::new(NeverRequeue),
            reporter: Arc::new(TracingErrorReporter),
            options: ConsumerOptions {
                prefetch_count: Self::DEFAULT_PREFETCH_COUNT,
                concurrency: Self::DEFAULT_CONCURRENCY,
                shutdown_grace_period: Self::DEFAULT_SHUTDOWN_GRACE_PERIOD,
                initial_reconnect_backoff: Duration::from_secs(1),
                max_reconnect_backoff: Duration::from_secs(30),
            },
        }
    }

    /// The maximum number of unsettled messages the broker will push to us at any point in time.
    ///
    /// Defaults to 50.
    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.options.prefetch_count = prefetch_count;
        self
    }

    /// How many messages can be processed concurrently. It can't be lower than 1.
    ///
    /// Defaults to 10.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency.max(1);
        self
    }

    /// How long [`QueueConsumer::stop`] waits for in-flight messages before giving up on them.
    ///
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn with_shutdown_grace_period(mut self, grace_period: Duration) -> Self {
        self.options.shutdown_grace_period = grace_period;
        self
    }

    /// How long to wait before trying to resubscribe when the broker drops the subscription.
    /// The delay doubles after every failed attempt, up to `max`.
    ///
    /// Defaults to 1 second, up to 30 seconds.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.options.initial_reconnect_backoff = initial;
        self.options.max_reconnect_backoff = max.max(initial);
        self
    }

    /// Decide what happens to messages whose processing failed with a transient error.
    ///
    /// Check out [`ConsumerTransientErrorHook`]'s documentation for more details.
    /// If not specified, messages are acknowledged and dropped ([`NeverRequeue`]).
    #[must_use]
    pub fn transient_error_hook<K: ConsumerTransientErrorHook>(self, hook: K) -> Self {
        self.dyn_transient_error_hook(Arc::new(hook))
    }

    /// Dynamic version of [`QueueConsumerBuilder::transient_error_hook`].
    #[must_use]
    pub fn dyn_transient_error_hook(mut self, hook: Arc<dyn ConsumerTransientErrorHook>) -> Self {
        self.transient_error_hook = hook;
        self
    }

    /// Where processing and transport faults are reported.
    ///
    /// If not specified, faults are emitted as `tracing` events ([`TracingErrorReporter`]).
    #[must_use]
    pub fn error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn build(self) -> QueueConsumer<T, H> {
        QueueConsumer::new(
            self.queue_name,
            self.transport,
            self.handler,
            self.transient_error_hook,
            self.reporter,
            self.options,
        )
    }
}
