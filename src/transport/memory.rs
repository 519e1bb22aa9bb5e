use crate::consumers::{BrokerAction, Delivery};
use crate::transport::{Acker, ConnectionError, Subscription, Transport, TransportResources};
use anyhow::anyhow;
use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

type QueueItem = Result<Delivery, anyhow::Error>;

/// An in-process broker.
///
/// Messages published on a queue are pushed to whoever is subscribed to it; unsettled messages
/// stay in the queue across subscriptions. Every settlement is recorded, which makes
/// `MemoryTransport` handy to observe what a consumer did with each message.
///
/// Cloning a `MemoryTransport` gives you another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

/// A settlement instruction received by a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDisposition {
    pub queue_name: String,
    pub message_id: String,
    pub action: BrokerAction,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    dispositions: Mutex<Vec<RecordedDisposition>>,
    dead_letters: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: AtomicUsize,
    releases: AtomicUsize,
    unreachable: AtomicBool,
    failing_acknowledgements: AtomicBool,
}

struct MemoryQueue {
    sender: mpsc::UnboundedSender<QueueItem>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
    active_subscription: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

#[derive(Clone)]
struct Envelope {
    queue_name: String,
    message_id: String,
    data: Vec<u8>,
    delivery_count: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn queue(&self, queue_name: &str) -> Arc<MemoryQueue> {
        lock(&self.queues)
            .entry(queue_name.to_owned())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Arc::new(MemoryQueue {
                    sender,
                    receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                    active_subscription: Mutex::new(None),
                })
            })
            .clone()
    }

    fn enqueue(self: &Arc<Self>, envelope: Envelope) {
        let queue = self.queue(&envelope.queue_name);
        let delivery = Delivery::new(
            envelope.data.clone(),
            MemoryAcker {
                broker: Arc::downgrade(self),
                envelope: envelope.clone(),
                settled: AtomicBool::new(false),
            },
        )
        .with_message_id(envelope.message_id.clone())
        .with_delivery_count(envelope.delivery_count)
        .with_redelivered(envelope.delivery_count > 1);
        // The queue owns its receiver, the channel cannot be closed.
        let _ = queue.sender.send(Ok(delivery));
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a message on `queue_name`, returning the id assigned to it.
    pub fn publish(&self, queue_name: &str, body: impl Into<Vec<u8>>) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.inner.enqueue(Envelope {
            queue_name: queue_name.to_owned(),
            message_id: message_id.clone(),
            data: body.into(),
            delivery_count: 1,
        });
        message_id
    }

    /// Surface a transport fault on the delivery stream of `queue_name`.
    pub fn inject_fault(&self, queue_name: &str, error: anyhow::Error) {
        let _ = self.inner.queue(queue_name).sender.send(Err(error));
    }

    /// Terminate the active subscription on `queue_name`, as a dropped connection would.
    pub fn disconnect(&self, queue_name: &str) {
        let queue = self.inner.queue(queue_name);
        let active = lock(&queue.active_subscription).take();
        if let Some(active) = active {
            let _ = active.send(true);
        }
    }

    /// While `true`, every subscription attempt fails.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// While `true`, every ack/nack/reject fails.
    pub fn fail_acknowledgements(&self, failing: bool) {
        self.inner
            .failing_acknowledgements
            .store(failing, Ordering::SeqCst);
    }

    /// All the settlement instructions received so far, in order.
    pub fn dispositions(&self) -> Vec<RecordedDisposition> {
        lock(&self.inner.dispositions).clone()
    }

    /// The settlement instructions received so far for a specific message.
    pub fn dispositions_for(&self, message_id: &str) -> Vec<BrokerAction> {
        lock(&self.inner.dispositions)
            .iter()
            .filter(|d| d.message_id == message_id)
            .map(|d| d.action)
            .collect()
    }

    /// The payloads of the messages that were rejected, by queue.
    pub fn dead_letters(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.inner.dead_letters).clone()
    }

    /// How many subscriptions have been established.
    pub fn subscriptions(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// How many times subscription resources have been released.
    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        queue_name: &str,
        _prefetch_count: u16,
    ) -> Result<Subscription, ConnectionError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::new(
                queue_name,
                anyhow!("The in-memory broker is unreachable."),
            ));
        }
        let queue = self.inner.queue(queue_name);
        let (cancel, cancelled) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let previous = lock(&queue.active_subscription).replace(cancel.clone());
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);

        let deliveries = stream::unfold(
            (queue.receiver.clone(), cancelled),
            |(receiver, mut cancelled)| async move {
                let item = {
                    let mut receiver = receiver.lock().await;
                    'next: loop {
                        if *cancelled.borrow() {
                            break 'next None;
                        }
                        tokio::select! {
                            biased;
                            changed = cancelled.changed() => {
                                if changed.is_err() {
                                    break 'next None;
                                }
                            }
                            item = receiver.recv() => break 'next item,
                        }
                    }
                };
                item.map(|item| (item, (receiver, cancelled)))
            },
        )
        .boxed();

        Ok(Subscription {
            deliveries,
            resources: Box::new(MemoryResources {
                broker: self.inner.clone(),
                cancel,
            }),
        })
    }
}

struct MemoryResources {
    broker: Arc<Inner>,
    cancel: Arc<watch::Sender<bool>>,
}

#[async_trait::async_trait]
impl TransportResources for MemoryResources {
    async fn cancel_delivery(&self) -> Result<(), anyhow::Error> {
        let _ = self.cancel.send(true);
        Ok(())
    }

    async fn release(&self) -> Result<(), anyhow::Error> {
        let _ = self.cancel.send(true);
        self.broker.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Weak<Inner>,
    envelope: Envelope,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, action: BrokerAction) -> Result<(), anyhow::Error> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| anyhow!("The in-memory broker is gone."))?;
        if self.settled.swap(true, Ordering::SeqCst) {
            anyhow::bail!(
                "Message {} has already been settled.",
                self.envelope.message_id
            );
        }
        // A refused settlement loses the message rather than redelivering it.
        if broker.failing_acknowledgements.load(Ordering::SeqCst) {
            anyhow::bail!("The in-memory broker refused to {action} the message.");
        }
        lock(&broker.dispositions).push(RecordedDisposition {
            queue_name: self.envelope.queue_name.clone(),
            message_id: self.envelope.message_id.clone(),
            action,
        });
        match action {
            BrokerAction::Ack => {}
            BrokerAction::Nack => {
                let mut envelope = self.envelope.clone();
                envelope.delivery_count += 1;
                broker.enqueue(envelope);
            }
            BrokerAction::Reject => lock(&broker.dead_letters).push((
                self.envelope.queue_name.clone(),
                self.envelope.data.clone(),
            )),
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    // Like a closed channel: a delivery dropped without being settled goes back to the queue.
    fn drop(&mut self) {
        if *self.settled.get_mut() {
            return;
        }
        if let Some(broker) = self.broker.upgrade() {
            let mut envelope = self.envelope.clone();
            envelope.delivery_count += 1;
            broker.enqueue(envelope);
        }
    }
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.settle(BrokerAction::Ack)
    }

    async fn nack(&self) -> Result<(), anyhow::Error> {
        self.settle(BrokerAction::Nack)
    }

    async fn reject(&self) -> Result<(), anyhow::Error> {
        self.settle(BrokerAction::Reject)
    }
}
