//! A collection of transient error hooks.

use crate::consumers::{ConsumerTransientErrorHook, Delivery, ShouldRequeue};

/// Never requeue a message that failed with a transient error: acknowledge it and move on.
///
/// This is the default hook. A store outage therefore loses the messages processed while it
/// lasts - pick [`RequeueUntil`] if that is not acceptable.
pub struct NeverRequeue;

#[async_trait::async_trait]
impl ConsumerTransientErrorHook for NeverRequeue {
    async fn on_transient_error(&self, _delivery: &Delivery) -> ShouldRequeue {
        ShouldRequeue::Discard
    }
}

/// Always requeue a message that failed with a transient error.
pub struct AlwaysRequeue;

#[async_trait::async_trait]
impl ConsumerTransientErrorHook for AlwaysRequeue {
    async fn on_transient_error(&self, _delivery: &Delivery) -> ShouldRequeue {
        ShouldRequeue::Requeue
    }
}

/// Requeue a message that failed with a transient error until it has been delivered
/// `max_deliveries` times, then dead-letter it.
///
/// The delivery count comes from the broker when available (e.g. `x-delivery-count` on quorum
/// queues). Otherwise the `redelivered` flag is the best we can do: it tells us the message has
/// been delivered at least twice.
pub struct RequeueUntil {
    pub max_deliveries: u64,
}

impl RequeueUntil {
    fn deliveries_so_far(delivery: &Delivery) -> u64 {
        match delivery.delivery_count {
            Some(count) => count,
            None if delivery.redelivered => 2,
            None => 1,
        }
    }
}

#[async_trait::async_trait]
impl ConsumerTransientErrorHook for RequeueUntil {
    async fn on_transient_error(&self, delivery: &Delivery) -> ShouldRequeue {
        if Self::deliveries_so_far(delivery) < self.max_deliveries {
            ShouldRequeue::Requeue
        } else {
            ShouldRequeue::DeadLetterOrDiscard
        }
    }
}
