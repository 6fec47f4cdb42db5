//! Event Broadcaster: fan-out of committed order events to live dashboards.
//!
//! Delivery is at-most-once per subscriber. A subscriber that falls more than
//! the channel capacity behind loses the overflow, logs how many events it
//! skipped, and relies on polling to converge. Events for one order reach
//! every subscriber in commit order because the order's actor is the only
//! publisher for that order.

use std::pin::Pin;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::event::{EventEnvelope, Scope};

/// Default number of envelopes buffered per subscriber.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Publishing side of the event channel. `Clone` is cheap.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<EventEnvelope>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an envelope to every current subscriber.
    ///
    /// Returns the number of subscribers the envelope was queued for.
    /// Publishing with nobody listening is not an error.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        match self.sender.send(envelope) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(envelope)) => {
                tracing::debug!(
                    event_type = %envelope.event_type,
                    order_id = %envelope.order_id,
                    "no subscribers for event"
                );
                0
            }
        }
    }

    /// Subscribe to every event in `scope` published from now on.
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        Subscription {
            scope,
            rx: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

/// A scoped live feed of order events.
#[derive(Debug)]
pub struct Subscription {
    scope: Scope,
    rx: broadcast::Receiver<EventEnvelope>,
}

impl Subscription {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Wait for the next event in scope.
    ///
    /// Returns `None` once the broadcaster is gone. Lagging is logged and
    /// skipped over, never surfaced as an error.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.scope.matches(&envelope) => return Some(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        scope = %self.scope.key(),
                        skipped,
                        "subscriber lagged, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of in-scope envelopes with the same lag
    /// handling as [`recv`](Subscription::recv).
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = EventEnvelope> + Send>> {
        let scope = self.scope;
        let key = scope.key();
        Box::pin(
            BroadcastStream::new(self.rx).filter_map(move |item| match item {
                Ok(envelope) => scope.matches(&envelope).then_some(envelope),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(scope = %key, skipped, "subscriber lagged, events dropped");
                    None
                }
            }),
        )
    }
}
