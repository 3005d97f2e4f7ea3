//! Fan-out of graph notifications to the engine
//!
//! Lifecycle events go out on a broadcast channel; stream announcements go
//! to each live stream subscription, tracked by handle so a subscriber can be
//! removed exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};
use patchbay_core::domain::graph::{
    GraphError, GraphEvent, Result, StreamInfo, StreamSubscription, SubscriptionHandle,
};

const LIFECYCLE_CAPACITY: usize = 64;

pub struct EventHub {
    lifecycle: broadcast::Sender<GraphEvent>,
    subscribers: Mutex<HashMap<SubscriptionHandle, mpsc::UnboundedSender<StreamInfo>>>,
    next_handle: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            lifecycle,
            subscribers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<GraphEvent> {
        self.lifecycle.subscribe()
    }

    /// Publish a device lifecycle event
    pub fn publish(&self, event: GraphEvent) {
        trace!(?event, "Publishing lifecycle event");
        if self.lifecycle.send(event).is_err() {
            debug!("No lifecycle listeners");
        }
    }

    pub fn subscribe(&self) -> StreamSubscription {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(handle, tx);
        debug!(handle = handle.0, "Stream subscription added");

        StreamSubscription { handle, events: rx }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        match self.lock().remove(&handle) {
            Some(_) => {
                debug!(handle = handle.0, "Stream subscription removed");
                Ok(())
            }
            None => Err(GraphError::Subscription(format!(
                "unknown subscription handle {}",
                handle.0
            ))),
        }
    }

    /// Deliver a stream announcement; returns how many subscribers got it
    pub fn announce(&self, stream: StreamInfo) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|_, tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in subscribers.values() {
            if tx.send(stream.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(stream = %stream.name, delivered, "Stream announced");
        delivered
    }

    /// Subscriptions whose receiver is still alive
    pub fn subscriber_count(&self) -> usize {
        self.lock().values().filter(|tx| !tx.is_closed()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionHandle, mpsc::UnboundedSender<StreamInfo>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
