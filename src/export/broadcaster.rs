use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::types::{
    CompletePayload, ErrorPayload, ExportEvent, ProgressPayload, StatusPayload,
};

/// Capacity of each subscriber inbox. Sized to absorb a burst of progress
/// samples; terminal `status`/`complete` events are emitted after producers
/// drain, so a full inbox only ever costs advisory samples.
pub const SUBSCRIBER_INBOX_CAPACITY: usize = 100;

type SubscriberId = u64;

struct SubscriberHandle {
    transport_id: String,
    tx: mpsc::Sender<ExportEvent>,
    closed: CancellationToken,
}

/// An attached observer of one transport's events.
///
/// Consume `rx` until it closes; `closed` fires when the broadcaster is shut
/// down (or the subscriber is unregistered), letting consumers unwind without
/// waiting on a half-open channel.
pub struct Subscriber {
    pub id: SubscriberId,
    pub transport_id: String,
    pub rx: mpsc::Receiver<ExportEvent>,
    pub closed: CancellationToken,
}

/// Fans export events out to subscribed observers, filtered by transport id.
///
/// Delivery is a non-blocking try-send per subscriber: a full inbox drops the
/// event for that subscriber only, never blocking producers or delaying
/// delivery to anyone else. Cloning shares the subscriber table.
#[derive(Clone)]
pub struct EventBroadcaster {
    subscribers: Arc<Mutex<HashMap<SubscriberId, SubscriberHandle>>>,
    next_id: Arc<AtomicU64>,
    shut_down: Arc<AtomicBool>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a new subscriber for `transport_id`. The subscriber is visible
    /// to broadcasts as soon as this returns.
    pub fn register(&self, transport_id: &str) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_INBOX_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let closed = CancellationToken::new();

        self.subscribers.lock().unwrap().insert(
            id,
            SubscriberHandle {
                transport_id: transport_id.to_string(),
                tx,
                closed: closed.clone(),
            },
        );

        debug!(subscriber_id = id, transport_id, "subscriber registered");

        Subscriber {
            id,
            transport_id: transport_id.to_string(),
            rx,
            closed,
        }
    }

    /// Detach and close a subscriber. Idempotent.
    pub fn unregister(&self, id: SubscriberId) {
        let removed = self.subscribers.lock().unwrap().remove(&id);
        if let Some(handle) = removed {
            handle.closed.cancel();
            debug!(subscriber_id = id, transport_id = %handle.transport_id, "subscriber unregistered");
        }
    }

    /// Deliver an event to every active subscriber whose transport matches.
    /// No-op after shutdown.
    pub fn broadcast(&self, event: ExportEvent) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        // Snapshot matching senders so no user channel is touched under the lock.
        let targets: Vec<(SubscriberId, mpsc::Sender<ExportEvent>)> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter()
                .filter(|(_, handle)| handle.transport_id == event.transport_id())
                .map(|(id, handle)| (*id, handle.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop this sample for this subscriber only.
                    trace!(subscriber_id = id, kind = event.kind(), "inbox full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            self.unregister(id);
        }
    }

    pub fn broadcast_progress(&self, payload: ProgressPayload) {
        self.broadcast(ExportEvent::Progress(payload));
    }

    pub fn broadcast_status(&self, payload: StatusPayload) {
        self.broadcast(ExportEvent::Status(payload));
    }

    pub fn broadcast_error(&self, payload: ErrorPayload) {
        self.broadcast(ExportEvent::Error(payload));
    }

    pub fn broadcast_complete(&self, payload: CompletePayload) {
        self.broadcast(ExportEvent::Complete(payload));
    }

    /// Number of attached subscribers (approximate under concurrent mutation).
    pub fn client_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    pub fn client_count_for(&self, transport_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .values()
            .filter(|handle| handle.transport_id == transport_id)
            .count()
    }

    /// Dispatcher lifecycle: waits for `ctx` to cancel, then closes every
    /// subscriber (termination signal fired, inbox closed) and makes further
    /// broadcasts no-ops.
    pub async fn run(&self, ctx: CancellationToken) {
        ctx.cancelled().await;
        self.shutdown();
    }

    /// Immediately close all subscribers and stop accepting broadcasts.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<SubscriberHandle> = {
            let mut subs = self.subscribers.lock().unwrap();
            subs.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.closed.cancel();
        }
        debug!(closed = drained.len(), "broadcaster shut down");
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
