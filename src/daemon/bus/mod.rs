use crate::store::TaskEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};


const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// What a subscriber receives: a real task event, or a synthetic gap marker
/// meaning events were dropped and the consumer should reconcile via a full
/// event fetch.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(TaskEvent),
    Gap { dropped: u64 },
}

/// One delivery to one subscriber. `seq` is per-subscriber, strictly
/// monotonic from 0, and never reordered.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub seq: u64,
    pub message: BusMessage,
}

struct Subscriber {
    tx: mpsc::Sender<BusEvent>,
    seq: u64,
    dropped: u64,
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<BusEvent>,
}

/// Fan-out bus with per-subscriber bounded queues.
///
/// Publishing never blocks and never back-pressures the publisher: when a
/// subscriber's queue is full, events are dropped and a gap marker is
/// delivered once space frees up.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(2),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(
            id,
            Subscriber {
                tx,
                seq: 0,
                dropped: 0,
            },
        );
        debug!("event bus: subscriber {id} attached");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
        debug!("event bus: subscriber {id} detached");
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver an event to every subscriber. Queue overflow drops the event
    /// for that subscriber and schedules a gap marker; a closed receiver
    /// removes the subscriber.
    pub fn publish(&self, event: &TaskEvent) {
        let mut subscribers = self.lock();
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter_mut() {
            // Pending gap first, so the consumer sees the hole before newer events
            if sub.dropped > 0 {
                let gap = BusEvent {
                    seq: sub.seq,
                    message: BusMessage::Gap {
                        dropped: sub.dropped,
                    },
                };
                match sub.tx.try_send(gap) {
                    Ok(()) => {
                        sub.seq += 1;
                        sub.dropped = 0;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Still no room; this event joins the gap
                        sub.dropped += 1;
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                        continue;
                    }
                }
            }

            let delivery = BusEvent {
                seq: sub.seq,
                message: BusMessage::Event(event.clone()),
            };
            match sub.tx.try_send(delivery) {
                Ok(()) => sub.seq += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("event bus: subscriber {id} overflowed, dropping");
                    sub.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
