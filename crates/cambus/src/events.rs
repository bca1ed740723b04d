//! Bus event subscriptions and the dispatch task
//!
//! Published events go through a bounded channel to one spawned dispatch
//! task, which invokes matching callbacks serially. Callbacks therefore run
//! on the dispatcher, never on the publishing task, and a slow callback
//! delays every event behind it. Keep them short.
//!
//! Each subscription carries a gate the dispatcher holds while invoking it.
//! [`EventCenter::unregister`] deactivates the subscription and then takes
//! the gate, so when it returns any in-flight invocation has finished and
//! no new one can start.

use cambus_core::{BusError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Event categories a callback can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEventKind {
    BusReset,
    Arrival,
    Removal,
}

/// A bus event as delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    BusReset,
    /// A camera appeared; the serial number survives identity reissue
    Arrival { serial_number: u32 },
    Removal { serial_number: u32 },
}

impl BusEvent {
    pub fn kind(&self) -> BusEventKind {
        match self {
            Self::BusReset => BusEventKind::BusReset,
            Self::Arrival { .. } => BusEventKind::Arrival,
            Self::Removal { .. } => BusEventKind::Removal,
        }
    }

    pub fn serial_number(&self) -> Option<u32> {
        match self {
            Self::BusReset => None,
            Self::Arrival { serial_number } | Self::Removal { serial_number } => {
                Some(*serial_number)
            }
        }
    }
}

/// Names one subscription for later unregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    slot: u32,
    generation: u32,
}

impl std::fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb{}@{}", self.slot, self.generation)
    }
}

type Callback = Box<dyn Fn(&BusEvent) + Send + Sync>;

struct Subscription {
    kind: BusEventKind,
    callback: Callback,
    active: AtomicBool,
    gate: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct SubscriptionSlot {
    generation: u32,
    subscription: Option<Arc<Subscription>>,
}

#[derive(Default)]
struct SubscriptionTable {
    slots: Vec<SubscriptionSlot>,
    free: Vec<u32>,
}

impl SubscriptionTable {
    fn insert(&mut self, subscription: Subscription) -> CallbackHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(SubscriptionSlot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.subscription = Some(Arc::new(subscription));
        CallbackHandle {
            slot,
            generation: entry.generation,
        }
    }

    fn remove(&mut self, handle: CallbackHandle) -> Option<Arc<Subscription>> {
        let entry = self.slots.get_mut(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let subscription = entry.subscription.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Some(subscription)
    }

    fn matching(&self, kind: BusEventKind) -> Vec<Arc<Subscription>> {
        self.slots
            .iter()
            .filter_map(|s| s.subscription.as_ref())
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.subscription.is_some()).count()
    }
}

enum Envelope {
    Event(BusEvent),
    /// Answered once everything queued ahead of it was dispatched
    Barrier(oneshot::Sender<()>),
}

type SharedTable = Arc<Mutex<SubscriptionTable>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, SubscriptionTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EventCenter {
    tx: mpsc::Sender<Envelope>,
    table: SharedTable,
    dispatcher: JoinHandle<()>,
}

impl EventCenter {
    /// Start the dispatch task. Must be called inside a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let table = SharedTable::default();
        let dispatcher = tokio::spawn(dispatch(rx, table.clone()));
        Self {
            tx,
            table,
            dispatcher,
        }
    }

    /// Subscribe `callback` to one event category. Any context the callback
    /// needs travels inside the closure.
    pub fn register<F>(&self, kind: BusEventKind, callback: F) -> CallbackHandle
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let handle = lock(&self.table).insert(Subscription {
            kind,
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            gate: tokio::sync::Mutex::new(()),
        });
        debug!(handle = %handle, kind = ?kind, "Registered bus event callback");
        handle
    }

    /// Remove a subscription, waiting out an invocation already running.
    /// Unknown or already removed handles are rejected.
    pub async fn unregister(&self, handle: CallbackHandle) -> Result<()> {
        let subscription = lock(&self.table).remove(handle).ok_or_else(|| {
            BusError::InvalidParameter(format!("unknown callback handle {}", handle))
        })?;

        subscription.active.store(false, Ordering::Release);
        drop(subscription.gate.lock().await);

        debug!(handle = %handle, "Unregistered bus event callback");
        Ok(())
    }

    /// Queue an event for delivery, waiting for room when the queue is full
    pub async fn publish(&self, event: BusEvent) -> Result<()> {
        trace!(event = ?event, "Queueing bus event");
        self.tx
            .send(Envelope::Event(event))
            .await
            .map_err(|_| BusError::Generic("event dispatcher has stopped".to_string()))
    }

    /// Resolve once every event published before this call was delivered
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Barrier(done_tx))
            .await
            .map_err(|_| BusError::Generic("event dispatcher has stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| BusError::Generic("event dispatcher has stopped".to_string()))
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.table).len()
    }
}

impl Drop for EventCenter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Envelope>, table: SharedTable) {
    while let Some(envelope) = rx.recv().await {
        let event = match envelope {
            Envelope::Event(event) => event,
            Envelope::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let subscribers = lock(&table).matching(event.kind());
        trace!(event = ?event, subscribers = subscribers.len(), "Dispatching bus event");

        for subscription in subscribers {
            let _gate = subscription.gate.lock().await;
            if !subscription.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.callback)(&event)));
            if outcome.is_err() {
                error!(event = ?event, "Bus event callback panicked");
            }
        }
    }
    debug!("Event dispatcher stopped");
}
