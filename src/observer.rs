use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::aggregates::AggregateSnapshot;
use crate::error::TrackerError;
use crate::types::TrackerState;

/// Receives coordinator notifications. Callbacks run on the coordinator's
/// intake task and must not block.
pub trait SessionObserver: Send + Sync {
    fn on_aggregates_changed(&self, aggregates: &AggregateSnapshot);

    fn on_error(&self, error: &TrackerError);

    fn on_state_changed(&self, _state: TrackerState) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Signals as plain values, for observers that prefer a channel
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerSignal {
    AggregatesChanged(AggregateSnapshot),
    Error(TrackerError),
    StateChanged(TrackerState),
}

/// Forwards every notification into an unbounded tokio channel
pub struct ChannelObserver {
    tx: UnboundedSender<TrackerSignal>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, UnboundedReceiver<TrackerSignal>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionObserver for ChannelObserver {
    fn on_aggregates_changed(&self, aggregates: &AggregateSnapshot) {
        let _ = self
            .tx
            .send(TrackerSignal::AggregatesChanged(aggregates.clone()));
    }

    fn on_error(&self, error: &TrackerError) {
        let _ = self.tx.send(TrackerSignal::Error(error.clone()));
    }

    fn on_state_changed(&self, state: TrackerState) {
        let _ = self.tx.send(TrackerSignal::StateChanged(state));
    }
}

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Arc<dyn SessionObserver>)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, observer));
        }
        id
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers
            .lock()
            .ok()
            .map(|mut observers| {
                let before = observers.len();
                observers.retain(|(existing, _)| *existing != id);
                observers.len() != before
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Callbacks run on a copy of the list so an observer may unsubscribe itself
    fn current(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers
            .lock()
            .map(|observers| observers.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default()
    }

    pub fn notify_aggregates(&self, aggregates: &AggregateSnapshot) {
        for observer in self.current() {
            observer.on_aggregates_changed(aggregates);
        }
    }

    pub fn notify_error(&self, error: &TrackerError) {
        for observer in self.current() {
            observer.on_error(error);
        }
    }

    pub fn notify_state(&self, state: TrackerState) {
        for observer in self.current() {
            observer.on_state_changed(state);
        }
    }
}
