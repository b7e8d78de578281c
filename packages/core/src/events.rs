//! Volume notifications.
//!
//! Observers are called synchronously, in registration order, on the thread
//! that drives the registry.

use serde::Serialize;

use crate::volume::Volume;

/// A change to the tracked volume set. Each event carries a snapshot of the
/// volume as it is after the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "volume", rename_all = "lowercase")]
pub enum VolumeEvent {
    Added(Volume),
    Removed(Volume),
    Changed(Volume),
    /// Removable media left the drive.
    Ejected(Volume),
}

impl VolumeEvent {
    pub fn volume(&self) -> &Volume {
        match self {
            VolumeEvent::Added(v)
            | VolumeEvent::Removed(v)
            | VolumeEvent::Changed(v)
            | VolumeEvent::Ejected(v) => v,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VolumeEvent::Added(_) => "added",
            VolumeEvent::Removed(_) => "removed",
            VolumeEvent::Changed(_) => "changed",
            VolumeEvent::Ejected(_) => "ejected",
        }
    }
}

/// Receives volume events.
pub trait VolumeObserver {
    fn notify(&mut self, event: &VolumeEvent);
}

impl<F> VolumeObserver for F
where
    F: FnMut(&VolumeEvent),
{
    fn notify(&mut self, event: &VolumeEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered observer list.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<(SubscriptionId, Box<dyn VolumeObserver>)>,
    next_id: u64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl VolumeObserver + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Removes an observer. Returns false if the id is unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn emit(&mut self, event: &VolumeEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer.notify(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }
}
