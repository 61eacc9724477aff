//! Per-key fan-out of job events
//!
//! Every in-flight job has one broadcast channel; each subscriber owns its
//! receiver. Publishing never waits on a slow subscriber: a lagging receiver
//! skips the oldest events and keeps going. The terminal event is the last
//! message before the sender is dropped, so even a lagged subscriber drains
//! to it before observing the closed channel.

use std::collections::HashMap;
use std::sync::Mutex;

use figc_proto::Event;
use tokio::sync::broadcast;

/// Bounded per-subscriber queue depth.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 256;

pub(crate) struct Broker {
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl Broker {
    pub(crate) fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the in-flight job for `key`, creating the channel when
    /// there is none. Returns the receiver and whether this call created
    /// the channel (the caller then owns starting the runner).
    pub(crate) fn subscribe_or_create(&self, key: &str) -> (broadcast::Receiver<Event>, bool) {
        let mut channels = self.channels.lock().expect("broker lock poisoned");
        if let Some(tx) = channels.get(key) {
            return (tx.subscribe(), false);
        }
        let (tx, rx) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        channels.insert(key.to_string(), tx);
        (rx, true)
    }

    /// Publish a non-terminal event to every current subscriber of `key`.
    /// A missing key (job already finished) is a no-op.
    pub(crate) fn publish(&self, key: &str, event: Event) {
        let channels = self.channels.lock().expect("broker lock poisoned");
        if let Some(tx) = channels.get(key) {
            let _ = tx.send(event);
        }
    }

    /// Publish the terminal event and close the key.
    ///
    /// Removal and the final send happen under one lock, so a concurrent
    /// `subscribe_or_create` either attaches before the terminal event is
    /// sent or finds no entry and re-checks the filesystem.
    pub(crate) fn finish(&self, key: &str, terminal: Event) {
        let mut channels = self.channels.lock().expect("broker lock poisoned");
        if let Some(tx) = channels.remove(key) {
            let _ = tx.send(terminal);
        }
    }
}
