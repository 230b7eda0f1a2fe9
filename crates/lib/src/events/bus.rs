//! Fan-out pub/sub: every subscriber callback sees every notification, in
//! subscribe order. Filtering is the subscriber's business.

use std::sync::{Arc, RwLock};

/// Delivery callback: `(payload, session tag)`.
pub type Callback<T> = Arc<dyn Fn(&T, Option<&str>) + Send + Sync>;

pub struct EventBus<T> {
    subscribers: RwLock<Vec<(String, Callback<T>)>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Add a subscriber. Re-subscribing an existing id replaces its callback in place.
    /// Returns the number of subscribers afterwards.
    pub fn subscribe<F>(&self, id: impl Into<String>, callback: F) -> usize
    where
        F: Fn(&T, Option<&str>) + Send + Sync + 'static,
    {
        let id = id.into();
        let callback: Callback<T> = Arc::new(callback);
        let mut g = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        match g.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = callback,
            None => g.push((id, callback)),
        }
        g.len()
    }

    /// Remove a subscriber; unknown ids are ignored. Returns the number left,
    /// so callers can tear down when it reaches zero.
    pub fn unsubscribe(&self, id: &str) -> usize {
        let mut g = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        g.retain(|(existing, _)| existing != id);
        g.len()
    }

    /// Deliver to the subscribers present right now. Callbacks run outside the lock.
    pub fn notify(&self, payload: &T, session: Option<&str>) {
        let snapshot: Vec<Callback<T>> = {
            let g = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            g.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in snapshot {
            cb(payload, session);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_bus() -> (EventBus<u32>, Arc<Mutex<Vec<(u32, u32)>>>) {
        (EventBus::new(), Arc::new(Mutex::new(Vec::new())))
    }

    fn record(seen: &Arc<Mutex<Vec<(u32, u32)>>>, id: u32) -> impl Fn(&u32, Option<&str>) + Send + Sync {
        let seen = seen.clone();
        move |payload: &u32, _tag: Option<&str>| seen.lock().unwrap().push((id, *payload))
    }

    #[test]
    fn delivers_in_subscribe_order() {
        let (bus, seen) = recording_bus();
        for id in [1, 2, 3] {
            bus.subscribe(id.to_string(), record(&seen, id));
        }
        bus.notify(&7, None);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn unsubscribed_ids_stop_receiving() {
        let (bus, seen) = recording_bus();
        for id in [1, 2, 3] {
            bus.subscribe(id.to_string(), record(&seen, id));
        }
        assert_eq!(bus.unsubscribe("2"), 2);
        bus.notify(&8, None);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 8), (3, 8)]);
    }

    #[test]
    fn notify_without_subscribers_is_noop() {
        let bus: EventBus<u32> = EventBus::new();
        bus.notify(&1, Some("A"));
        assert!(bus.is_empty());
    }

    #[test]
    fn unknown_unsubscribe_is_noop_and_reports_zero() {
        let (bus, seen) = recording_bus();
        bus.subscribe("1", record(&seen, 1));
        assert_eq!(bus.unsubscribe("nope"), 1);
        assert_eq!(bus.unsubscribe("1"), 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn resubscribe_keeps_position() {
        let (bus, seen) = recording_bus();
        bus.subscribe("1", record(&seen, 1));
        bus.subscribe("2", record(&seen, 2));
        bus.subscribe("1", record(&seen, 10));
        bus.notify(&3, None);
        assert_eq!(*seen.lock().unwrap(), vec![(10, 3), (2, 3)]);
    }

    #[test]
    fn session_tag_is_passed_through() {
        let bus: EventBus<&'static str> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe("x", move |p: &&'static str, tag| {
            s.lock().unwrap().push((p.to_string(), tag.map(str::to_string)))
        });
        bus.notify(&"hello", Some("A"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("hello".to_string(), Some("A".to_string()))]
        );
    }
}
