//! Publish/subscribe fan-out primitive.
//!
//! A [`Channel`] is the ordered subscriber list of a single topic. Callbacks are
//! identified by their `Arc` allocation, so registering the same callback twice
//! is detectable and rejected. Publishing is synchronous and isolates panics so
//! one misbehaving subscriber cannot starve the others.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tracing::error;

/// A subscriber callback for values of type `T`.
///
/// Identity is the allocation behind the `Arc`: clones of one callback are the
/// same subscriber, two separately created closures never are.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Errors raised while registering subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The identical callback is already registered (or pending) on this topic.
    #[error("subscriber is already registered on topic {topic}")]
    DuplicateSubscriber { topic: String },
}

/// Returns true if both callbacks point at the same allocation.
pub fn same_callback<T: ?Sized>(a: &Callback<T>, b: &Callback<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Invoke one callback, containing any panic it raises.
///
/// Returns `false` if the callback panicked.
pub fn deliver<T: ?Sized>(topic: &str, callback: &Callback<T>, value: &T) -> bool {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| callback(value)));
    if delivered.is_err() {
        error!(topic, "Subscriber panicked while handling a delivery");
    }
    delivered.is_ok()
}

/// Deliver `value` to each callback in order.
pub fn publish_all<T: ?Sized>(topic: &str, subscribers: &[Callback<T>], value: &T) {
    for subscriber in subscribers {
        deliver(topic, subscriber, value);
    }
}

/// Ordered subscriber list for one topic.
pub struct Channel<T: ?Sized> {
    topic: &'static str,
    subscribers: Vec<Callback<T>>,
}

impl<T: ?Sized> Channel<T> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            subscribers: Vec::new(),
        }
    }

    /// Register a callback. Rejects a callback that is already registered.
    pub fn subscribe(&mut self, callback: Callback<T>) -> Result<(), SubscribeError> {
        if self.is_subscribed(&callback) {
            return Err(SubscribeError::DuplicateSubscriber {
                topic: self.topic.to_string(),
            });
        }
        self.subscribers.push(callback);
        Ok(())
    }

    /// Remove a callback.
    ///
    /// Returns `false` if it was not registered; that is not an error.
    pub fn unsubscribe(&mut self, callback: &Callback<T>) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| !same_callback(s, callback));
        self.subscribers.len() != before
    }

    pub fn is_subscribed(&self, callback: &Callback<T>) -> bool {
        self.subscribers.iter().any(|s| same_callback(s, callback))
    }

    /// Deliver `value` to every subscriber in registration order.
    pub fn publish(&self, value: &T) {
        publish_all(self.topic, &self.subscribers, value);
    }

    /// The current subscribers, for publishing without holding the channel.
    pub fn snapshot(&self) -> Vec<Callback<T>> {
        self.subscribers.clone()
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<T: ?Sized> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback<str> {
        let log = log.clone();
        Arc::new(move |value: &str| log.lock().unwrap().push(format!("{tag}:{value}")))
    }

    #[test]
    fn test_publish_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel: Channel<str> = Channel::new("text");
        channel.subscribe(recorder(&log, "a")).unwrap();
        channel.subscribe(recorder(&log, "b")).unwrap();

        channel.publish("one");
        channel.publish("two");

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:one", "b:one", "a:two", "b:two"]
        );
    }

    #[test]
    fn test_duplicate_subscriber_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel: Channel<str> = Channel::new("text");
        let callback = recorder(&log, "a");

        channel.subscribe(callback.clone()).unwrap();
        let err = channel.subscribe(callback.clone()).unwrap_err();
        assert!(matches!(err, SubscribeError::DuplicateSubscriber { .. }));

        // The original registration still receives exactly one copy
        channel.publish("x");
        assert_eq!(*log.lock().unwrap(), vec!["a:x"]);
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_distinct_closures_are_distinct_subscribers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel: Channel<str> = Channel::new("text");
        channel.subscribe(recorder(&log, "a")).unwrap();
        channel.subscribe(recorder(&log, "a")).unwrap();
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel: Channel<str> = Channel::new("text");
        let callback = recorder(&log, "a");

        assert!(!channel.unsubscribe(&callback));
        channel.subscribe(callback.clone()).unwrap();
        assert!(channel.is_subscribed(&callback));
        assert!(channel.unsubscribe(&callback));
        assert!(!channel.is_subscribed(&callback));

        channel.publish("ignored");
        assert!(log.lock().unwrap().is_empty());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_from_channel() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel: Channel<str> = Channel::new("text");
        let callback = recorder(&log, "a");
        channel.subscribe(callback.clone()).unwrap();

        let snapshot = channel.snapshot();
        channel.unsubscribe(&callback);
        publish_all(channel.topic(), &snapshot, "kept");

        assert_eq!(*log.lock().unwrap(), vec!["a:kept"]);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut channel: Channel<[u8]> = Channel::new("bytes");
        channel
            .subscribe(Arc::new(|_: &[u8]| panic!("subscriber failure")))
            .unwrap();
        let sink = log.clone();
        channel
            .subscribe(Arc::new(move |data: &[u8]| {
                sink.lock().unwrap().push(String::from_utf8_lossy(data).into_owned())
            }))
            .unwrap();

        channel.publish(b"first");
        channel.publish(b"second");

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }
}
