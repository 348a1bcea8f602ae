//! State shared between a node, its drain thread and its subscribers.
//!
//! Two locks cooperate here. `streams` guards the data (history, subscriber
//! lists, onboarding queue) and is only held for short updates, never while a
//! callback runs. The [`DeliveryGate`] orders deliveries: publishing a chunk and
//! onboarding a subscriber each run as one unit, so history replay and live
//! data never interleave. Callbacks may therefore call back into the node that
//! is delivering to them.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use super::drain::{self, OutputSource};
use super::{NodeConfig, NodeError, NodeState, ProcessNode, Subscriber, lock, poll_until};
use crate::pubsub::{Callback, Channel, SubscribeError, deliver, publish_all};

/// Serializes delivery units across threads.
///
/// Re-entrant for the thread already inside: a callback running on the drain
/// thread can onboard a subscriber on its own node without waiting on itself.
struct DeliveryGate {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

struct GateGuard<'a> {
    gate: &'a DeliveryGate,
    owned: bool,
}

impl DeliveryGate {
    fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        if *owner == Some(me) {
            return GateGuard {
                gate: self,
                owned: false,
            };
        }
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(me);
        GateGuard {
            gate: self,
            owned: true,
        }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            *lock(&self.gate.owner) = None;
            self.gate.released.notify_one();
        }
    }
}

/// History owed to a subscriber that was just registered.
enum Replay {
    Bytes(Callback<[u8]>, Vec<u8>),
    Text(Callback<str>, String),
}

impl Replay {
    fn deliver(self) {
        match self {
            Replay::Bytes(cb, history) => {
                deliver(super::Topic::BytesStream.as_str(), &cb, history.as_slice());
            }
            Replay::Text(cb, history) => {
                deliver(super::Topic::StringStream.as_str(), &cb, history.as_str());
            }
        }
    }
}

struct Streams {
    bytes_history: Vec<u8>,
    string_history: String,
    bytes: Channel<[u8]>,
    text: Channel<str>,
    /// Subscribers waiting for the drain thread to replay history to them.
    pending: VecDeque<Subscriber>,
    drain_active: bool,
}

impl Streams {
    fn new() -> Self {
        Self {
            bytes_history: Vec::new(),
            string_history: String::new(),
            bytes: Channel::new(super::Topic::BytesStream.as_str()),
            text: Channel::new(super::Topic::StringStream.as_str()),
            pending: VecDeque::new(),
            drain_active: false,
        }
    }

    fn is_registered(&self, subscriber: &Subscriber) -> bool {
        match subscriber {
            Subscriber::Bytes(cb) => self.bytes.is_subscribed(cb),
            Subscriber::Text(cb) => self.text.is_subscribed(cb),
        }
    }

    fn is_pending(&self, subscriber: &Subscriber) -> bool {
        self.pending.iter().any(|p| p.same_as(subscriber))
    }

    fn ensure_new(&self, subscriber: &Subscriber) -> Result<(), SubscribeError> {
        if self.is_registered(subscriber) || self.is_pending(subscriber) {
            return Err(SubscribeError::DuplicateSubscriber {
                topic: subscriber.topic().to_string(),
            });
        }
        Ok(())
    }

    fn register(&mut self, subscriber: Subscriber) -> Result<(), SubscribeError> {
        match subscriber {
            Subscriber::Bytes(cb) => self.bytes.subscribe(cb),
            Subscriber::Text(cb) => self.text.subscribe(cb),
        }
    }

    /// Register and snapshot the history owed, as one step.
    ///
    /// The replay must be delivered before the gate is released.
    fn admit(&mut self, subscriber: Subscriber) -> Result<Option<Replay>, SubscribeError> {
        let replay = match &subscriber {
            Subscriber::Bytes(cb) if !self.bytes_history.is_empty() => {
                Some(Replay::Bytes(cb.clone(), self.bytes_history.clone()))
            }
            Subscriber::Text(cb) if !self.string_history.is_empty() => {
                Some(Replay::Text(cb.clone(), self.string_history.clone()))
            }
            _ => None,
        };
        self.register(subscriber)?;
        Ok(replay)
    }

    fn admit_pending(&mut self, node: &str) -> Vec<Replay> {
        let mut replays = Vec::new();
        while let Some(subscriber) = self.pending.pop_front() {
            match self.admit(subscriber) {
                Ok(replay) => replays.extend(replay),
                Err(e) => warn!(node, error = %e, "Skipping pending subscriber"),
            }
        }
        replays
    }
}

/// The part of a node every variant shares.
///
/// Lives behind an `Arc` because the drain thread holds it too.
pub struct NodeCore {
    name: String,
    command: String,
    config: NodeConfig,
    running: AtomicBool,
    state: Mutex<NodeState>,
    streams: Mutex<Streams>,
    gate: DeliveryGate,
    children: Mutex<Vec<Arc<dyn ProcessNode>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl NodeCore {
    pub(crate) fn new(name: String, command: String, config: NodeConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            command,
            config,
            running: AtomicBool::new(false),
            state: Mutex::new(NodeState::Created),
            streams: Mutex::new(Streams::new()),
            gate: DeliveryGate::new(),
            children: Mutex::new(Vec::new()),
            drain: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.state)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn drain_active(&self) -> bool {
        lock(&self.streams).drain_active
    }

    pub fn bytes_history(&self) -> Vec<u8> {
        lock(&self.streams).bytes_history.clone()
    }

    pub fn string_history(&self) -> String {
        lock(&self.streams).string_history.clone()
    }

    /// Start the background drain thread and enter `Running`.
    pub(crate) fn start_drain<S: OutputSource>(self: &Arc<Self>, source: S) -> Result<(), NodeError> {
        *lock(&self.state) = NodeState::Running;
        self.running.store(true, Ordering::Release);
        lock(&self.streams).drain_active = true;

        let core = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("drain:{}", self.name))
            .spawn(move || drain::run(core, source));
        match spawned {
            Ok(handle) => {
                *lock(&self.drain) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                lock(&self.streams).drain_active = false;
                // Back to Created so the owner's Drop still kills the process
                *lock(&self.state) = NodeState::Created;
                Err(NodeError::Io {
                    name: self.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Append a chunk to the history and publish it on both topics.
    pub(crate) fn record_and_publish(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let _delivering = self.gate.enter();
        let (text_subscribers, byte_subscribers) = {
            let mut streams = lock(&self.streams);
            streams.bytes_history.extend_from_slice(chunk);
            streams.string_history.push_str(&text);
            (streams.text.snapshot(), streams.bytes.snapshot())
        };
        trace!(node = %self.name, len = chunk.len(), "Publishing chunk");
        publish_all(super::Topic::StringStream.as_str(), &text_subscribers, text.as_ref());
        publish_all(super::Topic::BytesStream.as_str(), &byte_subscribers, chunk);
    }

    /// Onboard queued subscribers. Called by the drain thread between chunks.
    pub(crate) fn onboard_pending(&self) {
        if lock(&self.streams).pending.is_empty() {
            return;
        }
        let _delivering = self.gate.enter();
        let replays = lock(&self.streams).admit_pending(&self.name);
        replays.into_iter().for_each(Replay::deliver);
    }

    pub(crate) fn subscribe(&self, subscriber: Subscriber) -> Result<(), SubscribeError> {
        let mut streams = lock(&self.streams);
        streams.ensure_new(&subscriber)?;
        streams.register(subscriber)
    }

    pub(crate) fn subscribe_with_history(
        &self,
        subscriber: Subscriber,
        blocking: bool,
    ) -> Result<(), SubscribeError> {
        {
            let mut streams = lock(&self.streams);
            streams.ensure_new(&subscriber)?;
            // Nobody would service the queue once the drain thread is gone.
            if !blocking && streams.drain_active {
                streams.pending.push_back(subscriber);
                return Ok(());
            }
        }

        let _delivering = self.gate.enter();
        let replay = {
            let mut streams = lock(&self.streams);
            streams.ensure_new(&subscriber)?;
            streams.admit(subscriber)?
        };
        if let Some(replay) = replay {
            replay.deliver();
        }
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        let mut streams = lock(&self.streams);
        let before = streams.pending.len();
        streams.pending.retain(|p| !p.same_as(subscriber));
        let dequeued = streams.pending.len() != before;
        let removed = match subscriber {
            Subscriber::Bytes(cb) => streams.bytes.unsubscribe(cb),
            Subscriber::Text(cb) => streams.text.unsubscribe(cb),
        };
        dequeued || removed
    }

    /// Registered or still waiting for onboarding.
    pub(crate) fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        let streams = lock(&self.streams);
        streams.is_registered(subscriber) || streams.is_pending(subscriber)
    }

    pub(crate) fn push_child(&self, child: Arc<dyn ProcessNode>) {
        lock(&self.children).push(child);
    }

    pub(crate) fn children(&self) -> Vec<Arc<dyn ProcessNode>> {
        lock(&self.children).clone()
    }

    /// Whether a write should reach the process.
    ///
    /// `Ok(false)` means drop it silently: the node is being torn down.
    pub(crate) fn accepts_input(&self) -> Result<bool, NodeError> {
        match self.state() {
            NodeState::Created | NodeState::Running => Ok(true),
            NodeState::Closing | NodeState::Closed => Ok(false),
            NodeState::Exited => Err(NodeError::IoClosed {
                name: self.name.clone(),
                source: None,
            }),
        }
    }

    /// Map a failed write to the right outcome for the current state.
    pub(crate) fn write_failed(&self, source: io::Error) -> Result<(), NodeError> {
        if self.state().is_tearing_down() {
            return Ok(());
        }
        Err(NodeError::IoClosed {
            name: self.name.clone(),
            source: Some(source),
        })
    }

    /// Called by the drain thread when the process output ends.
    pub(crate) fn mark_exited(&self, reason: &str) {
        self.running.store(false, Ordering::Release);
        let mut state = lock(&self.state);
        if *state == NodeState::Running {
            *state = NodeState::Exited;
            warn!(node = %self.name, reason, "Process exited while node was running");
        } else {
            debug!(node = %self.name, reason, "Process output ended");
        }
    }

    /// Called by the drain thread as its last action. Any subscriber still
    /// queued gets its history now.
    pub(crate) fn finish_drain(&self) {
        let _delivering = self.gate.enter();
        let replays = {
            let mut streams = lock(&self.streams);
            streams.drain_active = false;
            streams.admit_pending(&self.name)
        };
        replays.into_iter().for_each(Replay::deliver);
    }

    /// Enter `Closing`. Returns false if a close already started.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = lock(&self.state);
        if state.is_tearing_down() {
            return false;
        }
        *state = NodeState::Closing;
        self.running.store(false, Ordering::Release);
        true
    }

    pub(crate) fn finish_close(&self) {
        *lock(&self.state) = NodeState::Closed;
        debug!(node = %self.name, "Node closed");
    }

    /// Wait for the drain thread until `deadline`. A thread that misses the
    /// deadline is left detached.
    pub(crate) fn join_drain(&self, deadline: Instant) -> bool {
        let Some(handle) = lock(&self.drain).take() else {
            return true;
        };
        if !poll_until(deadline, || handle.is_finished()) {
            warn!(node = %self.name, "Drain thread did not stop before the deadline");
            return false;
        }
        if handle.join().is_err() {
            error!(node = %self.name, "Drain thread panicked");
        }
        true
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn collector() -> (Subscriber, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscriber = Subscriber::bytes(move |data: &[u8]| {
            sink.lock().unwrap().extend_from_slice(data);
        });
        (subscriber, seen)
    }

    fn core() -> Arc<NodeCore> {
        NodeCore::new("test".to_string(), "cat".to_string(), NodeConfig::default())
    }

    #[test]
    fn test_string_history_is_incremental_decode() {
        let core = core();
        // "é" split across two chunks: each half is replaced on its own
        core.record_and_publish(b"caf\xc3");
        core.record_and_publish(b"\xa9!");

        assert_eq!(core.bytes_history(), b"caf\xc3\xa9!".to_vec());
        assert_eq!(core.string_history(), "caf\u{FFFD}\u{FFFD}!");
    }

    #[test]
    fn test_blocking_onboarding_replays_history_once() {
        let core = core();
        core.record_and_publish(b"hello ");

        let (subscriber, seen) = collector();
        core.subscribe_with_history(subscriber, true).unwrap();
        assert_eq!(*seen.lock().unwrap(), b"hello ".to_vec());

        core.record_and_publish(b"world");
        assert_eq!(*seen.lock().unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn test_empty_history_is_not_replayed() {
        let core = core();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let subscriber = Subscriber::text(move |_: &str| *counter.lock().unwrap() += 1);

        core.subscribe_with_history(subscriber, true).unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_pending_onboarding_precedes_next_chunk() {
        let core = core();
        lock(&core.streams).drain_active = true;
        core.record_and_publish(b"abc");

        let (subscriber, seen) = collector();
        core.subscribe_with_history(subscriber.clone(), false).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert!(core.is_subscribed(&subscriber));

        // What the drain thread does at the top of every iteration
        core.onboard_pending();
        core.record_and_publish(b"def");

        assert_eq!(*seen.lock().unwrap(), b"abcdef".to_vec());
    }

    #[test]
    fn test_duplicate_detected_while_pending() {
        let core = core();
        lock(&core.streams).drain_active = true;
        let (subscriber, _seen) = collector();

        core.subscribe_with_history(subscriber.clone(), false).unwrap();
        assert!(matches!(
            core.subscribe_with_history(subscriber.clone(), true),
            Err(SubscribeError::DuplicateSubscriber { .. })
        ));
        assert!(matches!(
            core.subscribe(subscriber),
            Err(SubscribeError::DuplicateSubscriber { .. })
        ));
    }

    #[test]
    fn test_finish_drain_flushes_pending() {
        let core = core();
        lock(&core.streams).drain_active = true;
        core.record_and_publish(b"late");

        let (subscriber, seen) = collector();
        core.subscribe_with_history(subscriber, false).unwrap();
        core.finish_drain();

        assert_eq!(*seen.lock().unwrap(), b"late".to_vec());
        assert!(!core.drain_active());
    }

    #[test]
    fn test_unsubscribe_pending_and_registered() {
        let core = core();
        let (subscriber, _seen) = collector();
        assert!(!core.unsubscribe(&subscriber));

        core.subscribe(subscriber.clone()).unwrap();
        assert!(core.unsubscribe(&subscriber));
        assert!(!core.is_subscribed(&subscriber));
    }

    #[test]
    fn test_callback_can_query_its_own_node() {
        let core = core();
        let weak = Arc::downgrade(&core);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscriber = Subscriber::text(move |_: &str| {
            let core = weak.upgrade().unwrap();
            sink.lock().unwrap().push(core.string_history());
        });
        core.subscribe(subscriber.clone()).unwrap();

        core.record_and_publish(b"one ");
        core.record_and_publish(b"two");

        // The chunk is already in the history when it is published
        assert_eq!(*seen.lock().unwrap(), vec!["one ", "one two"]);
        assert!(core.is_subscribed(&subscriber));
    }

    #[test]
    fn test_callback_onboards_subscriber_on_its_own_node() {
        let core = core();
        let weak = Arc::downgrade(&core);
        let (late, late_seen) = collector();
        let trigger = Subscriber::bytes(move |_: &[u8]| {
            let core = weak.upgrade().unwrap();
            if !core.is_subscribed(&late) {
                core.subscribe_with_history(late.clone(), true).unwrap();
            }
        });
        core.subscribe(trigger).unwrap();

        core.record_and_publish(b"abc");
        // Replay covered "abc"; the chunk in flight is not delivered twice
        assert_eq!(*late_seen.lock().unwrap(), b"abc".to_vec());

        core.record_and_publish(b"def");
        assert_eq!(*late_seen.lock().unwrap(), b"abcdef".to_vec());
    }

    #[test]
    fn test_callback_can_unsubscribe_itself() {
        let core = core();
        let weak = Arc::downgrade(&core);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let own: Arc<Mutex<Option<Subscriber>>> = Arc::new(Mutex::new(None));
        let handle = own.clone();
        let subscriber = Subscriber::bytes(move |_: &[u8]| {
            *counter.lock().unwrap() += 1;
            if let Some(me) = handle.lock().unwrap().take() {
                assert!(weak.upgrade().unwrap().unsubscribe(&me));
            }
        });
        *own.lock().unwrap() = Some(subscriber.clone());
        core.subscribe(subscriber.clone()).unwrap();

        core.record_and_publish(b"first");
        core.record_and_publish(b"second");

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(!core.is_subscribed(&subscriber));
    }

    #[test]
    fn test_gate_serializes_other_threads() {
        let core = core();
        let entered = Arc::new(AtomicBool::new(false));
        let gate_core = core.clone();
        let flag = entered.clone();

        let guard = core.gate.enter();
        let waiter = thread::spawn(move || {
            let _delivering = gate_core.gate.enter();
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        // Re-entering on the owning thread does not block
        drop(core.gate.enter());
        drop(guard);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_policy_follows_state() {
        let core = core();
        assert!(core.accepts_input().unwrap());

        *lock(&core.state) = NodeState::Running;
        core.mark_exited("test");
        assert_eq!(core.state(), NodeState::Exited);
        assert!(matches!(
            core.accepts_input(),
            Err(NodeError::IoClosed { .. })
        ));

        assert!(core.begin_close());
        assert!(!core.begin_close());
        assert!(!core.accepts_input().unwrap());
        assert!(core.write_failed(io::Error::from(io::ErrorKind::BrokenPipe)).is_ok());
    }
}
