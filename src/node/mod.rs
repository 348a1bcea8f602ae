//! Process nodes: live OS processes whose output is recorded and fanned out.
//!
//! A process node owns one subprocess, drains its output on a dedicated
//! background thread, keeps the complete byte and decoded-string history, and
//! publishes every chunk on two topics. Nodes form a tree: a child node is just
//! a byte-stream subscriber of its parent whose callback writes into the child's
//! stdin.
//!
//! Two variants implement [`ProcessNode`]:
//! - [`ShellProcess`]: an interactive shell behind a pseudo-terminal
//! - [`FilterProcess`]: a pipe-style command such as `grep` or `sed`

mod inner;
mod drain;
mod filter;
mod shell;


use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pubsub::{Callback, SubscribeError, same_callback};

pub use inner::NodeCore;
pub use filter::FilterProcess;
pub use shell::{ShellConfig, ShellProcess};

/// Largest chunk read from a process per drain iteration.
pub const READ_MAX_BYTES: usize = 102_400;

/// The two fixed stream channels of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw stdout bytes, exactly as the process produced them.
    BytesStream,
    /// The same data decoded as UTF-8, invalid sequences replaced.
    StringStream,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::BytesStream => "bytes",
            Topic::StringStream => "string",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback tagged with the topic it listens on.
///
/// Clones share identity, so keep a clone around to unsubscribe later.
#[derive(Clone)]
pub enum Subscriber {
    Bytes(Callback<[u8]>),
    Text(Callback<str>),
}

impl Subscriber {
    /// Subscriber for [`Topic::BytesStream`].
    pub fn bytes<F>(f: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        Self::Bytes(Arc::new(f))
    }

    /// Subscriber for [`Topic::StringStream`].
    pub fn text<F>(f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self::Text(Arc::new(f))
    }

    pub fn topic(&self) -> Topic {
        match self {
            Subscriber::Bytes(_) => Topic::BytesStream,
            Subscriber::Text(_) => Topic::StringStream,
        }
    }

    /// Identity comparison: same topic and same callback allocation.
    pub fn same_as(&self, other: &Subscriber) -> bool {
        match (self, other) {
            (Subscriber::Bytes(a), Subscriber::Bytes(b)) => same_callback(a, b),
            (Subscriber::Text(a), Subscriber::Text(b)) => same_callback(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscriber").field(&self.topic()).finish()
    }
}

/// Lifecycle of a node.
///
/// `Created → Running → Closing → Closed`. `Exited` is entered from `Running`
/// when the process stops producing output on its own; `close` still moves it
/// through `Closing` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    Exited,
    Closing,
    Closed,
}

impl NodeState {
    /// True once `close` has been requested.
    pub fn is_tearing_down(self) -> bool {
        matches!(self, NodeState::Closing | NodeState::Closed)
    }
}

/// Tuning for the drain loop of a node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Max bytes read per drain iteration.
    pub read_chunk_max: usize,
    /// Sleep between polls of a pipe that had no data.
    pub idle_backoff: Duration,
    /// Readiness wait on a pseudo-terminal before the running flag is rechecked.
    pub poll_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            read_chunk_max: READ_MAX_BYTES,
            idle_backoff: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// The process stopped accepting input while the node was still live.
    #[error("process of node '{name}' is closed")]
    IoClosed {
        name: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Nodes that missed the close deadline; their processes may be orphaned.
    #[error("nodes did not shut down in time: {}", nodes.join(", "))]
    CloseTimeout { nodes: Vec<String> },

    #[error("terminal operation on node '{name}' failed")]
    Terminal {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error on node '{name}'")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Common interface of every node in a process tree.
///
/// Implementors supply process plumbing (`write`, `kill`, `wait_exit`); history,
/// subscriptions, children and shutdown ordering come from the shared
/// [`NodeCore`].
pub trait ProcessNode: Send + Sync + fmt::Debug {
    fn core(&self) -> &Arc<NodeCore>;

    /// Send bytes to the process input.
    ///
    /// A no-op once the node is closing; `IoClosed` if the process died while
    /// the node was still running.
    fn write(&self, data: &[u8]) -> Result<(), NodeError>;

    fn pid(&self) -> Option<u32>;

    /// Forcefully terminate the OS process.
    fn kill(&self) -> io::Result<()>;

    /// Wait up to `timeout` for the process to be reaped. True once it has exited.
    fn wait_exit(&self, timeout: Duration) -> bool;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn command(&self) -> &str {
        self.core().command()
    }

    fn state(&self) -> NodeState {
        self.core().state()
    }

    /// True while the drain thread is still running.
    fn drain_active(&self) -> bool {
        self.core().drain_active()
    }

    fn bytes_history(&self) -> Vec<u8> {
        self.core().bytes_history()
    }

    fn string_history(&self) -> String {
        self.core().string_history()
    }

    /// Register for live publishes only, without history.
    fn subscribe(&self, subscriber: Subscriber) -> Result<(), SubscribeError> {
        self.core().subscribe(subscriber)
    }

    /// Like [`ProcessNode::subscribe`], but unsubscribes when the handle drops.
    fn subscribe_scoped(&self, subscriber: Subscriber) -> Result<Subscription, SubscribeError> {
        self.core().subscribe(subscriber.clone())?;
        Ok(Subscription {
            core: Arc::downgrade(self.core()),
            subscriber,
        })
    }

    /// Returns `false` if the subscriber was neither registered nor pending.
    fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        self.core().unsubscribe(subscriber)
    }

    fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        self.core().is_subscribed(subscriber)
    }

    /// Register a subscriber that first receives the whole history of its topic.
    ///
    /// With `blocking` the history is delivered on the calling thread before
    /// this returns. Otherwise the drain thread delivers it before the next
    /// live chunk. Either way nothing is missed and nothing is seen twice.
    fn subscribe_with_history(
        &self,
        subscriber: Subscriber,
        blocking: bool,
    ) -> Result<(), SubscribeError> {
        self.core().subscribe_with_history(subscriber, blocking)
    }

    /// Feed this node's byte stream (history included) into `child`.
    fn add_child(&self, child: Arc<dyn ProcessNode>) -> Result<(), SubscribeError> {
        let downstream = child.clone();
        let parent = self.name().to_string();
        let feed = Subscriber::bytes(move |data: &[u8]| {
            if let Err(e) = downstream.write(data) {
                debug!(
                    parent = %parent,
                    child = downstream.name(),
                    error = %e,
                    "Dropping data for child node"
                );
            }
        });
        self.subscribe_with_history(feed, false)?;
        self.core().push_child(child);
        Ok(())
    }

    fn children(&self) -> Vec<Arc<dyn ProcessNode>> {
        self.core().children()
    }

    /// Kill the process, stop the drain thread, then close every child in order.
    ///
    /// Idempotent. Each node gets `timeout` for its own shutdown; nodes that miss
    /// it are listed in [`NodeError::CloseTimeout`] after the whole subtree has
    /// been visited.
    fn close(&self, timeout: Duration) -> Result<(), NodeError> {
        let core = self.core();
        if !core.begin_close() {
            return Ok(());
        }
        info!(node = core.name(), "Closing node");

        let deadline = Instant::now() + timeout;
        let mut late = Vec::new();

        if let Err(e) = self.kill() {
            warn!(node = core.name(), error = %e, "Failed to kill process");
        }
        let drained = core.join_drain(deadline);
        let exited = self.wait_exit(deadline.saturating_duration_since(Instant::now()));
        if drained && exited {
            core.finish_close();
        } else {
            warn!(
                node = core.name(),
                drained, exited, "Node missed its close deadline"
            );
            late.push(core.name().to_string());
        }

        for child in core.children() {
            match child.close(timeout) {
                Ok(()) => {}
                Err(NodeError::CloseTimeout { nodes }) => late.extend(nodes),
                Err(e) => warn!(node = child.name(), error = %e, "Failed to close child"),
            }
        }

        if late.is_empty() {
            Ok(())
        } else {
            Err(NodeError::CloseTimeout { nodes: late })
        }
    }
}

/// Subscription that unregisters itself when dropped.
///
/// Holds only a weak reference, so it never keeps a node alive.
#[derive(Debug)]
pub struct Subscription {
    core: Weak<NodeCore>,
    subscriber: Subscriber,
}

impl Subscription {
    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.unsubscribe(&self.subscriber);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `done` until it returns true or `deadline` passes.
pub(crate) fn poll_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// SIGKILL a whole process group. A group that is already gone is not an error.
pub(crate) fn kill_process_group(pgid: u32) -> io::Result<()> {
    let raw = i32::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
