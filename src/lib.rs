//! proctree - a live tree of processes connected by their output streams.
//!
//! The root of the tree is an interactive shell on a pseudo-terminal. Every
//! other node is a pipe-style filter (`grep`, `sed`, ...) whose stdin is fed
//! with everything its parent prints, history first. Each node records its
//! complete output and publishes it as raw bytes and as decoded text, so any
//! number of viewers can attach at any time without missing data.
//!
//! # Example
//!
//! ```no_run
//! use proctree::filter_manager::{FilterManager, ROOT_FILTER_NAME};
//! use proctree::node::{ProcessNode, ShellConfig, ShellProcess, Subscriber};
//!
//! fn main() -> anyhow::Result<()> {
//!     let shell = ShellProcess::spawn(ROOT_FILTER_NAME, ShellConfig::default())?;
//!     let mut manager = FilterManager::new(shell);
//!
//!     let errors = manager.create_filter("errors", "grep --line-buffered ERROR", ROOT_FILTER_NAME)?;
//!     errors.subscribe_with_history(Subscriber::text(|s: &str| print!("{s}")), true)?;
//!
//!     manager.root().write(b"tail -f /var/log/syslog\n")?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     manager.close()?;
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("proctree drives pseudo-terminals and process groups and supports Unix only");

pub mod filter_manager;
pub mod node;
pub mod pubsub;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use filter_manager::{FilterError, FilterManager, ManagerConfig, ROOT_FILTER_NAME};
pub use node::{
    FilterProcess, NodeConfig, NodeError, NodeState, ProcessNode, ShellConfig, ShellProcess,
    Subscriber, Subscription, Topic,
};
pub use pubsub::SubscribeError;
