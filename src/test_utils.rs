//! Helpers shared by the process-level tests.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::node::{ProcessNode, ShellConfig, Subscriber};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Poll `done` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// A byte subscriber that accumulates everything it receives.
pub fn byte_collector() -> (Subscriber, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscriber = Subscriber::bytes(move |data: &[u8]| {
        if let Ok(mut seen) = sink.lock() {
            seen.extend_from_slice(data);
        }
    });
    (subscriber, seen)
}

pub fn contents(seen: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    seen.lock().map(|s| s.clone()).unwrap_or_default()
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// True if no process with this pid exists any more.
pub fn process_gone(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

/// A plain shell without user rc files, so output is predictable.
pub fn test_shell_config() -> ShellConfig {
    ShellConfig {
        command: "sh -i".to_string(),
        ..ShellConfig::default()
    }
}

/// Every node is closed, its process is gone and its drain thread stopped.
pub fn fully_shut_down(node: &dyn ProcessNode) -> bool {
    !node.drain_active() && node.pid().is_none_or(process_gone)
}
