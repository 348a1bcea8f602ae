//! The per-node background loop that moves process output into the node.
//!
//! Every iteration onboards pending history subscribers, then reads at most one
//! bounded chunk. Reads never block indefinitely: sources wait for readiness
//! with a timeout, so a cleared running flag is noticed promptly.

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::debug;

use super::NodeCore;

pub(crate) enum ReadOutcome {
    Data(usize),
    /// Nothing available right now.
    Idle,
    /// The process closed its output.
    Eof,
}

/// Where a drain loop pulls output from.
pub(crate) trait OutputSource: Send + 'static {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Sleep after an idle read. `None` if `read_chunk` already waited.
    fn idle_backoff(&self) -> Option<Duration>;
}

pub(crate) fn run<S: OutputSource>(core: Arc<NodeCore>, mut source: S) {
    debug!(node = core.name(), "Drain loop started");
    let mut buf = vec![0u8; core.config().read_chunk_max.max(1)];

    while core.is_running() {
        core.onboard_pending();

        match source.read_chunk(&mut buf) {
            Ok(ReadOutcome::Data(n)) => core.record_and_publish(&buf[..n]),
            Ok(ReadOutcome::Idle) => {
                if let Some(backoff) = source.idle_backoff() {
                    thread::sleep(backoff);
                }
            }
            Ok(ReadOutcome::Eof) => {
                core.mark_exited("end of output");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                core.mark_exited(&format!("read failed: {e}"));
                break;
            }
        }
    }

    core.finish_drain();
    debug!(node = core.name(), "Drain loop stopped");
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// Hang-up and error conditions count as readable so the following read can
/// report them.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(fds[0].revents().is_some_and(|revents| {
            revents.intersects(
                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
            )
        })),
        Err(e) => Err(e.into()),
    }
}
