//! Pipe-backed filter nodes: `sh -c <command>` with stdin fed by the parent node.

use std::io::{self, PipeReader, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use super::drain::{OutputSource, ReadOutcome, wait_readable};
use super::{
    NodeConfig, NodeCore, NodeError, ProcessNode, kill_process_group, lock, poll_until,
};

/// Non-blocking view of the merged stdout/stderr pipe.
struct PipeSource {
    output: PipeReader,
    idle_backoff: Duration,
}

impl OutputSource for PipeSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if !wait_readable(self.output.as_fd(), Duration::ZERO)? {
            return Ok(ReadOutcome::Idle);
        }
        match self.output.read(buf)? {
            0 => Ok(ReadOutcome::Eof),
            n => Ok(ReadOutcome::Data(n)),
        }
    }

    fn idle_backoff(&self) -> Option<Duration> {
        Some(self.idle_backoff)
    }
}

/// A one-shot pipe-style subprocess (`grep`, `sed`, `cat`, ...).
pub struct FilterProcess {
    core: Arc<NodeCore>,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pid: u32,
}

impl FilterProcess {
    /// Spawn `command` through `sh -c` in its own process group and start draining it.
    ///
    /// # Errors
    /// Returns `NodeError::Spawn` if the pipes or the process cannot be created.
    pub fn spawn(
        name: impl Into<String>,
        command: impl Into<String>,
        config: NodeConfig,
    ) -> Result<Arc<Self>, NodeError> {
        let name = name.into();
        let command = command.into();

        let (mut child, output) = spawn_piped(&command).map_err(|source| NodeError::Spawn {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();
        let Some(stdin) = child.stdin.take() else {
            // Unreachable with Stdio::piped, but never leak the process
            if let Err(e) = kill_process_group(pid) {
                warn!(pid, error = %e, "Failed to kill filter without stdin");
            }
            return Err(NodeError::Spawn {
                command,
                source: anyhow!("stdin was not captured"),
            });
        };

        let idle_backoff = config.idle_backoff;
        let core = NodeCore::new(name, command, config);
        let node = Arc::new(Self {
            core,
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pid,
        });
        node.core.start_drain(PipeSource {
            output,
            idle_backoff,
        })?;

        info!(node = node.name(), command = node.command(), pid, "Filter started");
        Ok(node)
    }
}

/// Run `command` with stdin piped and stdout/stderr sharing one pipe.
fn spawn_piped(command: &str) -> anyhow::Result<(Child, PipeReader)> {
    let (output, writer) = io::pipe().context("Failed to create output pipe")?;
    let stderr = writer
        .try_clone()
        .context("Failed to duplicate output pipe")?;

    // The Command owns the write ends; it is dropped at the end of this
    // statement so the reader sees EOF once the process exits.
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(writer)
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .with_context(|| format!("Failed to spawn `{command}`"))?;

    Ok((child, output))
}

impl ProcessNode for FilterProcess {
    fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    fn write(&self, data: &[u8]) -> Result<(), NodeError> {
        if !self.core.accepts_input()? {
            return Ok(());
        }
        let mut stdin = lock(&self.stdin);
        match stdin.write_all(data).and_then(|()| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(e) => self.core.write_failed(e),
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&self) -> io::Result<()> {
        kill_process_group(self.pid)
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        let mut child = lock(&self.child);
        poll_until(Instant::now() + timeout, || {
            // An error here means the child was already reaped
            !matches!(child.try_wait(), Ok(None))
        })
    }
}

impl std::fmt::Debug for FilterProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterProcess")
            .field("name", &self.core.name())
            .field("command", &self.core.command())
            .field("pid", &self.pid)
            .finish()
    }
}

impl Drop for FilterProcess {
    fn drop(&mut self) {
        if self.core.begin_close() {
            if let Err(e) = kill_process_group(self.pid) {
                warn!(node = self.core.name(), error = %e, "Failed to kill dropped filter");
            }
        }
    }
}
