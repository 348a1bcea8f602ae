//! Interactive shell node running behind a pseudo-terminal.
//!
//! The shell believes it owns a real terminal, so prompts, line editing and
//! job control work. Output is drained with a readiness wait on the pty master
//! instead of a read-and-sleep loop, which keeps interactive latency low.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use nix::errno::Errno;
use portable_pty::{
    Child as PtyChild, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system,
};
use tracing::{debug, info, warn};

use super::drain::{OutputSource, ReadOutcome, wait_readable};
use super::{
    NodeConfig, NodeCore, NodeError, ProcessNode, kill_process_group, lock, poll_until,
};

/// ETX, what a terminal sends for Ctrl+C.
const INTERRUPT: u8 = 0x03;

/// Settings for the root shell.
#[derive(Clone, Debug)]
pub struct ShellConfig {
    /// Shell command line, split with shell quoting rules.
    pub command: String,
    pub cols: u16,
    pub rows: u16,
    /// Value of `TERM` inside the shell.
    pub term: String,
    pub cwd: Option<PathBuf>,
    pub node: NodeConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: format!("{} -i", default_shell()),
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
            cwd: std::env::current_dir().ok(),
            node: NodeConfig::default(),
        }
    }
}

/// The user's configured shell, falling back to bash.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

struct PtySource {
    reader: Box<dyn Read + Send>,
    /// Duplicate of the master descriptor, polled for readiness.
    fd: OwnedFd,
    poll_timeout: Duration,
}

impl OutputSource for PtySource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if !wait_readable(self.fd.as_fd(), self.poll_timeout)? {
            return Ok(ReadOutcome::Idle);
        }
        match self.reader.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            // Linux reports a closed slave side as EIO
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(ReadOutcome::Eof),
            Err(e) => Err(e),
        }
    }

    fn idle_backoff(&self) -> Option<Duration> {
        None
    }
}

struct OpenedShell {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn PtyChild + Send + Sync>,
    fd: OwnedFd,
}

fn open_shell(config: &ShellConfig) -> anyhow::Result<OpenedShell> {
    let argv = shell_words::split(&config.command)
        .with_context(|| format!("Invalid shell command: {}", config.command))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("Shell command is empty"))?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open PTY")?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.env("TERM", &config.term);
    if let Some(cwd) = &config.cwd {
        cmd.cwd(cwd);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .context("Failed to spawn shell in PTY")?;

    // Drop slave side in parent process
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().context("Failed to clone PTY reader")?;
    let writer = pair.master.take_writer().context("Failed to take PTY writer")?;
    let raw = pair
        .master
        .as_raw_fd()
        .ok_or_else(|| anyhow!("PTY master has no file descriptor"))?;
    // SAFETY: `raw` is owned by `pair.master`, which stays open for the whole
    // borrow. The duplicate gets its own descriptor.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) }
        .try_clone_to_owned()
        .context("Failed to duplicate PTY master descriptor")?;

    Ok(OpenedShell {
        master: pair.master,
        reader,
        writer,
        child,
        fd,
    })
}

/// The root node of a process tree: an interactive shell on a pty.
pub struct ShellProcess {
    core: Arc<NodeCore>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn PtyChild + Send + Sync>>,
    pid: Option<u32>,
}

impl ShellProcess {
    /// Start the shell and its drain thread.
    ///
    /// # Errors
    /// Returns `NodeError::Spawn` if the pty cannot be opened or the shell
    /// cannot be started.
    pub fn spawn(name: impl Into<String>, config: ShellConfig) -> Result<Arc<Self>, NodeError> {
        let name = name.into();
        let opened = open_shell(&config).map_err(|source| NodeError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let pid = opened.child.process_id();
        let source = PtySource {
            reader: opened.reader,
            fd: opened.fd,
            poll_timeout: config.node.poll_timeout,
        };

        let node = Arc::new(Self {
            core: NodeCore::new(name, config.command, config.node),
            master: Mutex::new(opened.master),
            writer: Mutex::new(opened.writer),
            child: Mutex::new(opened.child),
            pid,
        });
        node.core.start_drain(source)?;

        info!(node = node.name(), command = node.command(), ?pid, "Shell started");
        Ok(node)
    }

    /// Forward an interrupt keystroke (Ctrl+C) to the shell.
    pub fn send_interrupt(&self) -> Result<(), NodeError> {
        debug!(node = self.name(), "Sending interrupt");
        self.write(&[INTERRUPT])
    }

    /// Resize the pty so the shell reflows its output.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), NodeError> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|source| NodeError::Terminal {
                name: self.name().to_string(),
                source,
            })
    }

    /// Current `(cols, rows)` of the pty.
    pub fn size(&self) -> Result<(u16, u16), NodeError> {
        let size = lock(&self.master)
            .get_size()
            .map_err(|source| NodeError::Terminal {
                name: self.name().to_string(),
                source,
            })?;
        Ok((size.cols, size.rows))
    }
}

impl ProcessNode for ShellProcess {
    fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    fn write(&self, data: &[u8]) -> Result<(), NodeError> {
        if !self.core.accepts_input()? {
            return Ok(());
        }
        let mut writer = lock(&self.writer);
        match writer.write_all(data).and_then(|()| writer.flush()) {
            Ok(()) => Ok(()),
            Err(e) => self.core.write_failed(e),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&self) -> io::Result<()> {
        // The pty child is a session leader, so its pid is also its group id
        match self.pid.map(kill_process_group) {
            Some(Ok(())) => Ok(()),
            _ => lock(&self.child).kill(),
        }
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        let mut child = lock(&self.child);
        poll_until(Instant::now() + timeout, || {
            !matches!(child.try_wait(), Ok(None))
        })
    }
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcess")
            .field("name", &self.core.name())
            .field("command", &self.core.command())
            .field("pid", &self.pid)
            .finish()
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if self.core.begin_close() {
            if let Err(e) = self.kill() {
                warn!(node = self.core.name(), error = %e, "Failed to kill dropped shell");
            }
        }
    }
}
