//! Headless driver for a process tree.
//!
//! Usage: `proctree [PROFILE] [VIEW]`
//!
//! Starts the user's shell as the tree root, optionally recreates the filters
//! stored in PROFILE (a path, or a name under `~/.proctree/profiles/`), and
//! prints the decoded output of the VIEW node (the root by default). Lines
//! read from stdin go to the shell, except for these commands:
//!
//! - `:filter NAME PARENT COMMAND...` create a filter below PARENT
//! - `:save PATH` write the current tree to PATH
//! - `:interrupt` send Ctrl+C to the shell
//! - `:resize COLS ROWS` resize the shell's terminal
//!
//! The tree is closed when stdin reaches EOF.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use proctree::filter_manager::profile::default_profile_path;
use proctree::node::{ProcessNode, ShellConfig, ShellProcess, Subscriber};
use proctree::utils;
use proctree::{FilterManager, ROOT_FILTER_NAME};
use tracing::{debug, info, warn};

fn profile_path(arg: &str) -> PathBuf {
    let path = Path::new(arg);
    if path.exists() || arg.contains('/') || arg.ends_with(".json") {
        path.to_path_buf()
    } else {
        default_profile_path(arg)
    }
}

fn print_text(text: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
        debug!(error = %e, "Failed to write to stdout");
    }
}

/// Split `NAME PARENT COMMAND...`, keeping COMMAND exactly as typed.
fn parse_filter_args(args: &str) -> Option<(&str, &str, &str)> {
    let (name, rest) = args.trim_start().split_once(char::is_whitespace)?;
    let (parent, command) = rest.trim_start().split_once(char::is_whitespace)?;
    let command = command.trim();
    (!command.is_empty()).then_some((name, parent, command))
}

/// Handle one `:command` line. Returns an error message for the user on misuse.
fn run_command(line: &str, manager: &mut FilterManager, shell: &ShellProcess) -> Result<()> {
    let (command, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let mut parts = args.split_whitespace();
    match command {
        ":filter" => {
            let Some((name, parent, command)) = parse_filter_args(args) else {
                bail!("usage: :filter NAME PARENT COMMAND...");
            };
            manager.create_filter(name, command, parent)?;
        }
        ":save" => {
            let Some(path) = parts.next() else {
                bail!("usage: :save PATH");
            };
            manager.save_profile(&profile_path(path))?;
        }
        ":interrupt" => shell.send_interrupt()?,
        ":resize" => {
            let (Some(cols), Some(rows)) = (parts.next(), parts.next()) else {
                bail!("usage: :resize COLS ROWS");
            };
            shell.resize(cols.parse()?, rows.parse()?)?;
        }
        _ => bail!("unknown command: {line}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let _log_guard = utils::logger::init_logging();

    let mut args = std::env::args().skip(1);
    let profile = args.next();
    let view = args.next().unwrap_or_else(|| ROOT_FILTER_NAME.to_string());

    let shell = ShellProcess::spawn(ROOT_FILTER_NAME, ShellConfig::default())?;
    let mut manager = FilterManager::new(shell.clone());

    if let Some(profile) = profile.as_deref() {
        let path = profile_path(profile);
        if path.exists() {
            manager
                .load_profile(&path)
                .with_context(|| format!("Failed to load profile {}", path.display()))?;
        } else {
            info!(path = %path.display(), "Profile not found, starting with an empty tree");
        }
    }

    let viewed: Arc<dyn ProcessNode> = manager.get_filter(&view)?.clone();
    viewed.subscribe_with_history(Subscriber::text(print_text), true)?;

    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.starts_with(':') {
            if let Err(e) = run_command(&line, &mut manager, &shell) {
                eprintln!("{e:#}");
            }
            continue;
        }
        if let Err(e) = shell.write(format!("{line}\n").as_bytes()) {
            warn!(error = %e, "Shell stopped accepting input");
            eprintln!("{e}");
            break;
        }
    }

    info!("Input closed, shutting down");
    manager.close()?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_command_keeps_quoting_and_spacing() {
        assert_eq!(
            parse_filter_args(r#" errors  Shell grep "a  b" | sed 's/x/ y/'"#),
            Some(("errors", "Shell", r#"grep "a  b" | sed 's/x/ y/'"#))
        );
    }

    #[test]
    fn test_filter_command_is_required() {
        assert_eq!(parse_filter_args("errors Shell"), None);
        assert_eq!(parse_filter_args("errors Shell   "), None);
        assert_eq!(parse_filter_args(""), None);
    }

    #[test]
    fn test_profile_path_resolution() {
        assert_eq!(profile_path("./tree.json"), PathBuf::from("./tree.json"));
        assert!(profile_path("work").ends_with(".proctree/profiles/work.json"));
    }
}
