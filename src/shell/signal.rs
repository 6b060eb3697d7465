//! Signalling the command a live shell is running.
//!
//! The shell session itself must survive an interrupt, so signals go to the
//! descendants of the inner shell process, never to the shell. Descendants
//! are found by walking the parent links in `/proc/<pid>/stat`.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use strum::Display;
use tracing::{debug, warn};

use crate::error::ShellfsError;
use crate::privilege::PrivilegeMethod;
use crate::program::Interrupter;

/// Signals that can be delivered to a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Signal {
    #[strum(serialize = "SIGHUP")]
    Hup,
    #[strum(serialize = "SIGINT")]
    Int,
    #[strum(serialize = "SIGKILL")]
    Kill,
    #[strum(serialize = "SIGTERM")]
    Term,
}

impl Signal {
    /// Returns the name understood by `kill -<name>`.
    pub fn kill_name(&self) -> &'static str {
        match self {
            Self::Hup => "HUP",
            Self::Int => "INT",
            Self::Kill => "KILL",
            Self::Term => "TERM",
        }
    }
}

/// Extracts the parent pid from the contents of a `/proc/<pid>/stat` file.
///
/// The command name (field 2) is parenthesised and may itself contain spaces
/// or parentheses, so parsing starts after the last `)`.
fn parse_parent_pid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Returns every descendant of `root`, parents before children.
pub(crate) fn descendants(proc_root: &Utf8Path, root: u32) -> Result<Vec<u32>, ShellfsError> {
    let entries = fs::read_dir(proc_root)
        .map_err(|e| ShellfsError::io(format!("failed to list {}", proc_root), e))?;

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // processes can exit while the table is scanned
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_parent_pid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                found.push(kid);
                queue.push_back(kid);
            }
        }
    }
    Ok(found)
}

/// Runs `argv` to completion, returning whether it exited successfully.
fn run_kill(argv: &[String]) -> Result<bool, ShellfsError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(false);
    };
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| ShellfsError::io(format!("failed to run {}", program), e))?;
    Ok(status.success())
}

/// Interrupts whatever a live shell session is running.
///
/// The inner shell pid is published by the session once its handshake
/// completes and cleared when the session goes away.
#[derive(Debug)]
pub struct ShellInterrupter {
    shell_pid: AtomicU32,
    privilege: Option<PrivilegeMethod>,
    proc_root: Utf8PathBuf,
}

impl ShellInterrupter {
    pub fn new(privilege: Option<PrivilegeMethod>) -> Self {
        Self::with_proc_root(privilege, "/proc")
    }

    pub(crate) fn with_proc_root(
        privilege: Option<PrivilegeMethod>,
        proc_root: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            shell_pid: AtomicU32::new(0),
            privilege,
            proc_root: proc_root.into(),
        }
    }

    pub(crate) fn set_shell_pid(&self, pid: u32) {
        self.shell_pid.store(pid, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.shell_pid.store(0, Ordering::Release);
    }

    /// Returns the inner shell pid, if a session is live.
    pub fn shell_pid(&self) -> Option<u32> {
        match self.shell_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl Interrupter for ShellInterrupter {
    fn interrupt(&self, signal: Signal) -> Result<bool, ShellfsError> {
        let Some(shell_pid) = self.shell_pid() else {
            debug!("no live session to interrupt");
            return Ok(false);
        };
        let pids = descendants(&self.proc_root, shell_pid)?;
        if pids.is_empty() {
            debug!(pid = shell_pid, "shell has no running command");
            return Ok(false);
        }

        let mut args = vec![format!("-{}", signal.kill_name())];
        args.extend(pids.iter().map(u32::to_string));
        debug!(pid = shell_pid, "sending {} to {:?}", signal, pids);

        let mut argv = vec!["kill".to_string()];
        argv.extend(args.iter().cloned());
        if run_kill(&argv)? {
            return Ok(true);
        }

        match self.privilege {
            Some(method) => {
                debug!("direct signal refused; retrying through {}", method);
                let delivered = run_kill(&method.wrap_command("kill", &args))?;
                if !delivered {
                    warn!(pid = shell_pid, "failed to deliver {} through {}", signal, method);
                }
                Ok(delivered)
            }
            None => {
                warn!(pid = shell_pid, "failed to deliver {}", signal);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_stat(root: &Utf8Path, pid: u32, ppid: u32, comm: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stat"), format!("{} ({}) S {} {} 0 0", pid, comm, ppid, pid)).unwrap();
    }

    #[test]
    fn parse_parent_pid_handles_spaces_and_parens_in_name() {
        assert_eq!(parse_parent_pid("42 (sh) S 7 42 42 0"), Some(7));
        assert_eq!(parse_parent_pid("42 (my (odd) name) R 9 42"), Some(9));
        assert_eq!(parse_parent_pid("garbage"), None);
    }

    #[test]
    fn descendants_walks_the_tree_breadth_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        write_stat(root, 100, 1, "sh");
        write_stat(root, 101, 100, "tar");
        write_stat(root, 102, 101, "gzip");
        write_stat(root, 103, 100, "find");
        write_stat(root, 200, 1, "unrelated");
        fs::create_dir_all(root.join("self")).unwrap();

        let mut found = descendants(root, 100).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found.last(), Some(&102), "grandchild comes after its parent");
        found.sort_unstable();
        assert_eq!(found, vec![101, 102, 103]);
    }

    #[test]
    fn descendants_of_leaf_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        write_stat(root, 100, 1, "sh");
        assert!(descendants(root, 100).unwrap().is_empty());
    }

    #[test]
    fn interrupt_without_session_is_not_confirmed() {
        let interrupter = ShellInterrupter::new(None);
        assert_eq!(interrupter.shell_pid(), None);
        assert!(!interrupter.interrupt(Signal::Term).unwrap());
    }

    #[test]
    fn interrupt_without_children_is_not_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        write_stat(root, 100, 1, "sh");
        let interrupter = ShellInterrupter::with_proc_root(None, root);
        interrupter.set_shell_pid(100);
        assert!(!interrupter.interrupt(Signal::Term).unwrap());
        interrupter.clear();
        assert_eq!(interrupter.shell_pid(), None);
    }

    #[test]
    fn signal_names() {
        assert_eq!(Signal::Term.to_string(), "SIGTERM");
        assert_eq!(Signal::Kill.kill_name(), "KILL");
    }
}
