//! Programs: executables bound to a live shell.
//!
//! This module provides:
//! - [`Program`]: the capability trait a shell drives (wait policy, stream hooks,
//!   stdin channel, write targets, exit-code policy)
//! - [`SyncResultProgram`]: programs parsed once from the full output
//! - [`AsyncResultProgram`]: programs that deliver ordered partial results
//!   from a dedicated consumer thread while the command is still running
//! - [`RawProgram`]: a plain program returning its stdout

mod async_result;
mod lines;
mod sync;

use std::io::{self, Write};
use std::sync::Arc;

use strum::Display;

use crate::error::ShellfsError;
use crate::executable::{Executable, ExitPolicy, WriteTargets};
use crate::mount::MountPoint;
use crate::shell::Signal;

pub use async_result::{
    AsyncOptions, AsyncParser, AsyncResultListener, AsyncResultProgram, AsyncState, LineParser,
};
pub use lines::ChunkAssembler;
pub use sync::SyncResultProgram;

/// Output stream of the shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

/// How long the shell waits for a program to complete.
///
/// The timeout value itself is a property of the shell; the program only
/// chooses whether it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait until the shell signals completion, however long it takes.
    Indefinite,
    /// Give up once the shell timeout elapses.
    ///
    /// With `reset_on_data`, every received chunk restarts the timer.
    Bounded { reset_on_data: bool },
}

impl Default for WaitMode {
    fn default() -> Self {
        Self::Bounded {
            reset_on_data: false,
        }
    }
}

/// Delivers a signal to the command a shell is currently running.
pub trait Interrupter: Send + Sync {
    /// Sends `signal` to the running command.
    ///
    /// Returns `Ok(true)` if at least one process was signalled.
    fn interrupt(&self, signal: Signal) -> Result<bool, ShellfsError>;
}

/// An executable bound to a shell for one invocation.
///
/// Every hook has a no-op default, so concrete commands only override the
/// capabilities they have. Shells call the hooks in this order:
/// `on_start`, `bind_interrupter`, `write_stdin`, then `on_stdout`/`on_stderr`
/// for every chunk as it arrives, then `on_end` exactly once.
pub trait Program: Send + Sync {
    /// Returns the executable this program runs.
    fn executable(&self) -> &Executable;

    /// Returns the exit codes this command accepts.
    fn exit_policy(&self) -> ExitPolicy {
        ExitPolicy::STRICT
    }

    /// Returns how long the shell waits for completion.
    fn wait_mode(&self) -> WaitMode {
        WaitMode::default()
    }

    /// If true, the running command is interrupted as soon as stderr output
    /// arrives and the shell returns without waiting for it to finish.
    fn exit_on_stderr(&self) -> bool {
        false
    }

    /// If true, the stderr text rules of classification are skipped.
    fn ignore_stderr_check(&self) -> bool {
        false
    }

    /// If false, the shell does not keep a copy of stdout (stderr is always kept).
    fn capture_stdout(&self) -> bool {
        true
    }

    /// Returns the paths mutated by this program, for writable operations.
    fn write_targets(&self) -> Option<WriteTargets> {
        None
    }

    /// For remount steps, the mount point and whether it becomes read-write.
    fn remount(&self) -> Option<(&MountPoint, bool)> {
        None
    }

    /// Writes data the command reads from stdin. Called right after the command line.
    fn write_stdin(&self, _stdin: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// Receives the handle that can signal the running command.
    fn bind_interrupter(&self, _interrupter: Arc<dyn Interrupter>) {}

    /// Called before the command line is written.
    fn on_start(&self) -> Result<(), ShellfsError> {
        Ok(())
    }

    /// Called with every stdout chunk, on the shell's reading thread.
    fn on_stdout(&self, _chunk: &[u8]) {}

    /// Called with every stderr chunk, on the shell's reading thread.
    fn on_stderr(&self, _chunk: &[u8]) {}

    /// Called once the invocation is over; `exit_code` is `None` if it never completed.
    fn on_end(&self, _exit_code: Option<i32>) {}

    /// Called by the orchestrator with the final failure of an operation,
    /// after `on_end`.
    fn on_exception(&self, _cause: &ShellfsError) {}

    /// Returns true if the invocation was cancelled by the caller.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A program with default capabilities whose result is its stdout.
#[derive(Debug, Clone)]
pub struct RawProgram {
    executable: Executable,
    exit_policy: ExitPolicy,
    wait_mode: WaitMode,
    exit_on_stderr: bool,
}

impl RawProgram {
    pub fn new(executable: Executable) -> Self {
        Self {
            executable,
            exit_policy: ExitPolicy::STRICT,
            wait_mode: WaitMode::default(),
            exit_on_stderr: false,
        }
    }

    #[must_use]
    pub fn with_exit_policy(mut self, exit_policy: ExitPolicy) -> Self {
        self.exit_policy = exit_policy;
        self
    }

    #[must_use]
    pub fn with_wait_mode(mut self, wait_mode: WaitMode) -> Self {
        self.wait_mode = wait_mode;
        self
    }

    #[must_use]
    pub fn with_exit_on_stderr(mut self, exit_on_stderr: bool) -> Self {
        self.exit_on_stderr = exit_on_stderr;
        self
    }
}

impl Program for RawProgram {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn exit_policy(&self) -> ExitPolicy {
        self.exit_policy
    }

    fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    fn exit_on_stderr(&self) -> bool {
        self.exit_on_stderr
    }
}

impl SyncResultProgram for RawProgram {
    type Output = String;

    fn parse(&self, stdout: &str, _stderr: &str) -> Result<String, ShellfsError> {
        Ok(stdout.to_string())
    }
}
