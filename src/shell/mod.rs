//! Shell execution for shellfs.
//!
//! This module provides:
//! - [`ShellExecutor`]: Trait for running a program's command line
//! - [`ProcessShell`]: Production implementation backed by a live `sh` session
//! - [`Shell`]: Wraps an executor with result classification and the
//!   program lifecycle hooks
//! - [`Signal`] and [`ShellInterrupter`]: Signalling the running command

mod classify;
mod pipe;
mod process;
mod signal;

use std::sync::Arc;

use tracing::debug;

use crate::error::ShellfsError;
use crate::mount::MountTable;
use crate::privilege::PrivilegeMethod;
use crate::program::{Program, SyncResultProgram};

pub use classify::{
    EXIT_COMMAND_NOT_FOUND, EXIT_SHELL_FAILURE, NO_SUCH_FILE, NOT_PERMITTED, PERMISSION_DENIED,
    READ_ONLY_FILESYSTEM, USAGE_PREFIX,
};
pub(crate) use pipe::panic_message;
pub use process::{EXIT_STOPPED_ON_STDERR, ProcessShell};
pub use signal::{ShellInterrupter, Signal};

/// What a shell observed for one completed invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutcome {
    /// Exit status of the command line.
    pub exit_code: i32,
    /// Captured stdout (empty for programs that do not capture it).
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Trait for running programs in a shell.
///
/// Implementors must forward every output chunk to the program's
/// `on_stdout`/`on_stderr` hooks as it arrives, and return only once the
/// command completed (or the wait policy gave up).
pub trait ShellExecutor: Send + Sync {
    /// Returns a short name for logging.
    fn name(&self) -> &str;

    /// Returns the escalation method if this shell runs privileged.
    fn privilege(&self) -> Option<PrivilegeMethod>;

    /// Runs the program's command line to completion.
    fn run(&self, program: &dyn Program) -> Result<RawOutcome, ShellfsError>;
}

/// A shell with classification.
///
/// `execute` drives the full program lifecycle: `on_start`, the executor
/// run, classification of the outcome, then `on_end` (always, success or
/// failure) before the result is returned.
#[derive(Clone)]
pub struct Shell {
    executor: Arc<dyn ShellExecutor>,
    mounts: Arc<MountTable>,
}

impl Shell {
    pub fn new(executor: Arc<dyn ShellExecutor>, mounts: Arc<MountTable>) -> Self {
        Self { executor, mounts }
    }

    pub fn name(&self) -> &str {
        self.executor.name()
    }

    pub fn privilege(&self) -> Option<PrivilegeMethod> {
        self.executor.privilege()
    }

    pub fn is_privileged(&self) -> bool {
        self.executor.privilege().is_some()
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    /// Runs a program and classifies the outcome.
    pub fn execute(&self, program: &Arc<dyn Program>) -> Result<RawOutcome, ShellfsError> {
        debug!(shell = %self.name(), command = %program.executable().command_line(), "executing");
        program.on_start()?;

        let outcome = match self.executor.run(program.as_ref()) {
            Ok(outcome) => outcome,
            Err(e) => {
                program.on_end(None);
                return Err(e);
            }
        };

        let verdict = classify::classify(program, &outcome, &self.mounts, self.is_privileged());
        program.on_end(Some(outcome.exit_code));
        verdict.map(|()| outcome)
    }

    /// Runs a program and parses its complete output.
    pub fn execute_sync<P>(&self, program: &Arc<P>) -> Result<P::Output, ShellfsError>
    where
        P: SyncResultProgram + 'static,
    {
        let dynamic: Arc<dyn Program> = program.clone();
        let outcome = self.execute(&dynamic)?;
        program.parse(&outcome.stdout, &outcome.stderr)
    }
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("name", &self.name())
            .field("privilege", &self.privilege())
            .finish()
    }
}
