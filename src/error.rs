//! Domain-specific error types for shellfs.
//!
//! This module defines `ShellfsError`, a `thiserror`-based enum covering the
//! failure taxonomy of shell-driven operations. Core APIs return
//! `Result<T, ShellfsError>`, while parser hooks and CLI entrypoints use
//! `anyhow::Result`.
//!
//! `ShellfsError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.
//! Callers that need the typed kind recover it with `downcast_ref`.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::mount::MountPoint;
use crate::program::Program;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"), so the text never
/// matches the stderr classification rules.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::BrokenPipe => "I/O error: broken pipe".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Work that can be replayed after a state change (privilege escalation).
///
/// Holds the ordered list of programs that still have to run, followed by
/// cleanup programs (mount restores) that run even if a pending program
/// fails again. It is built incrementally while mount/unmount steps are
/// composed around a failing write, and consumed exactly once by
/// [`Orchestrator::relaunch`].
///
/// [`Orchestrator::relaunch`]: crate::orchestrator::Orchestrator::relaunch
pub struct Relaunchable {
    pending: Vec<Arc<dyn Program>>,
    cleanup: Vec<Arc<dyn Program>>,
    cause: String,
}

impl Relaunchable {
    /// Creates a relaunchable failure whose only pending work is `failing`.
    pub fn new(failing: Arc<dyn Program>, cause: impl Into<String>) -> Self {
        Self::with_pending(vec![failing], cause)
    }

    /// Creates a relaunchable failure from an explicit pending list.
    pub fn with_pending(pending: Vec<Arc<dyn Program>>, cause: impl Into<String>) -> Self {
        Self {
            pending,
            cleanup: Vec::new(),
            cause: cause.into(),
        }
    }

    /// Returns the text describing why the work failed.
    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// Returns the pending programs in replay order.
    pub fn pending(&self) -> &[Arc<dyn Program>] {
        &self.pending
    }

    /// Returns the cleanup programs in replay order.
    pub fn cleanup(&self) -> &[Arc<dyn Program>] {
        &self.cleanup
    }

    /// Returns the command lines of every step, cleanup included, in replay order.
    pub fn command_lines(&self) -> Vec<String> {
        self.pending
            .iter()
            .chain(&self.cleanup)
            .map(|p| p.executable().command_line())
            .collect()
    }

    /// Returns the number of steps, cleanup included.
    pub fn len(&self) -> usize {
        self.pending.len() + self.cleanup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts programs before the current pending list.
    pub fn prepend<I>(&mut self, programs: I)
    where
        I: IntoIterator<Item = Arc<dyn Program>>,
    {
        let mut pending: Vec<_> = programs.into_iter().collect();
        pending.append(&mut self.pending);
        self.pending = pending;
    }

    /// Appends programs after the current pending list.
    pub fn extend<I>(&mut self, programs: I)
    where
        I: IntoIterator<Item = Arc<dyn Program>>,
    {
        self.pending.extend(programs);
    }

    /// Appends cleanup programs.
    pub fn add_cleanup<I>(&mut self, programs: I)
    where
        I: IntoIterator<Item = Arc<dyn Program>>,
    {
        self.cleanup.extend(programs);
    }

    /// Consumes the failure, returning the pending and cleanup programs.
    pub fn into_parts(self) -> (Vec<Arc<dyn Program>>, Vec<Arc<dyn Program>>) {
        (self.pending, self.cleanup)
    }
}

impl fmt::Debug for Relaunchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relaunchable")
            .field("pending", &self.command_lines())
            .field("cleanup", &self.cleanup.len())
            .field("cause", &self.cause)
            .finish()
    }
}

impl fmt::Display for Relaunchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} pending step(s))", self.cause, self.len())
    }
}

/// Domain-specific error type for shellfs.
///
/// Provides typed variants for every failure kind a shell invocation can
/// produce, so callers can match on the kind instead of parsing messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ShellfsError {
    /// The shell (or the command inside it) could not be found or started.
    #[error("command not found: {command}: {detail}")]
    CommandNotFound {
        /// The command or shell binary that could not be run.
        command: String,
        /// What the shell or the OS reported.
        detail: String,
    },

    /// The command was refused for lack of privileges; carries the work to
    /// replay after escalation.
    #[error("insufficient permissions: {0}")]
    InsufficientPermissions(Relaunchable),

    /// A write hit a read-only mount; carries the mount point to remount.
    #[error("read-only file system at {mount_point}: {command}")]
    ReadOnlyFilesystem {
        /// The command line that failed.
        command: String,
        /// The mount point that has to be remounted read-write.
        mount_point: MountPoint,
    },

    /// A path named by the command does not exist, or the command rejected its usage.
    #[error("no such file or directory: {command}: {detail}")]
    NoSuchFileOrDirectory {
        /// The command line that failed.
        command: String,
        /// The stderr text that triggered the classification.
        detail: String,
    },

    /// A command execution failed (non-zero exit, broken session, thread failure, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure: exit code, stderr excerpt,
        /// or a description of the internal error.
        status: String,
    },

    /// A command id or argument template could not be turned into an executable.
    #[error("invalid command definition: {0}")]
    InvalidCommandDefinition(String),

    /// The shell produced no completion within the bounded wait.
    #[error("operation timed out after {}ms: {command}", timeout.as_millis())]
    OperationTimeout {
        /// The command line that timed out.
        command: String,
        /// The bounded wait that elapsed.
        timeout: Duration,
    },

    /// A validation constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A configuration or catalog file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: io::Error,
    },
}

impl ShellfsError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates an `Execution` variant.
    pub(crate) fn execution(command: impl Into<String>, status: impl Into<String>) -> Self {
        Self::Execution {
            command: command.into(),
            status: status.into(),
        }
    }

    /// Returns true for failures whose remedy is a state change followed by a replay.
    pub fn is_relaunchable(&self) -> bool {
        matches!(self, Self::InsufficientPermissions(_) | Self::ReadOnlyFilesystem { .. })
    }
}
