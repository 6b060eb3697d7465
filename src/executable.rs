//! Executables: fully-specified shell invocations.
//!
//! An [`Executable`] is immutable once built. The catalog creates one per
//! call (see [`CommandCatalog::build`](crate::catalog::CommandCatalog::build));
//! it is never pooled and is dropped when the operation completes.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ShellfsError;

/// A ready-to-run shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    id: String,
    command_path: String,
    args: String,
    prepared: bool,
}

impl Executable {
    /// Creates an executable from an already formatted argument string.
    ///
    /// `prepared` is true: the arguments were produced from a catalog template.
    pub fn new(
        id: impl Into<String>,
        command_path: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            command_path: command_path.into(),
            args: args.into(),
            prepared: true,
        }
    }

    /// Creates an executable from a raw command line that bypassed the catalog.
    pub fn raw(id: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command_path: command_line.into(),
            args: String::new(),
            prepared: false,
        }
    }

    /// Returns the catalog id of this executable.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the executable path (or the raw command line).
    pub fn command_path(&self) -> &str {
        &self.command_path
    }

    /// Returns the formatted argument string.
    pub fn args(&self) -> &str {
        &self.args
    }

    /// Returns true if the arguments were formatted from a catalog template.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Returns the line written to the shell: `path + " " + formattedArgs`.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command_path.clone()
        } else {
            format!("{} {}", self.command_path, self.args)
        }
    }
}

/// Exit codes a command accepts besides zero.
///
/// Each command declares its own set explicitly; nothing is inferred from
/// the command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitPolicy {
    tolerated: &'static [i32],
}

impl ExitPolicy {
    /// Only exit code 0 is a success.
    pub const STRICT: Self = Self { tolerated: &[] };

    /// Termination by SIGKILL (137) or SIGTERM (143) counts as a cancellation, not an error.
    pub const CANCELLATION: Self = Self {
        tolerated: &[137, 143],
    };

    /// Creates a policy tolerating the given exit codes.
    pub const fn tolerating(codes: &'static [i32]) -> Self {
        Self { tolerated: codes }
    }

    /// Returns the tolerated exit codes.
    pub fn tolerated(&self) -> &'static [i32] {
        self.tolerated
    }

    /// Returns true if `code` is zero or tolerated.
    pub fn accepts(&self, code: i32) -> bool {
        code == 0 || self.tolerated.contains(&code)
    }

    /// Applies the policy to an exit code.
    pub fn check(
        &self,
        executable: &Executable,
        code: i32,
        stderr: &str,
    ) -> Result<(), ShellfsError> {
        if self.accepts(code) {
            return Ok(());
        }
        let status = match first_line(stderr) {
            Some(line) => format!("exit code {}: {}", code, line),
            None => format!("exit code {}", code),
        };
        Err(ShellfsError::execution(executable.command_line(), status))
    }
}

/// Returns the first non-blank line of a stderr capture, trimmed.
pub(crate) fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Paths a writable operation mutates.
///
/// The orchestrator maps them to mount points to decide whether a
/// read-write remount is needed before the operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTargets {
    /// Path that receives the write.
    pub destination: Utf8PathBuf,
    /// Path that is read (and, for moves, removed), if any.
    pub source: Option<Utf8PathBuf>,
}

impl WriteTargets {
    /// Targets for an operation that only writes to `destination`.
    pub fn destination(destination: impl AsRef<Utf8Path>) -> Self {
        Self {
            destination: destination.as_ref().to_owned(),
            source: None,
        }
    }

    /// Targets for an operation that reads `source` and writes `destination`.
    pub fn transfer(source: impl AsRef<Utf8Path>, destination: impl AsRef<Utf8Path>) -> Self {
        Self {
            destination: destination.as_ref().to_owned(),
            source: Some(source.as_ref().to_owned()),
        }
    }
}
