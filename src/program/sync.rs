//! Programs whose result is parsed once from the complete output.

use super::Program;
use crate::error::ShellfsError;

/// A program that buffers the full stdout/stderr and parses them once.
///
/// [`Shell::execute_sync`](crate::shell::Shell::execute_sync) calls `parse`
/// exactly once, after the shell confirmed completion and after stderr was
/// classified without raising an error. Implementations keep no state
/// between invocations; a new instance is built per call.
pub trait SyncResultProgram: Program {
    /// The parsed result.
    type Output;

    /// Parses the captured output.
    fn parse(&self, stdout: &str, stderr: &str) -> Result<Self::Output, ShellfsError>;
}
