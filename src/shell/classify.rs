//! Classification of a finished invocation.
//!
//! The rules are order-sensitive and match literal substrings of POSIX
//! coreutils output, so the shell runs with `LC_ALL=C`.

use std::sync::Arc;

use tracing::debug;

use super::RawOutcome;
use crate::error::{Relaunchable, ShellfsError};
use crate::executable::first_line;
use crate::mount::MountTable;
use crate::program::Program;

/// Exit status of a shell that could not find the command.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
/// Exit status reported when the shell itself failed.
pub const EXIT_SHELL_FAILURE: i32 = 255;

pub const NO_SUCH_FILE: &str = "No such file or directory";
pub const USAGE_PREFIX: &str = "Usage:";
pub const PERMISSION_DENIED: &str = "Permission denied";
pub const NOT_PERMITTED: &str = "Operation not permitted";
pub const READ_ONLY_FILESYSTEM: &str = "Read-only file system";

/// Applies the classification rules to a finished invocation.
///
/// `privileged` forces a fresh mount-table read when a read-only failure
/// has to be mapped to its mount point.
pub(crate) fn classify(
    program: &Arc<dyn Program>,
    outcome: &RawOutcome,
    mounts: &MountTable,
    privileged: bool,
) -> Result<(), ShellfsError> {
    let executable = program.executable();
    let code = outcome.exit_code;
    let stderr = outcome.stderr.as_str();
    let detail = || first_line(stderr).unwrap_or_default().to_string();

    if code == EXIT_COMMAND_NOT_FOUND {
        return Err(ShellfsError::CommandNotFound {
            command: executable.command_path().to_string(),
            detail: detail(),
        });
    }
    if code == EXIT_SHELL_FAILURE {
        return Err(ShellfsError::execution(
            executable.command_line(),
            format!("exit code {}: {}", code, detail()),
        ));
    }

    if !program.ignore_stderr_check() {
        if (stderr.contains(NO_SUCH_FILE) && code != 0) || stderr.starts_with(USAGE_PREFIX) {
            return Err(ShellfsError::NoSuchFileOrDirectory {
                command: executable.command_line(),
                detail: detail(),
            });
        }

        if stderr.contains(PERMISSION_DENIED) || (stderr.contains(NOT_PERMITTED) && code != 0) {
            return Err(ShellfsError::InsufficientPermissions(Relaunchable::new(
                Arc::clone(program),
                detail(),
            )));
        }

        if stderr.contains(READ_ONLY_FILESYSTEM) {
            let Some(targets) = program.write_targets() else {
                return Err(ShellfsError::execution(executable.command_line(), detail()));
            };
            return match mounts.find(&targets.destination, privileged) {
                Ok(mount_point) => Err(ShellfsError::ReadOnlyFilesystem {
                    command: executable.command_line(),
                    mount_point,
                }),
                Err(e) => {
                    debug!("no mount point for {}: {}", targets.destination, e);
                    Err(ShellfsError::execution(executable.command_line(), detail()))
                }
            };
        }
    }

    program.exit_policy().check(executable, code, stderr)
}
