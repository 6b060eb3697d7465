//! Privilege escalation for elevated shells.
//!
//! An elevated [`ProcessShell`](crate::shell::ProcessShell) runs its shell
//! binary under one of these methods. Escalation is always non-interactive:
//! a method that would prompt for a password fails instead, and the failure
//! surfaces as a spawn or handshake error.

use serde::{Deserialize, Serialize};

/// Privilege escalation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMethod {
    /// Use `sudo -n` for privilege escalation.
    #[default]
    Sudo,
    /// Use `doas -n` for privilege escalation.
    Doas,
    /// Use `su -c` for privilege escalation.
    Su,
}

impl PrivilegeMethod {
    /// Returns the command name for this privilege method.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Sudo => "sudo",
            Self::Doas => "doas",
            Self::Su => "su",
        }
    }

    /// Returns the program and arguments that start `shell` with this method.
    pub fn wrap_shell(&self, shell: &str) -> (&'static str, Vec<String>) {
        let args = match self {
            Self::Sudo | Self::Doas => vec!["-n".to_string(), shell.to_string()],
            Self::Su => vec!["-c".to_string(), shell.to_string()],
        };
        (self.command_name(), args)
    }

    /// Returns the argument vector that runs `program args..` with this method.
    ///
    /// `su` takes a single command string; its arguments are joined with spaces.
    pub fn wrap_command(&self, program: &str, args: &[String]) -> Vec<String> {
        match self {
            Self::Sudo | Self::Doas => {
                let mut argv = vec![self.command_name().to_string(), "-n".to_string()];
                argv.push(program.to_string());
                argv.extend(args.iter().cloned());
                argv
            }
            Self::Su => {
                let mut line = program.to_string();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                vec![self.command_name().to_string(), "-c".to_string(), line]
            }
        }
    }
}

impl std::fmt::Display for PrivilegeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command_name())
    }
}

/// Returns true if the current process already runs as root.
///
/// An elevated shell started by root skips the escalation wrapper.
pub fn running_as_root() -> bool {
    rustix::process::getuid().is_root()
}
