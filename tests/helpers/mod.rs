//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use shellfs::catalog::CommandCatalog;
use shellfs::config::Config;
use shellfs::context::{Context, ShellLauncher};
use shellfs::error::ShellfsError;
use shellfs::mount::{DEFAULT_RESTRICTED_FS_TYPES, MountTable};
use shellfs::privilege::PrivilegeMethod;
use shellfs::program::Program;
use shellfs::shell::{RawOutcome, ShellExecutor};

/// Mount table used by the scenario tests.
pub const MOUNTS: &str = "\
/dev/root / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev 0 0
tmpfs /tmp tmpfs rw,relatime 0 0
/dev/block/sda1 /mnt/sdcard vfat ro,relatime 0 0
/dev/block/sdb1 /mnt/usb vfat ro,relatime 0 0
";

/// Command lines run by every scripted shell, prefixed with the shell name.
pub type CommandCalls = Arc<Mutex<Vec<String>>>;

struct Rule {
    needle: String,
    outcome: RawOutcome,
    remaining: Option<usize>,
}

/// Canned outcomes keyed by a substring of the command line.
///
/// The first matching rule wins; unmatched commands succeed silently.
#[derive(Clone, Default)]
pub struct Script {
    rules: Arc<Mutex<Vec<Rule>>>,
}

impl Script {
    fn push(self, needle: &str, outcome: RawOutcome, remaining: Option<usize>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            outcome,
            remaining,
        });
        self
    }

    /// Every command containing `needle` produces this outcome.
    pub fn on(self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.push(needle, outcome(exit_code, stdout, stderr), None)
    }

    /// Only the first command containing `needle` produces this outcome.
    pub fn once(self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.push(needle, outcome(exit_code, stdout, stderr), Some(1))
    }

    fn outcome(&self, command_line: &str) -> RawOutcome {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !command_line.contains(&rule.needle) {
                continue;
            }
            match &mut rule.remaining {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return rule.outcome.clone();
        }
        RawOutcome::default()
    }
}

pub fn outcome(exit_code: i32, stdout: &str, stderr: &str) -> RawOutcome {
    RawOutcome {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// A shell that answers from a script and records every command line.
pub struct ScriptedShell {
    name: String,
    privilege: Option<PrivilegeMethod>,
    script: Script,
    calls: CommandCalls,
}

impl ShellExecutor for ScriptedShell {
    fn name(&self) -> &str {
        &self.name
    }

    fn privilege(&self) -> Option<PrivilegeMethod> {
        self.privilege
    }

    fn run(&self, program: &dyn Program) -> Result<RawOutcome, ShellfsError> {
        let command_line = program.executable().command_line();
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}: {}", self.name, command_line));
        let outcome = self.script.outcome(&command_line);
        if !outcome.stdout.is_empty() {
            program.on_stdout(outcome.stdout.as_bytes());
        }
        if !outcome.stderr.is_empty() {
            program.on_stderr(outcome.stderr.as_bytes());
        }
        Ok(outcome)
    }
}

/// Launches scripted shells; the plain and elevated shells have their own scripts.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    pub plain: Script,
    pub elevated: Script,
    pub calls: CommandCalls,
    pub launches: Arc<Mutex<Vec<Option<PrivilegeMethod>>>>,
}

impl ShellLauncher for ScriptedLauncher {
    fn launch(&self, privilege: Option<PrivilegeMethod>) -> Result<Arc<dyn ShellExecutor>, ShellfsError> {
        self.launches.lock().unwrap().push(privilege);
        let (name, script) = match privilege {
            Some(method) => (format!("{}-sh", method), self.elevated.clone()),
            None => ("sh".to_string(), self.plain.clone()),
        };
        Ok(Arc::new(ScriptedShell {
            name,
            privilege,
            script,
            calls: Arc::clone(&self.calls),
        }))
    }
}

/// Writes `content` as a mount table in a fresh temporary directory.
pub fn mounts_file(content: &str) -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("mounts")).unwrap();
    fs::write(&path, content).unwrap();
    (dir, path)
}

/// Builds a context over [`MOUNTS`] running commands in scripted shells.
pub fn scripted_context(launcher: &ScriptedLauncher, elevated: bool) -> (tempfile::TempDir, Arc<Context>) {
    let (dir, path) = mounts_file(MOUNTS);
    let restricted = DEFAULT_RESTRICTED_FS_TYPES.iter().map(|t| t.to_string()).collect();
    let mounts = Arc::new(MountTable::new(path, Duration::from_secs(300), restricted));
    let context = Context::with_launcher(
        Config::default(),
        CommandCatalog::builtin().unwrap(),
        mounts,
        Box::new(launcher.clone()),
        elevated,
    )
    .unwrap();
    (dir, Arc::new(context))
}

/// Returns the recorded command lines and clears the log.
pub fn take_calls(calls: &CommandCalls) -> Vec<String> {
    std::mem::take(&mut *calls.lock().unwrap())
}
