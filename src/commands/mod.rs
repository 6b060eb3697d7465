//! Concrete commands.
//!
//! Each command is composed from the capability traits in
//! [`program`](crate::program): what it runs ([`Executable`]), whether it
//! writes ([`WriteTargets`]), how long the shell waits ([`WaitMode`]),
//! which exit codes it tolerates ([`ExitPolicy`]), and how its output is
//! parsed (sync or streamed). Constructors resolve their executable through
//! the catalog of a [`Context`].

mod archive;
mod checksum;
mod find;
mod list;
mod remount;
mod write;

use std::sync::Arc;

use camino::Utf8Path;

use crate::context::Context;
use crate::error::ShellfsError;
use crate::executable::{Executable, ExitPolicy, WriteTargets};
use crate::program::{
    AsyncOptions, AsyncResultListener, AsyncResultProgram, LineParser, Program, SyncResultProgram,
    WaitMode,
};

pub use archive::{compress, uncompress};
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use find::find;
pub use list::{DirEntry, ListDirectory};
pub use remount::RemountProgram;
pub use write::WriteFile;

/// A command run for its side effect on the filesystem.
#[derive(Debug, Clone)]
pub struct FileOperation {
    executable: Executable,
    targets: Option<WriteTargets>,
    exit_policy: ExitPolicy,
    wait_mode: WaitMode,
}

impl FileOperation {
    pub fn new(executable: Executable, targets: Option<WriteTargets>) -> Self {
        Self {
            executable,
            targets,
            exit_policy: ExitPolicy::STRICT,
            wait_mode: WaitMode::Indefinite,
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
}

impl Program for FileOperation {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn exit_policy(&self) -> ExitPolicy {
        self.exit_policy
    }

    fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    fn write_targets(&self) -> Option<WriteTargets> {
        self.targets.clone()
    }
}

impl SyncResultProgram for FileOperation {
    type Output = ();

    fn parse(&self, _stdout: &str, _stderr: &str) -> Result<(), ShellfsError> {
        Ok(())
    }
}

/// Copies `source` (recursively) to `destination`.
pub fn copy(ctx: &Context, source: &Utf8Path, destination: &Utf8Path) -> Result<Arc<FileOperation>, ShellfsError> {
    let executable = ctx.build("copy", &[source.as_str(), destination.as_str()])?;
    Ok(Arc::new(FileOperation::new(executable, Some(WriteTargets::destination(destination)))))
}

/// Moves `source` to `destination`; both mounts are written.
pub fn move_path(ctx: &Context, source: &Utf8Path, destination: &Utf8Path) -> Result<Arc<FileOperation>, ShellfsError> {
    let executable = ctx.build("move", &[source.as_str(), destination.as_str()])?;
    Ok(Arc::new(FileOperation::new(
        executable,
        Some(WriteTargets::transfer(source, destination)),
    )))
}

/// Deletes `paths` recursively.
///
/// The mount of the first path is the one made writable.
pub fn delete<P: AsRef<Utf8Path>>(ctx: &Context, paths: &[P]) -> Result<Arc<FileOperation>, ShellfsError> {
    let Some(first) = paths.first() else {
        return Err(ShellfsError::Validation("delete requires at least one path".to_string()));
    };
    let args: Vec<&str> = paths.iter().map(|p| p.as_ref().as_str()).collect();
    let executable = ctx.build("delete", &args)?;
    Ok(Arc::new(FileOperation::new(
        executable,
        Some(WriteTargets::destination(first.as_ref())),
    )))
}

/// Creates `path` and its missing parents.
pub fn make_directory(ctx: &Context, path: &Utf8Path) -> Result<Arc<FileOperation>, ShellfsError> {
    let executable = ctx.build("mkdir", &[path.as_str()])?;
    Ok(Arc::new(
        FileOperation::new(executable, Some(WriteTargets::destination(path))).with_wait_mode(WaitMode::default()),
    ))
}

/// Changes the mode of `path`. Tolerates no exit code besides 0.
pub fn change_mode(ctx: &Context, mode: &str, path: &Utf8Path) -> Result<Arc<FileOperation>, ShellfsError> {
    let executable = ctx.build("chmod", &[mode, path.as_str()])?;
    Ok(Arc::new(
        FileOperation::new(executable, Some(WriteTargets::destination(path)))
            .with_exit_policy(ExitPolicy::STRICT)
            .with_wait_mode(WaitMode::default()),
    ))
}

/// Runs any catalog command, returning its stdout.
pub fn catalog_command<S: AsRef<str>>(ctx: &Context, id: &str, args: &[S]) -> Result<Arc<FileOperation>, ShellfsError> {
    let executable = ctx.build(id, args)?;
    Ok(Arc::new(FileOperation::new(executable, None)))
}

/// Runs any catalog command, streaming its output lines to `listener`.
pub fn streaming_command<S: AsRef<str>>(
    ctx: &Context,
    id: &str,
    args: &[S],
    listener: Arc<dyn AsyncResultListener>,
) -> Result<Arc<AsyncResultProgram>, ShellfsError> {
    let executable = ctx.build(id, args)?;
    let options = AsyncOptions {
        cancellable: true,
        exit_policy: ExitPolicy::CANCELLATION,
        ..ctx.async_options()
    };
    Ok(Arc::new(AsyncResultProgram::new(
        executable,
        options,
        Arc::new(LineParser),
        listener,
    )))
}
