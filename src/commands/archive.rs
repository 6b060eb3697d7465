use std::sync::Arc;

use camino::Utf8Path;

use crate::context::Context;
use crate::error::ShellfsError;
use crate::executable::{ExitPolicy, WriteTargets};
use crate::program::{AsyncOptions, AsyncResultListener, AsyncResultProgram, LineParser};

fn archive_options(ctx: &Context) -> AsyncOptions {
    AsyncOptions {
        cancellable: true,
        exit_policy: ExitPolicy::CANCELLATION,
        ..ctx.async_options()
    }
}

/// Packs `entries` of `base` into the gzip tarball `archive`.
///
/// `tar -v` lists each entry as it is added; those lines are the partial
/// results. The mount of `archive` is made writable.
pub fn compress<S: AsRef<str>>(
    ctx: &Context,
    archive: &Utf8Path,
    base: &Utf8Path,
    entries: &[S],
    listener: Arc<dyn AsyncResultListener>,
) -> Result<Arc<AsyncResultProgram>, ShellfsError> {
    if entries.is_empty() {
        return Err(ShellfsError::Validation(format!("nothing to add to {}", archive)));
    }
    let mut args = vec![archive.as_str(), base.as_str()];
    args.extend(entries.iter().map(|e| e.as_ref()));
    let executable = ctx.build("compress", &args)?;
    let program = AsyncResultProgram::new(executable, archive_options(ctx), Arc::new(LineParser), listener)
        .with_write_targets(WriteTargets::destination(archive));
    Ok(Arc::new(program))
}

/// Extracts the gzip tarball `archive` into `destination`.
pub fn uncompress(
    ctx: &Context,
    archive: &Utf8Path,
    destination: &Utf8Path,
    listener: Arc<dyn AsyncResultListener>,
) -> Result<Arc<AsyncResultProgram>, ShellfsError> {
    let executable = ctx.build("uncompress", &[archive.as_str(), destination.as_str()])?;
    let program = AsyncResultProgram::new(executable, archive_options(ctx), Arc::new(LineParser), listener)
        .with_write_targets(WriteTargets::destination(destination));
    Ok(Arc::new(program))
}
