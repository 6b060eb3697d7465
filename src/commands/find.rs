use std::sync::Arc;

use camino::Utf8Path;

use crate::context::Context;
use crate::error::ShellfsError;
use crate::executable::ExitPolicy;
use crate::program::{AsyncOptions, AsyncResultListener, AsyncResultProgram, LineParser};

/// Searches `directory` recursively for names matching `pattern`, streaming
/// every match to `listener`.
///
/// Unreadable subtrees are expected, so the stderr text rules are skipped;
/// cancelling terminates `find` with SIGTERM, which is not an error.
pub fn find(
    ctx: &Context,
    directory: &Utf8Path,
    pattern: &str,
    listener: Arc<dyn AsyncResultListener>,
) -> Result<Arc<AsyncResultProgram>, ShellfsError> {
    let executable = ctx.build("find", &[directory.as_str(), pattern])?;
    let options = AsyncOptions {
        cancellable: true,
        ignore_stderr_check: true,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::program::Program;

    struct Ignore;

    impl AsyncResultListener for Ignore {
        fn on_partial_result(&self, _data: &str) {}
    }

    #[test]
    fn find_is_cancellable_and_ignores_stderr() {
        let ctx = Context::new(Config::default(), false).unwrap();
        let program = find(&ctx, Utf8Path::new("/sdcard"), "*.jpg", Arc::new(Ignore)).unwrap();
        assert_eq!(program.executable().command_line(), "find \"/sdcard\" -name \"*.jpg\"");
        assert!(program.is_cancellable());
        assert!(program.ignore_stderr_check());
        assert!(program.exit_policy().accepts(143));
        assert!(program.write_targets().is_none());
    }
}
