use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::context::Context;
use crate::error::ShellfsError;
use crate::executable::Executable;
use crate::program::{Program, SyncResultProgram, WaitMode};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub path: Utf8PathBuf,
    pub is_dir: bool,
}

/// Lists a directory, one entry per line (`ls -1Ap`).
///
/// Large directories keep the bounded wait alive as long as output arrives.
#[derive(Debug, Clone)]
pub struct ListDirectory {
    executable: Executable,
    directory: Utf8PathBuf,
}

impl ListDirectory {
    pub fn new(ctx: &Context, directory: &Utf8Path) -> Result<Arc<Self>, ShellfsError> {
        let executable = ctx.build("list", &[directory.as_str()])?;
        Ok(Arc::new(Self {
            executable,
            directory: directory.to_owned(),
        }))
    }
}

impl Program for ListDirectory {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn wait_mode(&self) -> WaitMode {
        WaitMode::Bounded { reset_on_data: true }
    }
}

impl SyncResultProgram for ListDirectory {
    type Output = Vec<DirEntry>;

    fn parse(&self, stdout: &str, _stderr: &str) -> Result<Vec<DirEntry>, ShellfsError> {
        let entries = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let (name, is_dir) = match line.strip_suffix('/') {
                    Some(name) => (name, true),
                    None => (line, false),
                };
                if matches!(name, "" | "." | "..") {
                    return None;
                }
                Some(DirEntry {
                    name: name.to_string(),
                    path: self.directory.join(name),
                    is_dir,
                })
            })
            .collect();
        Ok(entries)
    }
}
