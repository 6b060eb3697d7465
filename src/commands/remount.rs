use std::sync::Arc;

use crate::catalog::CommandCatalog;
use crate::error::ShellfsError;
use crate::executable::Executable;
use crate::mount::{MountPoint, MountTable};
use crate::program::{Program, SyncResultProgram};

/// Remounts one mount point read-write or read-only.
///
/// A successful run updates the cached mode of the mount point, so a replay
/// after escalation leaves the cache in step with the system.
#[derive(Debug)]
pub struct RemountProgram {
    executable: Executable,
    mount_point: MountPoint,
    read_write: bool,
    mounts: Arc<MountTable>,
}

impl RemountProgram {
    pub fn new(
        catalog: &CommandCatalog,
        mounts: Arc<MountTable>,
        mount_point: &MountPoint,
        read_write: bool,
    ) -> Result<Self, ShellfsError> {
        let mode = if read_write { "rw" } else { "ro" };
        let executable = catalog.build(
            "remount",
            &[
                mode,
                mount_point.fs_type(),
                mount_point.device(),
                mount_point.path().as_str(),
            ],
        )?;
        Ok(Self {
            executable,
            mount_point: mount_point.clone(),
            read_write,
            mounts,
        })
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    pub fn is_read_write(&self) -> bool {
        self.read_write
    }
}

impl Program for RemountProgram {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn remount(&self) -> Option<(&MountPoint, bool)> {
        Some((&self.mount_point, self.read_write))
    }

    fn on_end(&self, exit_code: Option<i32>) {
        if exit_code != Some(0) {
            return;
        }
        if self.read_write {
            self.mounts.mark_read_write(self.mount_point.path());
        } else {
            self.mounts.mark_read_only(self.mount_point.path());
        }
    }
}

impl SyncResultProgram for RemountProgram {
    type Output = ();

    fn parse(&self, _stdout: &str, _stderr: &str) -> Result<(), ShellfsError> {
        Ok(())
    }
}
