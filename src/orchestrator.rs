//! Command orchestration.
//!
//! The [`Orchestrator`] sequences multi-step operations on the active shell
//! of a [`Context`]. Writable operations follow the writable protocol:
//!
//! 1. Map the destination (and source) path to its mount point and decide
//!    per mount whether a read-write remount is needed.
//! 2. Remount each such mount read-write, destination first.
//! 3. Run the operation.
//! 4. Remount read-only every mount this operation made writable, unless
//!    the caller asked to leave them mounted. This step runs whether or not
//!    the operation succeeded.
//!
//! Steps never overlap: each one depends on the filesystem state left by
//! the previous one. When a step is refused for lack of privileges, the
//! error carries every step still to run (and the restores), so
//! [`Orchestrator::relaunch`] can replay exactly the remaining work on an
//! elevated shell.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::commands::RemountProgram;
use crate::context::Context;
use crate::error::{Relaunchable, ShellfsError};
use crate::executable::WriteTargets;
use crate::mount::MountPoint;
use crate::program::{Program, SyncResultProgram};
use crate::shell::{RawOutcome, Shell};

fn same_program(a: &Arc<dyn Program>, b: &Arc<dyn Program>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Attaches the steps around a refused step to its replay state.
///
/// `steps` is the full sequence (remounts then the operation) and `failed`
/// the index of the refused one. Without `leave_mounted`, the remounts that
/// already ran are undone by this attempt's cleanup, so they are replayed
/// too and the restores become the replay's cleanup.
fn compose_pending(
    err: ShellfsError,
    steps: &[Arc<dyn Program>],
    failed: usize,
    restores: &[Arc<dyn Program>],
    leave_mounted: bool,
) -> ShellfsError {
    let ShellfsError::InsufficientPermissions(mut relaunchable) = err else {
        return err;
    };
    if !leave_mounted {
        relaunchable.prepend(steps[..failed].iter().cloned());
    }
    relaunchable.extend(steps[failed + 1..].iter().cloned());
    if !leave_mounted {
        relaunchable.add_cleanup(restores.iter().rev().cloned());
    }
    ShellfsError::InsufficientPermissions(relaunchable)
}

/// Merges the outcome of an operation with the outcome of its cleanup.
///
/// A primary failure wins; the cleanup failure is only logged.
fn with_cleanup<T>(
    result: Result<T, ShellfsError>,
    cleanup: Result<(), ShellfsError>,
    command: &str,
) -> Result<T, ShellfsError> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(ShellfsError::execution(
            command,
            format!("failed to restore read-only mounts: {}", e),
        )),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            error!(command = %command, "cleanup failed after error: {}", cleanup_err);
            Err(e)
        }
    }
}

/// Runs operations against the active shell of a context.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    context: Arc<Context>,
}

impl Orchestrator {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Runs a program, applying the writable protocol if it writes.
    ///
    /// On failure the program's `on_exception` hook receives the error
    /// before it is returned.
    pub fn execute(&self, program: Arc<dyn Program>) -> Result<RawOutcome, ShellfsError> {
        self.execute_writable(program, false)
    }

    /// Runs a program; with `leave_mounted`, mounts made writable stay
    /// read-write afterwards (for a follow-up write on the same mount).
    pub fn execute_writable(&self, program: Arc<dyn Program>, leave_mounted: bool) -> Result<RawOutcome, ShellfsError> {
        let result = self.attempt(&program, leave_mounted);
        if let Err(e) = &result {
            program.on_exception(e);
        }
        result
    }

    /// Runs a program and parses its complete output.
    pub fn execute_sync<P>(&self, program: &Arc<P>) -> Result<P::Output, ShellfsError>
    where
        P: SyncResultProgram + 'static,
    {
        let dynamic: Arc<dyn Program> = program.clone();
        let outcome = self.execute(dynamic)?;
        program.parse(&outcome.stdout, &outcome.stderr)
    }

    /// Replays the work of a refused operation on the active shell.
    ///
    /// Pending programs run in order and stop at the first failure; cleanup
    /// programs always run afterwards. A new failure is returned as is,
    /// relaunchable or not. The outcomes are those of the pending programs.
    ///
    /// Remount steps go through the writable leases like those of a first
    /// attempt: a read-write step shares a lease another operation holds
    /// instead of remounting, and a read-only step only restores the mount
    /// when this replay held its last lease.
    pub fn relaunch(&self, relaunchable: Relaunchable) -> Result<Vec<RawOutcome>, ShellfsError> {
        let shell = self.context.shell();
        info!(shell = %shell.name(), steps = relaunchable.len(), "relaunching pending work");
        let (pending, cleanup) = relaunchable.into_parts();
        let mut leased = Vec::new();

        let mut outcomes = Vec::with_capacity(pending.len());
        let mut failure = None;
        for program in &pending {
            match self.replay_step(&shell, program, &mut leased) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut cleanup_result = Ok(());
        for program in &cleanup {
            if let Err(e) = self.replay_step(&shell, program, &mut leased) {
                warn!(command = %program.executable().command_line(), "relaunch cleanup step failed: {}", e);
                if cleanup_result.is_ok() {
                    cleanup_result = Err(e);
                }
            }
        }
        // no restore step: the mount stays read-write
        for mount_point in &leased {
            self.context.mounts().abandon_writable(mount_point);
        }

        let result = match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        };
        with_cleanup(result, cleanup_result, "relaunch")
    }

    /// Runs one replayed step, taking and giving back writable leases for
    /// remount steps. `leased` holds the leases this replay owns.
    fn replay_step(
        &self,
        shell: &Shell,
        program: &Arc<dyn Program>,
        leased: &mut Vec<MountPoint>,
    ) -> Result<RawOutcome, ShellfsError> {
        let Some((mount_point, read_write)) = program.remount() else {
            return shell.execute(program);
        };
        let mounts = self.context.mounts();
        let mut outcome = RawOutcome::default();
        let mut run = || -> Result<(), ShellfsError> {
            outcome = shell.execute(program)?;
            Ok(())
        };

        if read_write {
            mounts.acquire_writable(mount_point, &mut run)?;
            leased.push(mount_point.clone());
        } else {
            let Some(index) = leased.iter().rposition(|mp| mp.path() == mount_point.path()) else {
                debug!(mount_point = %mount_point, "no lease held by this replay; restore skipped");
                return Ok(RawOutcome::default());
            };
            leased.remove(index);
            mounts.release_writable(mount_point, &mut run)?;
        }
        Ok(outcome)
    }

    /// Runs a program, escalating privileges if it is refused.
    ///
    /// `confirm` decides on an `InsufficientPermissions` failure whether to
    /// switch to the elevated shell and replay the pending work. It is asked
    /// at most once; a failure of the replay is returned without asking.
    pub fn run_with_escalation<F>(&self, program: Arc<dyn Program>, confirm: F) -> Result<RawOutcome, ShellfsError>
    where
        F: FnOnce(&ShellfsError) -> bool,
    {
        let err = match self.attempt(&program, false) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        let confirmed = matches!(err, ShellfsError::InsufficientPermissions(_)) && confirm(&err);
        let result = match err {
            ShellfsError::InsufficientPermissions(relaunchable) if confirmed => {
                self.escalate_and_relaunch(&program, relaunchable)
            }
            other => Err(other),
        };
        if let Err(e) = &result {
            program.on_exception(e);
        }
        result
    }

    /// [`run_with_escalation`](Self::run_with_escalation) for programs parsed once.
    pub fn execute_sync_escalating<P, F>(&self, program: &Arc<P>, confirm: F) -> Result<P::Output, ShellfsError>
    where
        P: SyncResultProgram + 'static,
        F: FnOnce(&ShellfsError) -> bool,
    {
        let dynamic: Arc<dyn Program> = program.clone();
        let outcome = self.run_with_escalation(dynamic, confirm)?;
        program.parse(&outcome.stdout, &outcome.stderr)
    }

    fn escalate_and_relaunch(
        &self,
        program: &Arc<dyn Program>,
        relaunchable: Relaunchable,
    ) -> Result<RawOutcome, ShellfsError> {
        let command = program.executable().command_line();
        let index = relaunchable
            .pending()
            .iter()
            .position(|p| same_program(p, program))
            .ok_or_else(|| ShellfsError::execution(&command, "operation missing from pending work"))?;
        self.context.elevate()?;
        let outcomes = self.relaunch(relaunchable)?;
        outcomes
            .into_iter()
            .nth(index)
            .ok_or_else(|| ShellfsError::execution(command, "operation did not run during relaunch"))
    }

    fn attempt(&self, program: &Arc<dyn Program>, leave_mounted: bool) -> Result<RawOutcome, ShellfsError> {
        let Some(targets) = program.write_targets() else {
            return self.context.shell().execute(program);
        };
        match self.writable_attempt(program, &targets, leave_mounted, false) {
            Err(ShellfsError::ReadOnlyFilesystem { command, mount_point }) => {
                warn!(command = %command, mount_point = %mount_point, "mount is read-only, retrying with remount");
                self.context.mounts().mark_read_only(mount_point.path());
                self.writable_attempt(program, &targets, leave_mounted, true)
            }
            other => other,
        }
    }

    /// Returns the mounts to make writable, destination first.
    fn plan_mounts(&self, targets: &WriteTargets, refresh: bool) -> Result<Vec<MountPoint>, ShellfsError> {
        let mounts = self.context.mounts();
        let mut planned: Vec<MountPoint> = Vec::new();
        for path in std::iter::once(&targets.destination).chain(targets.source.as_ref()) {
            let Some(mount_point) = mounts.plan_writable(path, refresh)? else {
                continue;
            };
            if planned.iter().all(|p| p.path() != mount_point.path()) {
                planned.push(mount_point);
            }
        }
        Ok(planned)
    }

    fn remount_steps(&self, planned: &[MountPoint], read_write: bool) -> Result<Vec<Arc<dyn Program>>, ShellfsError> {
        planned
            .iter()
            .map(|mount_point| -> Result<Arc<dyn Program>, ShellfsError> {
                let step = RemountProgram::new(
                    self.context.catalog(),
                    Arc::clone(self.context.mounts()),
                    mount_point,
                    read_write,
                )?;
                Ok(Arc::new(step))
            })
            .collect()
    }

    fn writable_attempt(
        &self,
        program: &Arc<dyn Program>,
        targets: &WriteTargets,
        leave_mounted: bool,
        retry: bool,
    ) -> Result<RawOutcome, ShellfsError> {
        let shell = self.context.shell();
        let privileged = shell.is_privileged();
        // A retry trusts the cache, which now records the read-only mount.
        let planned = self.plan_mounts(targets, privileged && !retry)?;
        if planned.is_empty() {
            debug!(destination = %targets.destination, "no remount needed");
            return shell.execute(program);
        }

        let mut steps = self.remount_steps(&planned, true)?;
        let restores = self.remount_steps(&planned, false)?;
        steps.push(Arc::clone(program));

        if !privileged {
            let names: Vec<String> = planned.iter().map(|mp| mp.path().to_string()).collect();
            let mut relaunchable = Relaunchable::with_pending(
                steps,
                format!("remounting {} read-write requires privileges", names.join(", ")),
            );
            if !leave_mounted {
                relaunchable.add_cleanup(restores.iter().rev().cloned());
            }
            return Err(ShellfsError::InsufficientPermissions(relaunchable));
        }

        let mounts = self.context.mounts();
        let mut acquired = Vec::with_capacity(planned.len());
        let mut result = None;
        for (index, mount_point) in planned.iter().enumerate() {
            let step = &steps[index];
            match mounts.acquire_writable(mount_point, || shell.execute(step).map(|_| ())) {
                Ok(_) => acquired.push(index),
                Err(e) => {
                    result = Some(Err(compose_pending(e, &steps, index, &restores, leave_mounted)));
                    break;
                }
            }
        }
        let result = result.unwrap_or_else(|| {
            shell
                .execute(program)
                .map_err(|e| compose_pending(e, &steps, planned.len(), &restores, leave_mounted))
        });

        let cleanup = self.release(&shell, &planned, &acquired, &restores, leave_mounted);
        with_cleanup(result, cleanup, &program.executable().command_line())
    }

    /// Gives back the leases taken by one attempt, last acquired first.
    fn release(
        &self,
        shell: &Shell,
        planned: &[MountPoint],
        acquired: &[usize],
        restores: &[Arc<dyn Program>],
        leave_mounted: bool,
    ) -> Result<(), ShellfsError> {
        let mounts = self.context.mounts();
        let mut first_error = None;
        for &index in acquired.iter().rev() {
            let mount_point = &planned[index];
            if leave_mounted {
                mounts.abandon_writable(mount_point);
                continue;
            }
            let restore = &restores[index];
            if let Err(e) = mounts.release_writable(mount_point, || shell.execute(restore).map(|_| ())) {
                warn!(mount_point = %mount_point, "failed to restore read-only: {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::Executable;
    use crate::program::RawProgram;

    fn program(line: &str) -> Arc<dyn Program> {
        Arc::new(RawProgram::new(Executable::raw("test", line)))
    }

    fn denied(failing: &Arc<dyn Program>) -> ShellfsError {
        ShellfsError::InsufficientPermissions(Relaunchable::new(Arc::clone(failing), "denied"))
    }

    fn lines(err: ShellfsError) -> Vec<String> {
        match err {
            ShellfsError::InsufficientPermissions(r) => r.command_lines(),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn refused_operation_replays_mounts_and_restores() {
        let steps = vec![program("mount rw /a"), program("mount rw /b"), program("cp")];
        let restores = vec![program("mount ro /a"), program("mount ro /b")];
        let err = compose_pending(denied(&steps[2]), &steps, 2, &restores, false);
        assert_eq!(
            lines(err),
            vec!["mount rw /a", "mount rw /b", "cp", "mount ro /b", "mount ro /a"]
        );
    }

    #[test]
    fn refused_remount_keeps_remaining_steps() {
        let steps = vec![program("mount rw /a"), program("mount rw /b"), program("cp")];
        let restores = vec![program("mount ro /a"), program("mount ro /b")];
        let err = compose_pending(denied(&steps[1]), &steps, 1, &restores, false);
        assert_eq!(
            lines(err),
            vec!["mount rw /a", "mount rw /b", "cp", "mount ro /b", "mount ro /a"]
        );
    }

    #[test]
    fn leave_mounted_skips_done_steps_and_restores() {
        let steps = vec![program("mount rw /a"), program("mount rw /b"), program("cp")];
        let restores = vec![program("mount ro /a"), program("mount ro /b")];
        let err = compose_pending(denied(&steps[1]), &steps, 1, &restores, true);
        assert_eq!(lines(err), vec!["mount rw /b", "cp"]);
    }

    #[test]
    fn other_errors_pass_through() {
        let steps = vec![program("cp")];
        let err = compose_pending(ShellfsError::execution("cp", "exit code 1"), &steps, 0, &[], false);
        assert!(matches!(err, ShellfsError::Execution { .. }));
    }

    #[test]
    fn cleanup_failure_after_success_is_returned() {
        let err = with_cleanup(Ok(1), Err(ShellfsError::execution("mount", "exit code 32")), "cp")
            .unwrap_err();
        assert!(err.to_string().contains("failed to restore read-only mounts"), "{}", err);
    }

    #[test]
    fn primary_failure_wins_over_cleanup_failure() {
        let result: Result<(), _> = with_cleanup(
            Err(ShellfsError::execution("cp", "exit code 1")),
            Err(ShellfsError::execution("mount", "exit code 32")),
            "cp",
        );
        assert!(result.unwrap_err().to_string().contains("cp: exit code 1"));
    }
}
