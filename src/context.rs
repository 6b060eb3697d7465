//! Process-wide state passed explicitly.
//!
//! [`Context`] owns the configuration, the command catalog (immutable after
//! load), the mount-table cache (time-based invalidation) and the active
//! shell. Switching to an elevated shell replaces the active shell for every
//! later operation.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::catalog::CommandCatalog;
use crate::config::Config;
use crate::error::ShellfsError;
use crate::executable::Executable;
use crate::mount::MountTable;
use crate::privilege::{PrivilegeMethod, running_as_root};
use crate::program::AsyncOptions;
use crate::shell::{ProcessShell, Shell, ShellExecutor};

/// Creates shell executors, plain or elevated.
pub trait ShellLauncher: Send + Sync {
    fn launch(&self, privilege: Option<PrivilegeMethod>) -> Result<Arc<dyn ShellExecutor>, ShellfsError>;
}

/// Launches [`ProcessShell`]s from the configuration.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: Config,
}

impl ProcessLauncher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ShellLauncher for ProcessLauncher {
    fn launch(&self, privilege: Option<PrivilegeMethod>) -> Result<Arc<dyn ShellExecutor>, ShellfsError> {
        let shell = match privilege {
            Some(method) => ProcessShell::elevated(&self.config.shell, method, self.config.timeout()),
            None => ProcessShell::new(&self.config.shell, self.config.timeout()),
        };
        Ok(Arc::new(shell.with_dry_run(self.config.dry_run)))
    }
}

pub struct Context {
    config: Config,
    catalog: CommandCatalog,
    mounts: Arc<MountTable>,
    launcher: Box<dyn ShellLauncher>,
    shell: RwLock<Shell>,
}

impl Context {
    /// Builds a context running commands in live `sh` processes.
    ///
    /// With `elevated`, the first shell is already the privileged one. Root
    /// always starts elevated.
    pub fn new(config: Config, elevated: bool) -> Result<Self, ShellfsError> {
        config.validate()?;
        let catalog = CommandCatalog::load(config.catalog.as_deref())?;
        let mounts = Arc::new(MountTable::new(
            config.mounts_file.clone(),
            config.mount_cache_ttl(),
            config.restricted_fs_types.clone(),
        ));
        let launcher = Box::new(ProcessLauncher::new(config.clone()));
        Self::with_launcher(config, catalog, mounts, launcher, elevated || running_as_root())
    }

    /// Builds a context around a custom launcher.
    pub fn with_launcher(
        config: Config,
        catalog: CommandCatalog,
        mounts: Arc<MountTable>,
        launcher: Box<dyn ShellLauncher>,
        elevated: bool,
    ) -> Result<Self, ShellfsError> {
        let privilege = elevated.then_some(config.privilege);
        let shell = Shell::new(launcher.launch(privilege)?, Arc::clone(&mounts));
        Ok(Self {
            config,
            catalog,
            mounts,
            launcher,
            shell: RwLock::new(shell),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    /// Returns the active shell.
    pub fn shell(&self) -> Shell {
        self.shell
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_privileged(&self) -> bool {
        self.shell().is_privileged()
    }

    /// Makes the elevated shell the active one and returns it.
    ///
    /// A no-op if the active shell is already privileged.
    pub fn elevate(&self) -> Result<Shell, ShellfsError> {
        let mut active = self.shell.write().unwrap_or_else(PoisonError::into_inner);
        if active.is_privileged() {
            return Ok(active.clone());
        }
        let method = self.config.privilege;
        let executor = self.launcher.launch(Some(method))?;
        *active = Shell::new(executor, Arc::clone(&self.mounts));
        info!(privilege = %method, "switched to elevated shell");
        Ok(active.clone())
    }

    /// Builds the executable for a catalog command.
    pub fn build<S: AsRef<str>>(&self, id: &str, args: &[S]) -> Result<Executable, ShellfsError> {
        self.catalog.build(id, args)
    }

    /// Returns the streaming options configured for this context.
    pub fn async_options(&self) -> AsyncOptions {
        AsyncOptions {
            queue_capacity: self.config.queue_capacity,
            teardown_timeout: self.config.teardown_timeout(),
            ..AsyncOptions::default()
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("shell", &self.shell())
            .finish()
    }
}
