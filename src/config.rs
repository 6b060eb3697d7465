//! shellfs configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Unknown keys are rejected.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ShellfsError;
use crate::mount::DEFAULT_RESTRICTED_FS_TYPES;
use crate::privilege::PrivilegeMethod;

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_teardown_timeout_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_mounts_file() -> Utf8PathBuf {
    Utf8PathBuf::from("/proc/mounts")
}

fn default_mount_cache_ttl_secs() -> u64 {
    300
}

fn default_restricted_fs_types() -> Vec<String> {
    DEFAULT_RESTRICTED_FS_TYPES
        .iter()
        .map(|t| t.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shell binary run by every session.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Escalation method of the elevated shell.
    #[serde(default)]
    pub privilege: PrivilegeMethod,
    /// Bounded wait for commands that do not wait indefinitely.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bound on the consumer rendezvous after a stream was stopped.
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    /// Bound of the partial-result queue of streaming commands.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_mounts_file")]
    pub mounts_file: Utf8PathBuf,
    #[serde(default = "default_mount_cache_ttl_secs")]
    pub mount_cache_ttl_secs: u64,
    /// Filesystem types that are never remounted read-write.
    #[serde(default = "default_restricted_fs_types")]
    pub restricted_fs_types: Vec<String>,
    /// Catalog file merged over the built-in command table.
    #[serde(default)]
    pub catalog: Option<Utf8PathBuf>,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            privilege: PrivilegeMethod::default(),
            timeout_ms: default_timeout_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            mounts_file: default_mounts_file(),
            mount_cache_ttl_secs: default_mount_cache_ttl_secs(),
            restricted_fs_types: default_restricted_fs_types(),
            catalog: None,
            dry_run: false,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn mount_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.mount_cache_ttl_secs)
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<(), ShellfsError> {
        if self.shell.trim().is_empty() {
            return Err(ShellfsError::Validation("shell must not be empty".to_string()));
        }
        if !Utf8Path::new(&self.shell).is_absolute() {
            return Err(ShellfsError::Validation(format!(
                "shell must be an absolute path: {}",
                self.shell
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ShellfsError::Validation("timeout_ms must be greater than 0".to_string()));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(ShellfsError::Validation(
                "teardown_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ShellfsError::Validation(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Utf8Path) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to load file: {}", path))?;
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml: {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.privilege, PrivilegeMethod::Sudo);
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert_eq!(config.mount_cache_ttl(), Duration::from_secs(300));
        assert!(config.restricted_fs_types.iter().any(|t| t == "proc"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("privilege: doas\ntimeout_ms: 100\n").unwrap();
        assert_eq!(config.privilege, PrivilegeMethod::Doas);
        assert_eq!(config.timeout_ms, 100);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.mounts_file.as_str(), "/proc/mounts");
    }

    #[test]
    fn load_config_accepts_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("shellfs.yml")).unwrap();
        fs::write(&path, "\n").unwrap();
        assert_eq!(load_config(&path).unwrap(), Config::default());
    }

    #[test]
    fn load_config_reports_path_on_error() {
        let err = load_config(Utf8Path::new("/nonexistent/shellfs.yml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/shellfs.yml"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("shel: /bin/sh\n");
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_relative_shell() {
        let config = Config {
            shell: "sh".to_string(),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"), "{}", err);
    }

    #[test]
    fn validate_rejects_zero_values() {
        for config in [
            Config {
                timeout_ms: 0,
                ..Config::default()
            },
            Config {
                teardown_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                queue_capacity: 0,
                ..Config::default()
            },
        ] {
            assert!(matches!(config.validate(), Err(ShellfsError::Validation(_))));
        }
    }
}
