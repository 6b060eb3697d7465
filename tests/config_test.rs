use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use shellfs::cli::Cli;
use shellfs::config::{Config, load_config};
use shellfs::privilege::PrivilegeMethod;
use tempfile::tempdir;

fn write_file(dir: &Utf8Path, name: &str, content: &str) -> Result<Utf8PathBuf> {
    let path = dir.join(name);
    fs::write(&path, content)?;
    Ok(path)
}

fn utf8_tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let dir = tempdir()?;
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .map_err(|p| anyhow::anyhow!("non-utf8 temp dir: {}", p.display()))?;
    Ok((dir, path))
}

#[test]
fn test_load_config_full() -> Result<()> {
    let (_dir, root) = utf8_tempdir()?;
    // editorconfig-checker-disable
    let path = write_file(
        &root,
        "shellfs.yml",
        r#"---
shell: /bin/bash
privilege: su
timeout_ms: 1500
teardown_timeout_ms: 2000
queue_capacity: 16
mounts_file: /tmp/mounts
mount_cache_ttl_secs: 10
restricted_fs_types: [proc, sysfs]
catalog: /etc/shellfs/commands.yml
dry_run: true
"#,
    )?;
    // editorconfig-checker-enable

    let config = load_config(&path)?;
    assert_eq!(config.shell, "/bin/bash");
    assert_eq!(config.privilege, PrivilegeMethod::Su);
    assert_eq!(config.timeout_ms, 1500);
    assert_eq!(config.teardown_timeout_ms, 2000);
    assert_eq!(config.queue_capacity, 16);
    assert_eq!(config.mounts_file, "/tmp/mounts");
    assert_eq!(config.mount_cache_ttl_secs, 10);
    assert_eq!(config.restricted_fs_types, vec!["proc".to_string(), "sysfs".to_string()]);
    assert_eq!(config.catalog.as_deref(), Some(Utf8Path::new("/etc/shellfs/commands.yml")));
    assert!(config.dry_run);
    config.validate()?;

    Ok(())
}

#[test]
fn test_load_config_rejects_unknown_keys() -> Result<()> {
    let (_dir, root) = utf8_tempdir()?;
    let path = write_file(&root, "shellfs.yml", "timeout: 10\n")?;

    let err = load_config(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("failed to parse yaml"), "{:#}", err);

    Ok(())
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config(Utf8Path::new("/nonexistent/shellfs.yml")).unwrap_err();
    assert!(format!("{:#}", err).contains("failed to load file"), "{:#}", err);
}

#[test]
fn test_validate_command_with_config_file() -> Result<()> {
    let (_dir, root) = utf8_tempdir()?;
    let catalog = write_file(&root, "commands.yml", "hello:\n  path: echo\n  args: '\"{0}\"'\n")?;
    let mounts = write_file(&root, "mounts", "/dev/root / ext4 rw 0 0\n")?;
    let path = write_file(
        &root,
        "shellfs.yml",
        &format!("mounts_file: {}\ncatalog: {}\n", mounts, catalog),
    )?;

    let cli = Cli::parse_from(["shellfs", "validate", "--config", path.as_str()]);
    shellfs::run_validate(&cli.common)?;

    let context = shellfs::load_context(&cli.common)?;
    assert!(context.catalog().ids().any(|id| id == "hello"));
    assert!(context.catalog().ids().any(|id| id == "copy"));

    Ok(())
}

#[test]
fn test_validate_command_rejects_bad_config() -> Result<()> {
    let (_dir, root) = utf8_tempdir()?;
    let path = write_file(&root, "shellfs.yml", "queue_capacity: 0\n")?;

    let cli = Cli::parse_from(["shellfs", "validate", "--config", path.as_str()]);
    let err = shellfs::run_validate(&cli.common).unwrap_err();
    assert!(format!("{:#}", err).contains("queue_capacity"), "{:#}", err);

    Ok(())
}

#[test]
fn test_dry_run_flag_overrides_config() -> Result<()> {
    let (_dir, root) = utf8_tempdir()?;
    let mounts = write_file(&root, "mounts", "/dev/root / ext4 rw 0 0\n")?;
    let path = write_file(&root, "shellfs.yml", &format!("mounts_file: {}\n", mounts))?;

    let cli = Cli::parse_from(["shellfs", "validate", "--dry-run", "--config", path.as_str()]);
    let context = shellfs::load_context(&cli.common)?;
    assert!(context.config().dry_run);
    assert!(!Config::default().dry_run);

    Ok(())
}
