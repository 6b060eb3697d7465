//! Mount-point model and cache.
//!
//! This module provides [`MountTable`], a time-bounded cache over a
//! `/proc/mounts`-format source used by writable operations to decide
//! whether a read-write remount is required. The table is only ever read
//! here; remounts go through the `mount` command.
//!
//! Remount decisions of concurrent operations are serialized through
//! writable leases: the first operation that needs a mount read-write
//! performs the remount, later ones share it, and the last one to release
//! restores the read-only state.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::error::ShellfsError;

/// Filesystem types that are never remounted.
pub const DEFAULT_RESTRICTED_FS_TYPES: &[&str] = &[
    "rootfs",
    "proc",
    "sysfs",
    "devpts",
    "debugfs",
    "cgroup",
    "cgroup2",
    "securityfs",
    "pstore",
    "tracefs",
    "configfs",
    "selinuxfs",
    "bpf",
    "mqueue",
    "hugetlbfs",
    "fusectl",
    "binfmt_misc",
];

/// Decodes the three-digit octal escape starting at `bytes[0]`, if any.
///
/// Escapes above `\377` do not name a byte and are left undecoded.
fn octal_escape(bytes: &[u8]) -> Option<u8> {
    let digits = bytes.get(1..4)?;
    if bytes[0] != b'\\' || !digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
        return None;
    }
    let value = digits
        .iter()
        .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
    u8::try_from(value).ok()
}

/// Decodes the octal escapes (`\040` for space, etc.) used in `/proc/mounts`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if let Some(byte) = octal_escape(&bytes[i..]) {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A snapshot of one mount-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    path: Utf8PathBuf,
    device: String,
    fs_type: String,
    options: Vec<String>,
    dump: u32,
    pass: u32,
    writable_allowed: bool,
}

impl MountPoint {
    /// Parses one `/proc/mounts` line.
    ///
    /// Returns `None` for blank or malformed lines. `restricted` lists the
    /// filesystem types that may not be remounted.
    pub fn parse_line<S: AsRef<str>>(line: &str, restricted: &[S]) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let device = unescape_octal(fields.next()?);
        let path = Utf8PathBuf::from(unescape_octal(fields.next()?));
        let fs_type = fields.next()?.to_string();
        let options = fields
            .next()?
            .split(',')
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        let dump = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let pass = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let writable_allowed = !restricted.iter().any(|t| t.as_ref() == fs_type);
        Some(Self {
            path,
            device,
            fs_type,
            options,
            dump,
            pass,
            writable_allowed,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn dump(&self) -> u32 {
        self.dump
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    /// Returns true if the filesystem type may be remounted.
    pub fn is_writable_allowed(&self) -> bool {
        self.writable_allowed
    }

    /// Returns true if the mount is currently read-write.
    pub fn is_read_write(&self) -> bool {
        self.options.iter().any(|o| o == "rw")
    }

    /// Returns true if writing here requires a remount first.
    pub fn needs_remount(&self) -> bool {
        self.writable_allowed && !self.is_read_write()
    }

    /// Returns true if `path` lies on or below this mount point.
    pub fn contains(&self, path: &Utf8Path) -> bool {
        path.starts_with(&self.path)
    }

    fn set_mode(&mut self, read_write: bool) {
        let (from, to) = if read_write { ("ro", "rw") } else { ("rw", "ro") };
        let mut replaced = false;
        for option in &mut self.options {
            if option == from || option == to {
                *option = to.to_string();
                replaced = true;
            }
        }
        if !replaced {
            self.options.insert(0, to.to_string());
        }
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Parses a whole mount table, skipping lines that do not parse.
pub fn parse_mounts<S: AsRef<str>>(content: &str, restricted: &[S]) -> Vec<MountPoint> {
    content
        .lines()
        .filter_map(|line| MountPoint::parse_line(line, restricted))
        .collect()
}

/// Returns the entry that `path` lives on: the longest matching prefix,
/// with later entries shadowing earlier ones on the same mount point.
fn lookup<'a>(entries: &'a [MountPoint], path: &Utf8Path) -> Option<&'a MountPoint> {
    entries
        .iter()
        .filter(|m| m.contains(path))
        .max_by_key(|m| m.path.components().count())
}

#[derive(Debug, Default)]
struct Cache {
    entries: Vec<MountPoint>,
    loaded_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    holders: usize,
}

/// Cached view of the system mount table.
///
/// The cache is refreshed when older than the configured TTL, or on every
/// lookup when the caller runs privileged (rooted contexts always see the
/// current table).
#[derive(Debug)]
pub struct MountTable {
    source: Utf8PathBuf,
    ttl: Duration,
    restricted: Vec<String>,
    cache: Mutex<Cache>,
    leases: Mutex<HashMap<Utf8PathBuf, Lease>>,
}

impl MountTable {
    /// Creates a table reading `source` lazily on first use.
    pub fn new(source: impl Into<Utf8PathBuf>, ttl: Duration, restricted: Vec<String>) -> Self {
        Self {
            source: source.into(),
            ttl,
            restricted,
            cache: Mutex::new(Cache::default()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the path of the mount-table source.
    pub fn source(&self) -> &Utf8Path {
        &self.source
    }

    fn lock_cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_leases(&self) -> MutexGuard<'_, HashMap<Utf8PathBuf, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, cache: &mut Cache) -> Result<(), ShellfsError> {
        let content = fs::read_to_string(&self.source)
            .map_err(|e| ShellfsError::io(format!("failed to read {}", self.source), e))?;
        cache.entries = parse_mounts(&content, &self.restricted);
        cache.loaded_at = Some(Instant::now());
        debug!(source = %self.source, entries = cache.entries.len(), "mount table loaded");
        Ok(())
    }

    fn fresh_cache(&self, force_refresh: bool) -> Result<MutexGuard<'_, Cache>, ShellfsError> {
        let mut cache = self.lock_cache();
        let stale = match cache.loaded_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if force_refresh || stale {
            self.load(&mut cache)?;
        }
        Ok(cache)
    }

    /// Drops the cached snapshot; the next lookup reloads the source.
    pub fn invalidate(&self) {
        self.lock_cache().loaded_at = None;
    }

    /// Returns every mount point.
    pub fn mount_points(&self, force_refresh: bool) -> Result<Vec<MountPoint>, ShellfsError> {
        Ok(self.fresh_cache(force_refresh)?.entries.clone())
    }

    /// Returns the mount point `path` lives on.
    ///
    /// Relative paths are resolved against the current directory. The path
    /// itself does not have to exist.
    pub fn find(&self, path: &Utf8Path, force_refresh: bool) -> Result<MountPoint, ShellfsError> {
        let absolute = if path.is_absolute() {
            path.to_owned()
        } else {
            let resolved = std::path::absolute(path)
                .map_err(|e| ShellfsError::io(format!("failed to resolve {}", path), e))?;
            Utf8PathBuf::from_path_buf(resolved).map_err(|p| {
                ShellfsError::Validation(format!("path is not valid UTF-8: {}", p.display()))
            })?
        };

        let cache = self.fresh_cache(force_refresh)?;
        lookup(&cache.entries, &absolute).cloned().ok_or_else(|| {
            ShellfsError::Validation(format!("no mount point found for {}", absolute))
        })
    }

    /// Returns the mount point `path` lives on if a write there needs a
    /// writable lease: the mount is read-only, or another operation holds
    /// it read-write through a lease that is still live.
    ///
    /// The decision is made under the lease lock, so it cannot interleave
    /// with a lease being taken or given back.
    pub fn plan_writable(&self, path: &Utf8Path, force_refresh: bool) -> Result<Option<MountPoint>, ShellfsError> {
        let leases = self.lock_leases();
        let mount_point = self.find(path, force_refresh)?;
        let shared = mount_point.is_writable_allowed() && leases.contains_key(mount_point.path());
        Ok((mount_point.needs_remount() || shared).then_some(mount_point))
    }

    /// Records that `mount_point` turned out to be read-only.
    pub fn mark_read_only(&self, mount_point: &Utf8Path) {
        self.set_mode(mount_point, false);
    }

    /// Records that `mount_point` was remounted read-write.
    pub fn mark_read_write(&self, mount_point: &Utf8Path) {
        self.set_mode(mount_point, true);
    }

    fn set_mode(&self, mount_point: &Utf8Path, read_write: bool) {
        let mut cache = self.lock_cache();
        if let Some(entry) = cache.entries.iter_mut().rev().find(|m| m.path == mount_point) {
            entry.set_mode(read_write);
        }
    }

    /// Takes a writable lease on `mount_point`.
    ///
    /// The first holder runs `remount`; later holders share the result.
    /// Returns true if this call performed the remount.
    pub fn acquire_writable<F>(&self, mount_point: &MountPoint, remount: F) -> Result<bool, ShellfsError>
    where
        F: FnOnce() -> Result<(), ShellfsError>,
    {
        let mut leases = self.lock_leases();
        if let Some(lease) = leases.get_mut(mount_point.path()) {
            lease.holders += 1;
            debug!(mount_point = %mount_point, holders = lease.holders, "sharing writable mount");
            return Ok(false);
        }
        remount()?;
        leases.insert(mount_point.path().to_owned(), Lease { holders: 1 });
        self.mark_read_write(mount_point.path());
        info!(mount_point = %mount_point, "remounted read-write");
        Ok(true)
    }

    /// Releases a writable lease; the last holder runs `restore`.
    ///
    /// Returns true if this call restored the read-only state.
    pub fn release_writable<F>(&self, mount_point: &MountPoint, restore: F) -> Result<bool, ShellfsError>
    where
        F: FnOnce() -> Result<(), ShellfsError>,
    {
        let mut leases = self.lock_leases();
        if !Self::drop_holder(&mut leases, mount_point) {
            return Ok(false);
        }
        restore()?;
        self.mark_read_only(mount_point.path());
        info!(mount_point = %mount_point, "restored read-only");
        Ok(true)
    }

    /// Releases a writable lease without restoring, leaving the mount read-write.
    pub fn abandon_writable(&self, mount_point: &MountPoint) {
        let mut leases = self.lock_leases();
        if Self::drop_holder(&mut leases, mount_point) {
            debug!(mount_point = %mount_point, "leaving mount read-write");
        }
    }

    /// Returns the number of holders of a writable lease.
    pub fn lease_holders(&self, mount_point: &Utf8Path) -> usize {
        self.lock_leases()
            .get(mount_point)
            .map_or(0, |lease| lease.holders)
    }

    /// Decrements the holders, returning true if the lease is now gone.
    fn drop_holder(leases: &mut HashMap<Utf8PathBuf, Lease>, mount_point: &MountPoint) -> bool {
        let Some(lease) = leases.get_mut(mount_point.path()) else {
            return false;
        };
        lease.holders = lease.holders.saturating_sub(1);
        if lease.holders > 0 {
            return false;
        }
        leases.remove(mount_point.path());
        true
    }
}
