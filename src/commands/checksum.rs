use std::sync::Arc;

use camino::Utf8Path;
use strum::{Display, EnumString};

use crate::context::Context;
use crate::error::ShellfsError;
use crate::executable::Executable;
use crate::program::{Program, SyncResultProgram, WaitMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
}

impl ChecksumAlgorithm {
    fn command_id(self) -> &'static str {
        match self {
            Self::Md5 => "checksum-md5",
            Self::Sha1 => "checksum-sha1",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
        }
    }
}

/// Computes the digest of one file.
#[derive(Debug, Clone)]
pub struct Checksum {
    executable: Executable,
    algorithm: ChecksumAlgorithm,
}

impl Checksum {
    pub fn new(ctx: &Context, algorithm: ChecksumAlgorithm, path: &Utf8Path) -> Result<Arc<Self>, ShellfsError> {
        let executable = ctx.build(algorithm.command_id(), &[path.as_str()])?;
        Ok(Arc::new(Self { executable, algorithm }))
    }
}

impl Program for Checksum {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn wait_mode(&self) -> WaitMode {
        WaitMode::Indefinite
    }
}

impl SyncResultProgram for Checksum {
    type Output = String;

    /// Extracts the digest from a `<hex>  <path>` line.
    fn parse(&self, stdout: &str, _stderr: &str) -> Result<String, ShellfsError> {
        let digest = stdout
            .split_whitespace()
            .next()
            .filter(|d| d.len() == self.algorithm.hex_len() && d.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| {
                ShellfsError::execution(
                    self.executable.command_line(),
                    format!("unexpected {} output: {}", self.algorithm, stdout.trim()),
                )
            })?;
        Ok(digest.to_ascii_lowercase())
    }
}
