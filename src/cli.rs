use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::commands::ChecksumAlgorithm;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Set the log level
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Start with the elevated shell
    #[arg(long, global = true)]
    pub root: bool,

    /// Switch to the elevated shell and retry when permission is denied
    #[arg(long, global = true)]
    pub escalate: bool,

    /// Do not run, just show what would be done
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a catalog command by id
    Run(RunArgs),

    /// List a directory
    Ls(PathArgs),

    /// Copy a file or directory
    Cp(TransferArgs),

    /// Move a file or directory
    Mv(TransferArgs),

    /// Remove files or directories recursively
    Rm(RemoveArgs),

    /// Create a directory and its parents
    Mkdir(PathArgs),

    /// Change the mode of a file
    Chmod(ChmodArgs),

    /// Write stdin (or --data) to a file
    Write(WriteArgs),

    /// Print the checksum of a file
    Checksum(ChecksumArgs),

    /// Find files by name, printing matches as they are found
    Find(FindArgs),

    /// Create a gzip tarball
    Compress(CompressArgs),

    /// Extract a gzip tarball
    Uncompress(UncompressArgs),

    /// Show the mount table
    Mounts,

    /// Validate the configuration and the command catalog
    Validate,

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Catalog command id
    pub id: String,

    /// Arguments substituted into the command template
    pub args: Vec<String>,

    /// Print output lines as they arrive
    #[arg(long)]
    pub stream: bool,
}

#[derive(Args, Debug)]
pub struct PathArgs {
    pub path: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[arg(required = true)]
    pub paths: Vec<Utf8PathBuf>,
}

#[derive(Args, Debug)]
pub struct ChmodArgs {
    /// Mode in any form chmod accepts (e.g. 644, u+x)
    pub mode: String,
    pub path: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    pub path: Utf8PathBuf,

    /// Data to write instead of stdin
    #[arg(long)]
    pub data: Option<String>,
}

#[derive(Args, Debug)]
pub struct ChecksumArgs {
    pub path: Utf8PathBuf,

    /// Digest algorithm (md5 or sha1)
    #[arg(short, long, default_value = "md5")]
    pub algorithm: ChecksumAlgorithm,
}

#[derive(Args, Debug)]
pub struct FindArgs {
    pub directory: Utf8PathBuf,

    /// Name pattern passed to `find -name`
    pub pattern: String,
}

#[derive(Args, Debug)]
pub struct CompressArgs {
    /// Archive to create
    pub archive: Utf8PathBuf,

    /// Directory the entries are relative to
    #[arg(short = 'C', long, default_value = ".")]
    pub base: Utf8PathBuf,

    #[arg(required = true)]
    pub entries: Vec<String>,
}

#[derive(Args, Debug)]
pub struct UncompressArgs {
    pub archive: Utf8PathBuf,
    pub destination: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// This enum maps directly to the log levels used by the `tracing` crate.
/// For example, specifying `--log-level debug` also shows every command line
/// written to the shell, and `trace` shows the raw output chunks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
