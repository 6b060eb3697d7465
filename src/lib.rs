pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod executable;
pub mod mount;
pub mod orchestrator;
pub mod privilege;
pub mod program;
pub mod shell;

use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::CommandFactory;
use tracing::{debug, info, warn};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::cli::{Cli, Commands, CommonArgs};
use crate::context::Context;
use crate::error::ShellfsError;
use crate::orchestrator::Orchestrator;
use crate::program::{AsyncResultListener, Program, SyncResultProgram};
use crate::shell::RawOutcome;

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(filter)
            .with_writer(io::stderr)
            .finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Prints every partial result on its own line.
#[derive(Debug, Default)]
pub struct PrintListener;

impl AsyncResultListener for PrintListener {
    fn on_partial_result(&self, data: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", data);
    }

    fn on_async_exit_code(&self, code: i32) {
        debug!(exit_code = code, "stream finished");
    }

    fn on_async_end(&self, cancelled: bool) {
        if cancelled {
            info!("stream cancelled");
        }
    }
}

/// Loads the configuration named on the command line and builds the context.
pub fn load_context(common: &CommonArgs) -> Result<Arc<Context>> {
    let mut config = match &common.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => config::Config::default(),
    };
    if common.dry_run {
        config.dry_run = true;
    }
    let context = Context::new(config, common.root).context("failed to initialize context")?;
    Ok(Arc::new(context))
}

fn confirm_escalation(err: &ShellfsError) -> bool {
    warn!("{}; retrying with the elevated shell", err);
    true
}

/// Runs a program, escalating on refusal if the user asked for it.
fn run_sync<P>(orchestrator: &Orchestrator, program: &Arc<P>, escalate: bool) -> Result<P::Output>
where
    P: SyncResultProgram + 'static,
{
    let id = program.executable().id().to_string();
    let output = if escalate {
        orchestrator.execute_sync_escalating(program, confirm_escalation)
    } else {
        orchestrator.execute_sync(program)
    };
    output.with_context(|| format!("failed to run {}", id))
}

/// Runs a program for its raw outcome, escalating on refusal if asked to.
fn run_program(orchestrator: &Orchestrator, program: Arc<dyn Program>, escalate: bool) -> Result<RawOutcome> {
    let id = program.executable().id().to_string();
    let outcome = if escalate {
        orchestrator.run_with_escalation(program, confirm_escalation)
    } else {
        orchestrator.execute(program)
    };
    outcome.with_context(|| format!("failed to run {}", id))
}

pub fn run_validate(common: &CommonArgs) -> Result<()> {
    let context = load_context(common)?;
    context.catalog().validate().context("catalog validation failed")?;
    info!(
        commands = context.catalog().ids().count(),
        "validation successful:\n{:#?}",
        context.config()
    );
    Ok(())
}

pub fn run_mounts(common: &CommonArgs) -> Result<()> {
    let context = load_context(common)?;
    let mount_points = context
        .mounts()
        .mount_points(true)
        .context("failed to read mount table")?;
    let mut stdout = io::stdout().lock();
    for mp in mount_points {
        let mode = if mp.is_read_write() { "rw" } else { "ro" };
        let remount = if mp.is_writable_allowed() { "" } else { " (restricted)" };
        writeln!(stdout, "{} {} {} {}{}", mp.path(), mp.device(), mp.fs_type(), mode, remount)?;
    }
    Ok(())
}

pub fn run_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, env!("CARGO_PKG_NAME"), &mut io::stdout());
    Ok(())
}

/// Dispatches a parsed command line.
pub fn run(cli: &Cli) -> Result<()> {
    let common = &cli.common;
    match &cli.command {
        Commands::Validate => return run_validate(common),
        Commands::Mounts => return run_mounts(common),
        Commands::Completions(opts) => return run_completions(opts.shell),
        _ => {}
    }

    let context = load_context(common)?;
    let orchestrator = Orchestrator::new(Arc::clone(&context));
    let escalate = common.escalate;
    let mut stdout = io::stdout();

    match &cli.command {
        Commands::Run(opts) if opts.stream => {
            let program = commands::streaming_command(&context, &opts.id, &opts.args, Arc::new(PrintListener))?;
            run_program(&orchestrator, program, escalate)?;
        }
        Commands::Run(opts) => {
            let program = commands::catalog_command(&context, &opts.id, &opts.args)?;
            let outcome = run_program(&orchestrator, program, escalate)?;
            stdout.write_all(outcome.stdout.as_bytes())?;
        }
        Commands::Ls(opts) => {
            let program = commands::ListDirectory::new(&context, &opts.path)?;
            for entry in run_sync(&orchestrator, &program, escalate)? {
                let marker = if entry.is_dir { "/" } else { "" };
                writeln!(stdout, "{}{}", entry.name, marker)?;
            }
        }
        Commands::Cp(opts) => {
            let program = commands::copy(&context, &opts.source, &opts.destination)?;
            run_sync(&orchestrator, &program, escalate)?;
        }
        Commands::Mv(opts) => {
            let program = commands::move_path(&context, &opts.source, &opts.destination)?;
            run_sync(&orchestrator, &program, escalate)?;
        }
        Commands::Rm(opts) => {
            let program = commands::delete(&context, &opts.paths)?;
            run_sync(&orchestrator, &program, escalate)?;
        }
        Commands::Mkdir(opts) => {
            let program = commands::make_directory(&context, &opts.path)?;
            run_sync(&orchestrator, &program, escalate)?;
        }
        Commands::Chmod(opts) => {
            let program = commands::change_mode(&context, &opts.mode, &opts.path)?;
            run_sync(&orchestrator, &program, escalate)?;
        }
        Commands::Write(opts) => {
            let data = match &opts.data {
                Some(data) => data.clone().into_bytes(),
                None => {
                    let mut buffer = Vec::new();
                    io::stdin()
                        .read_to_end(&mut buffer)
                        .context("failed to read stdin")?;
                    buffer
                }
            };
            let program = commands::WriteFile::new(&context, &opts.path, data)?;
            run_sync(&orchestrator, &program, escalate)?;
        }
        Commands::Checksum(opts) => {
            let program = commands::Checksum::new(&context, opts.algorithm, &opts.path)?;
            let digest = run_sync(&orchestrator, &program, escalate)?;
            writeln!(stdout, "{}  {}", digest, opts.path)?;
        }
        Commands::Find(opts) => {
            let program = commands::find(&context, &opts.directory, &opts.pattern, Arc::new(PrintListener))?;
            run_program(&orchestrator, program, escalate)?;
        }
        Commands::Compress(opts) => {
            let program = commands::compress(
                &context,
                &opts.archive,
                &opts.base,
                &opts.entries,
                Arc::new(PrintListener),
            )?;
            run_program(&orchestrator, program, escalate)?;
        }
        Commands::Uncompress(opts) => {
            let program = commands::uncompress(&context, &opts.archive, &opts.destination, Arc::new(PrintListener))?;
            run_program(&orchestrator, program, escalate)?;
        }
        Commands::Validate | Commands::Mounts | Commands::Completions(_) => {}
    }

    Ok(())
}
