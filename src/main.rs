use std::process;

use anyhow::Result;
use shellfs::cli;
use tracing::error;

fn main() -> Result<()> {
    let args = cli::parse_args()?;
    shellfs::init_logging(args.common.log_level)?;

    if let Err(e) = shellfs::run(&args) {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}
