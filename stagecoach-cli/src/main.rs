use anyhow::Error;
use clap::Parser;
use cmd::{Cli, handle_args};

mod cmd;

fn main() -> Result<(), Error> {
    let args = Cli::parse();
    env_logger::Builder::new()
        .filter_level(args.log_level())
        .parse_default_env()
        .init();
    handle_args(&args)?;
    Ok(())
}
