use std::process::ExitCode;

use clap::Parser;

use retouchfe::cli::{self, CliArgs};
use retouchfe::logger;

fn main() -> ExitCode {
    // Session log captures everything, including panics via the hook.
    logger::init();

    let args = CliArgs::parse();
    cli::run(args)
}
