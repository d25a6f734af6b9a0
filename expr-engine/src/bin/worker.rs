use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use expr_engine::{logging, rpc};

/// Serves one client the native operators of a library.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Native operator library to load
    library: PathBuf,

    /// Channel identifier chosen by the client
    channel: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(false);

    match rpc::worker::run(&args.library, &args.channel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(library = %args.library.display(), error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}
