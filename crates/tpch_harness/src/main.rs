//! tpch-harness binary

use clap::Parser;
use std::process::ExitCode;
use tpch_harness::cli::{self, Cli, HelpfulError};
use tpch_harness_logging::{init_logging, LogConfig};

fn main() -> ExitCode {
    // clap exits 0 for --help and 2 for argument errors
    let cli = Cli::parse();

    // Held until exit so the file writer flushes.
    let _log_guard = match init_logging(LogConfig {
        app_name: "tpch-harness",
        verbose: cli.verbose,
    }) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Warning: failed to initialize logging: {:#}", err);
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ERROR: failed to start async runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(cli::run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", HelpfulError::from_anyhow(&err));
            ExitCode::FAILURE
        }
    }
}
