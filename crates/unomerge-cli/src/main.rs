mod commands;
mod logging;
mod progress;

use std::process;

use clap::Parser;
use colored::*;
use commands::Cli;
use dotenv::dotenv;
use progress::CliReporter;
use tracing::{error, info};
use unomerge_core::{Phase, Pipeline, RunContext};

fn main() {
    dotenv().ok();

    let args = Cli::parse();

    if args.self_test {
        logging::init_console_logger();
        match unomerge_core::selftest::run_self_test() {
            Ok(()) => {
                println!("{}", "self-test passed".green());
                return;
            }
            Err(err) => {
                error!("{}", err);
                process::exit(1);
            }
        }
    }

    // Logging lands under the run-log root, so the configuration has to be
    // read before the subscriber goes up.
    let config = match unomerge_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };
    let log_root = args
        .log_dir
        .clone()
        .unwrap_or_else(|| config.log_root());
    let _guard = logging::init_logger(&log_root);

    let ctx = RunContext::new(config, args.run_id.clone(), args.log_dir.clone(), args.dry_run);
    info!(
        "Run {} -> {} {}",
        ctx.run_id.cyan(),
        ctx.run_dir.display(),
        if ctx.dry_run { "(dry run)".yellow() } else { "".normal() }
    );

    let pipeline = Pipeline::new(&ctx);
    let reporter = CliReporter::new();

    let result = if args.phase == "all" {
        pipeline.run_all(&reporter)
    } else {
        match Phase::parse(&args.phase) {
            Some(phase) => pipeline.run_phase(phase, &reporter),
            None => {
                error!("Unknown phase '{}'", args.phase);
                process::exit(1);
            }
        }
    };

    match result {
        Ok(()) => {
            println!(
                "{} run {} (artifacts in {})",
                "Done:".green(),
                ctx.run_id,
                ctx.run_dir.display()
            );
        }
        Err(err) => {
            error!("{}", err);
            eprintln!(
                "{} {} (run directory: {})",
                "Failed:".red(),
                err,
                ctx.run_dir.display()
            );
            process::exit(1);
        }
    }
}
