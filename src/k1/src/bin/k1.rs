//! k1 binary: parse, set up logging and Ctrl-C, run one command, exit with
//! the code of its outcome.

use clap::Parser;
use k1::cli::Cli;
use k1::commands::{self, Context};
use provision::{exit_codes, EnvSource, ProcessEnv};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn main() {
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(commands::default_home);

    let log_file = match k1::logging::init(&home.join("logs")) {
        Ok(path) => Some(path),
        Err(e) => {
            eprintln!("  WARNING: logging disabled: {:#}", e);
            None
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Cannot start the async runtime: {}", e);
            std::process::exit(exit_codes::INTERNAL as i32);
        }
    };

    let cancel = CancellationToken::new();
    let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
    let config_path = cli.config.clone();
    let mut grace = Duration::from_secs(5);

    let code = rt.block_on(async {
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, stopping the current step...");
                tracing::warn!("[k1] Interrupted");
                interrupt.cancel();
            }
        });

        let result = match Context::load(home, config_path.as_deref(), env, cancel.clone()) {
            Ok(ctx) => {
                grace = ctx.config.cancel_grace();
                commands::dispatch(&ctx, cli).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => exit_codes::SUCCESS,
            Err(e) => {
                tracing::error!("[k1] {}", e);
                eprintln!();
                eprint!("{}", commands::failure_summary(&e, log_file.as_deref()));
                e.exit_code()
            }
        }
    });

    rt.shutdown_timeout(grace);
    std::process::exit(code as i32);
}
