//! TabBridge CLI: run a broker, or drive a browser agent through one.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::Cli;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { cmd::EXIT_USAGE } else { 0 });
        }
    };

    init_tracing(cli.command.default_log_level(), cli.log_json);
    let config = config::load_config(cli.config.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            ui::error(&format!("failed to start async runtime: {e}"));
            std::process::exit(cmd::EXIT_CONNECTION);
        }
    };
    if let Err(e) = runtime.block_on(cmd::run(cli, config)) {
        ui::error(&e.to_string());
        std::process::exit(e.exit_code());
    }
}
