//! portfwd - multi-mapping TCP port forwarder.

use clap::Parser;
use portfwd::{run_check, run_server, BuildInfo, Cli, Command};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => {
            tracing::debug!(?args, "Serve arguments");

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "failed to create tokio runtime");
                    std::process::exit(1);
                }
            };
            if let Err(e) = runtime.block_on(run_server(&args)) {
                tracing::error!(error = %e, "server error");
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Check(args) => {
            if let Err(e) = run_check(&args) {
                eprintln!("{}", e);
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Version => {
            let info = BuildInfo::get();
            println!("{}", info.format());
        }
    }
}
