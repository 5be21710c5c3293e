use std::process::ExitCode;

use clap::Parser;

use datamon::cmd::{run_monitor, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    datamon::log::init_tracing_with(cli.log_level.as_deref(), cli.log_json);

    match run_monitor(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
