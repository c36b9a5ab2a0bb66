use std::process;

use marketsync::{
    config::{self, Command, SimulateArgs},
    infra::{error::InfraError, telemetry},
    simulate,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Simulate(SimulateArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Simulate(args) => run_simulate(settings, args).await,
    }
}

async fn run_simulate(settings: config::Settings, args: SimulateArgs) -> Result<(), InfraError> {
    let report = simulate::run(&settings, &args).await?;
    info!(
        upcoming_event_fetches = report.upcoming_event_fetches,
        listings_loaded = report.listings_loaded,
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
