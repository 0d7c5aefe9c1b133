use crate::config::cli::CliOpt;
use crate::simulation::Simulation;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod simulation;
mod traffic;
mod util;

fn main() -> anyhow::Result<()> {
    // Stdout carries the run summary and, by default, the telemetry records
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = CliOpt::parse();
    let config = config::load(&options.config)?;
    Simulation::new(options, config).run()
}
