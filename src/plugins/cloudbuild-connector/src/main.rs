//! Cloud Build connector plugin for Pipewright.
//!
//! Served over stdio by the Pipewright host; all logging goes to stderr,
//! which the host forwards into its own trace stream.

mod connector;

use connector::CloudBuildConnector;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    match pipewright_plugin::serve_connector(CloudBuildConnector::new()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
