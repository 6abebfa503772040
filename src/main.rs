use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use hermes::error::exit_code;
use hermes::{HermesConfig, Host};

/// Entry point of the per-host process. Flag parsing proper lives in
/// the CLI collaborator; the core takes the path of the resolved
/// configuration object.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(config_path) = std::env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: hermes <config.json>");
        return ExitCode::from(exit_code::CONFIG as u8);
    };

    let config = match HermesConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let host = match Host::new(config) {
        Ok(host) => host,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let outcome = host.run(true).await;
    match outcome.error {
        None => ExitCode::SUCCESS,
        Some(err) => ExitCode::from(err.exit_code() as u8),
    }
}
