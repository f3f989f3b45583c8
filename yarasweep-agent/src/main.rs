use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use yarasweep_agent::AgentError;
use yarasweep_agent::cli::AgentCli;
use yarasweep_agent::logging::init_tracing;
use yarasweep_agent::orchestrator;
use yarasweep_core::config::{RunnerConfig, YarasweepConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = AgentCli::parse();

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("yarasweep: {e}");
            return exit_code(e.exit_code());
        }
    };

    if let Err(e) = init_tracing(&config.general) {
        eprintln!("yarasweep: {e:#}");
        return exit_code(2);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "yarasweep agent starting"
    );

    let runner = RunnerConfig::resolve(&config, cli.selector());
    match orchestrator::run(&runner, &config.metrics, CancellationToken::new()).await {
        Ok(outcome) => exit_code(outcome.exit_code()),
        Err(e) => {
            tracing::error!(error = %e, exit_code = e.exit_code(), "yarasweep agent failed");
            exit_code(e.exit_code())
        }
    }
}

/// File, then environment, then command-line flags.
async fn load_config(cli: &AgentCli) -> Result<YarasweepConfig, AgentError> {
    let mut config = YarasweepConfig::load_or_default(&cli.config).await?;
    cli.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
