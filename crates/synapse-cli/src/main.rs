use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use synapse::{
    CallRequest, FanoutSink, JsonlSink, Mode, Orchestrator, SharedSink, SynapseConfig, TracingSink,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resilient call orchestrator for generative-AI engines
#[derive(Parser, Debug)]
#[command(name = "synapse", author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (SYNAPSE_* environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append telemetry events to this JSON-lines file
    #[arg(long, global = true)]
    telemetry_log: Option<PathBuf>,

    /// Emit logs as JSON instead of human-readable text
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Route one prompt and print the result as JSON
    Route {
        /// auto, fast, deep, or local (aliases: elite, nano)
        #[arg(long, default_value = "auto")]
        mode: Mode,

        /// Prompt text; multiple words are joined with spaces
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    /// Check availability of every configured engine
    Probe,
    /// Print the effective configuration as TOML (API keys masked)
    Config,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_telemetry(telemetry_log: Option<PathBuf>) -> SharedSink {
    let mut fanout = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(path) = telemetry_log {
        info!(path = %path.display(), "Appending telemetry to JSON-lines log");
        fanout = fanout.with(Arc::new(JsonlSink::new(path)));
    }
    Arc::new(fanout)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = SynapseConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            print!("{}", config.redacted().to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Probe => {
            let telemetry = build_telemetry(cli.telemetry_log);
            let orchestrator = Orchestrator::from_config(&config, telemetry)?;
            probe(&orchestrator, &config).await
        }
        Command::Route { mode, prompt } => {
            let telemetry = build_telemetry(cli.telemetry_log);
            let orchestrator = Orchestrator::from_config(&config, telemetry)?;
            route(&orchestrator, mode, prompt.join(" ")).await
        }
    }
}

async fn route(orchestrator: &Orchestrator, mode: Mode, prompt: String) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling in-flight call");
            interrupt.cancel();
        }
    });

    let result = orchestrator
        .route_until(CallRequest::new(prompt, mode), &cancel)
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.is_error_recovery() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn probe(orchestrator: &Orchestrator, config: &SynapseConfig) -> Result<ExitCode> {
    let providers = orchestrator.providers();
    let engines = providers.engines();
    let checks = engines.iter().map(|engine| async move {
        let available = match providers.get(*engine) {
            Some(provider) => provider.is_available().await,
            None => false,
        };
        (*engine, available)
    });
    let results = join_all(checks).await;

    println!(
        "{:<8} {:<10} {:<24} {:<40} AVAILABLE",
        "ENGINE", "PROVIDER", "MODEL", "ENDPOINT"
    );
    for (engine, available) in &results {
        let profile = config.router.profile(*engine);
        println!(
            "{:<8} {:<10} {:<24} {:<40} {}",
            engine.to_string(),
            profile.provider.to_string(),
            profile.model,
            config.endpoints.for_kind(profile.provider).base_url,
            if *available { "yes" } else { "no" }
        );
    }

    let snapshot = orchestrator.executor().breaker().snapshot();
    println!(
        "\nbreaker: {} (threshold {}, reset {} ms)",
        snapshot.state, snapshot.failure_threshold, snapshot.reset_timeout_ms
    );

    let all_up = results.iter().all(|(_, available)| *available);
    Ok(if all_up {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_route_parses_mode_alias_and_joins_prompt() {
        let cli = Cli::try_parse_from([
            "synapse", "route", "--mode", "elite", "design", "a", "cache",
        ])
        .unwrap();
        match cli.command {
            Command::Route { mode, prompt } => {
                assert_eq!(mode, Mode::Deep);
                assert_eq!(prompt.join(" "), "design a cache");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_accepted_after_subcommand() {
        let cli = Cli::try_parse_from([
            "synapse",
            "probe",
            "--config",
            "synapse.toml",
            "--json-logs",
        ])
        .unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.config, Some(PathBuf::from("synapse.toml")));
        assert!(matches!(cli.command, Command::Probe));
    }

    #[test]
    fn test_route_requires_prompt() {
        assert!(Cli::try_parse_from(["synapse", "route"]).is_err());
        assert!(Cli::try_parse_from(["synapse", "route", "--mode", "turbo", "hi"]).is_err());
    }

    #[test]
    fn test_telemetry_fanout_includes_jsonl_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let sink = build_telemetry(Some(path.clone()));
        sink.record_event(synapse::TelemetryEvent::new("Cli.Test"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("Cli.Test"));
    }
}
