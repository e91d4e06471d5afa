//! CLI entry point (C11): loads a plan, validates and compiles it, runs it
//! to completion, and prints the final context as JSON.
//!
//! Mirrors the source project's `execute` subcommand — load, validate,
//! execute, report, exit-code-on-failure — adapted to this crate's
//! validate/compile/execute pipeline and YAML plans.

use std::path::PathBuf;

use clap::Parser;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{error, info, Level};

use api_crawler::plan::loader::PlanSource;
use api_crawler::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use api_crawler::ApiCrawler;

/// Declarative API crawler: runs a YAML plan of request/forEach/forValues
/// steps against real HTTP endpoints.
#[derive(Parser)]
#[command(name = "api-crawler")]
#[command(about = "Executes a declarative API crawl plan", long_about = None)]
struct Cli {
    /// Path to the plan's YAML file.
    #[arg(short, long)]
    file: PathBuf,

    /// Path to a JSON file of runtime variables made available to the plan.
    #[arg(long)]
    variables: Option<PathBuf>,

    /// Where to write the final context as JSON. Prints to stdout if omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Export traces to an OpenTelemetry collector.
    #[arg(long, default_value = "false")]
    otel: bool,

    /// OTLP collector endpoint. Defaults to `http://localhost:4317` when
    /// `--otel` is set and no endpoint is otherwise configured.
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Suppress informational logging; only errors are printed.
    #[arg(long, short = 's', default_value = "false")]
    silent: bool,

    /// Emit debug-level logging.
    #[arg(long, short = 'v', default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.silent {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if cli.otel {
        telemetry_config.otlp_endpoint = cli.otel_endpoint.clone().or(telemetry_config.otlp_endpoint).or_else(|| Some("http://localhost:4317".to_string()));
    }

    if let Err(e) = init_telemetry(telemetry_config) {
        if !cli.silent {
            eprintln!("Warning: failed to initialize telemetry: {e}");
        }
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    }

    let exit_code = run(&cli).await;

    shutdown_telemetry();
    std::process::exit(exit_code);
}

async fn run(cli: &Cli) -> i32 {
    if !cli.silent {
        info!(file = %cli.file.display(), "loading plan");
    }

    let (crawler, validation_errors, setup_error) = ApiCrawler::new(PlanSource::Path(&cli.file));

    if !validation_errors.is_empty() {
        error!("plan failed validation with {} error(s)", validation_errors.len());
        for e in &validation_errors {
            error!("  - {e}");
        }
        return 1;
    }

    let Some(mut crawler) = crawler else {
        if let Some(e) = setup_error {
            error!(error = %e, "failed to set up crawler");
        }
        return 1;
    };

    let variables = match &cli.variables {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "failed to read runtime variables file");
                    return 1;
                }
            };
            match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "failed to parse runtime variables file");
                    return 1;
                }
            }
        }
        None => Map::new(),
    };

    let (_cancel_tx, cancel_rx) = watch::channel(false);

    if !cli.silent {
        info!("starting execution");
    }
    match crawler.run(cancel_rx, variables).await {
        Ok(()) => {
            if !cli.silent {
                info!("execution finished");
            }
        }
        Err(e) => {
            error!(error = %e, "execution failed");
            return 1;
        }
    }

    let data = crawler.get_data();
    let json = serde_json::to_string_pretty(&data).expect("context is always serializable JSON");
    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, json) {
                error!(error = %e, "failed to write output");
                return 1;
            }
            if !cli.silent {
                info!(path = %path.display(), "output written");
            }
        }
        None => println!("{json}"),
    }

    0
}
