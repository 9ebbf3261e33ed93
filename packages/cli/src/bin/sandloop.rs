// ABOUTME: Entry point for the sandloop binary
// ABOUTME: Loads .env, initializes tracing, resolves settings and runs until done or interrupted

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use sandloop_cli::app::{self, EXIT_CONFIG_ERROR};
use sandloop_cli::config::{Cli, Settings};
use sandloop_sandbox::{E2BGateway, TracingEventSink};
use std::process;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(app::parse_error_exit_code(&e));
        }
        Err(e) => e.exit(),
    };
    let (settings, gateway) = match prepare(cli) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let outcome = app::run(
        settings,
        Arc::new(gateway),
        Arc::new(TracingEventSink),
        shutdown_signal(),
    )
    .await;

    process::exit(outcome.exit_code());
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn prepare(cli: Cli) -> Result<(Settings, E2BGateway)> {
    let env = std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));
    let settings = Settings::resolve(cli, env).context("Invalid configuration")?;
    let gateway =
        E2BGateway::new(settings.gateway.clone()).context("Failed to set up the E2B client")?;
    Ok((settings, gateway))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
