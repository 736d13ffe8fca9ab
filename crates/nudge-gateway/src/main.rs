#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary — stdout/stderr is the UI

mod ack_link;
mod api;
mod cli;
mod config;
mod dispatch;
mod escalation;
mod ingest;
mod service;
#[cfg(test)]
mod testutil;
mod tracing_setup;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nudge_channels::DiscordTransport;
use nudge_core::{Clock, SystemClock, Transport};
use nudge_store::{ReminderRepo, SledKv};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ack_link::{AckLinkBuilder, AckTokenSigner};
use crate::api::AppState;
use crate::cli::{Cli, Commands};
use crate::config::{Config, shared_config};
use crate::dispatch::{Dispatcher, run_dispatch_loop};
use crate::escalation::{EscalationEngine, run_escalation_loop};
use crate::service::ReminderService;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("nudge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Check { format } => cmd_check(cli.config.as_deref(), &format),
        Commands::Start => cmd_start(cli.config.as_deref()).await,
    }
}

fn cmd_check(config_path: Option<&str>, format: &str) -> Result<()> {
    let path = Config::find_config_path(config_path);
    let config = Config::load(&path)?;

    let mut problems = config.problems();
    if let Err(e) = config.discord_token() {
        problems.push(e.to_string());
    }
    if let Err(e) = config.ack_secret() {
        problems.push(e.to_string());
    }

    match format {
        "json" => println!(
            "{}",
            serde_json::json!({ "ok": problems.is_empty(), "problems": problems })
        ),
        _ => {
            if problems.is_empty() {
                println!("✓ {} looks good", path.display());
            } else {
                println!("{} problem(s) in {}:", problems.len(), path.display());
                for problem in &problems {
                    println!("  ✗ {problem}");
                }
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        bail!("configuration check failed")
    }
}

async fn cmd_start(config_path: Option<&str>) -> Result<()> {
    let path = Config::find_config_path(config_path);
    let config = Config::load(&path)?;
    let _tracing_guard = tracing_setup::init(&config.gateway.log_level);

    let problems = config.problems();
    if !problems.is_empty() {
        for problem in &problems {
            warn!(problem = %problem, "configuration problem");
        }
        bail!("refusing to start with {} configuration problem(s)", problems.len());
    }

    let token = config.discord_token()?;
    let ack_secret = config.ack_secret()?;

    let data_dir = Path::new(&config.gateway.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
    let kv = SledKv::open(data_dir.join("reminders.db"))?;
    let repo = ReminderRepo::new(Arc::new(kv.clone()));

    let transport: Arc<dyn Transport> = Arc::new(DiscordTransport::new(token)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(EscalationEngine::new(
        repo.clone(),
        Arc::clone(&transport),
        Arc::clone(&clock),
    ));
    let service = Arc::new(ReminderService::new(
        repo.clone(),
        Arc::clone(&transport),
        Arc::clone(&clock),
        Arc::clone(&engine),
        config.discord.application_id.clone(),
    ));

    let shutdown = CancellationToken::new();

    let signer = Arc::new(AckTokenSigner::new(ack_secret));
    let ack_links = config
        .gateway
        .public_url
        .as_ref()
        .map(|url| AckLinkBuilder::new(Arc::clone(&signer), url.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&service),
        repo,
        Arc::clone(&transport),
        Arc::clone(&clock),
        ack_links,
    ));
    let dispatch_handle = tokio::spawn(run_dispatch_loop(
        dispatcher,
        Duration::from_secs(config.ticks.due_interval_secs),
        shutdown.clone(),
    ));
    let escalation_handle = tokio::spawn(run_escalation_loop(
        engine,
        Duration::from_secs(config.ticks.escalation_interval_secs),
        shutdown.clone(),
    ));

    let bind_addr = config.gateway.bind_addr.clone();
    let state = AppState {
        service,
        config: shared_config(config),
        signer,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "admin api listening");

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("http server failed")?;

    shutdown.cancel();
    let _ = dispatch_handle.await;
    let _ = escalation_handle.await;
    kv.flush()?;
    info!("gateway stopped");
    Ok(())
}
