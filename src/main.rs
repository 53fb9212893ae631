// suzu - realtime conversation orchestrator for an AI VTuber pipeline.
//
// The orchestrator consumes streaming speech-recognition events, drives a
// token-streaming policy (LLM) worker, slices the emerging reply into
// sentence-sized chunks for pipelined TTS, broadcasts every lifecycle event
// to WebSocket subscribers, and keeps a rolling conversational memory. A
// second subcommand supervises the sibling worker processes.
//
// Architecture:
// - Broker: in-process pub/sub fanning events out to WS + telemetry
// - Decision engine: ASR dedup -> policy stream -> chunked TTS
// - State facade: persona/module/memory state behind one short-held lock
// - Surface (axum): thin HTTP/WS layer over the facade
// - Supervisor: predicate-gated worker spawning with health probes

mod broker;
mod cli;
mod clients;
mod config;
mod events;
mod memory;
mod metrics;
mod persona;
mod pipeline;
mod registry;
mod server;
mod state;
mod supervisor;
mod telemetry;
mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use broker::{EventBroker, EventDispatcher};
use cli::{Cli, Commands};
use clients::{PolicyClient, TtsClient};
use config::Config;
use memory::{MemoryController, MemoryStore};
use metrics::PipelineMetrics;
use persona::PresetCatalog;
use state::Orchestrator;
use supervisor::ServiceSpec;
use telemetry::TelemetryClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load();

    // Config inspection runs before logging is wired up, so the output
    // stays clean for piping.
    if let Some(Commands::Config { show, path }) = &cli.command {
        cli::handle_config(&config, *show, *path);
        return Ok(());
    }

    // Precedence: RUST_LOG env var > config file level > "info".
    let default_filter = format!("suzu={},tower_http=debug,axum=debug", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Some(Commands::Pipeline) => run_pipeline(config).await,
        _ => run_serve(config).await,
    }
}

/// Run the orchestrator: broker, memory, clients, facade, HTTP/WS surface.
async fn run_serve(config: Config) -> Result<()> {
    let telemetry = match &config.telemetry_url {
        Some(url) => {
            tracing::info!("Telemetry forwarding enabled to {url}");
            Some(TelemetryClient::new(
                url,
                config.telemetry_api_key.clone(),
                "orchestrator",
            )?)
        }
        None => None,
    };
    let broker = Arc::new(EventBroker::new(telemetry));
    let dispatcher = EventDispatcher::new(broker.clone());

    let store = MemoryStore::open(&config.memory.db_path)
        .context("failed to open the memory store")?;
    let memory = MemoryController::new(
        store,
        config.memory.buffer_size,
        config.memory.summary_interval,
    );
    let presets = PresetCatalog::new(
        config.persona.presets.clone(),
        &config.persona.default_preset,
    );

    let policy = Arc::new(PolicyClient::new(
        &config.policy_url,
        Duration::from_secs_f64(config.policy_timeout_seconds),
        dispatcher.clone(),
    )?);
    let tts = Arc::new(TtsClient::new(
        &config.tts_url,
        Duration::from_secs_f64(config.tts_timeout_seconds),
    )?);

    let orchestrator = Orchestrator::new(
        broker,
        memory,
        presets,
        &config.modules,
        policy,
        tts,
        Arc::new(PipelineMetrics::new()),
    );

    orchestrator
        .startup(
            config.memory.restore_context,
            config.memory.restore_window_seconds,
        )
        .await?;
    orchestrator.start_background_tasks();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = stop_tx.send(true);
    });

    server::serve(orchestrator.clone(), &config, stop_rx).await?;

    orchestrator.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run the process supervisor over the configured worker cohort.
async fn run_pipeline(config: Config) -> Result<()> {
    let specs: Vec<ServiceSpec> = config
        .supervisor
        .services
        .iter()
        .map(ServiceSpec::from_config)
        .collect();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = stop_tx.send(true);
    });

    supervisor::run(specs, stop_rx).await;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM (POSIX) / Ctrl-C elsewhere.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(error) => {
                tracing::error!("Failed to install SIGTERM handler: {error}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
