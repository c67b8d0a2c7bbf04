//! mymy-daemon entry point.
//!
//! Thin by design: parses `--config`, loads it, wires a rule registry and a
//! replication supervisor from it, runs the supervisor to completion, and
//! shuts it down cleanly on SIGINT/SIGTERM. Route handlers, metrics
//! exporters and health endpoints are not part of this crate.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use mymy_config::Config;
use mymy_executor::{ApplyExecutor, NullSink};
use mymy_handler::{ProjectionHandlerFactory, StaticHandlerRegistry};
use mymy_rules::{Rule, RuleRegistry};
use mymy_schema::{Column, ColumnType, SourceInfo};
use mymy_source::NullSource;
use mymy_state::FileStateSaver;
use mymy_supervisor::Supervisor;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mymy")]
#[command(about = "Replicates row-level mutations from a source database to a sink via handler plugins.")]
struct Cli {
    /// Path to the replication config file.
    #[arg(long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    let cfg = mymy_config::load_config_file(&cli.config).with_context(|| format!("loading config from {}", cli.config))?;

    init_tracing(&cfg.app.logging.level);

    let rules = Arc::new(build_rule_registry(&cfg)?);

    let state_saver = Arc::new(
        FileStateSaver::new(&cfg.app.data_file, cfg.replication.gtid_mode)
            .with_context(|| format!("opening checkpoint file {}", cfg.app.data_file))?,
    );

    // Production SQL client and wire-protocol source are out of scope here;
    // NullSink/NullSource let the supervisor's lifecycle run end to end
    // (dump -> running -> stopped, checkpoint flush on close) without one.
    let cancel = CancellationToken::new();

    let sink = Arc::new(NullSink);
    let (executor, exec_handle) = ApplyExecutor::spawn(sink, state_saver.clone(), cancel.clone());
    let source = Arc::new(NullSource::new());

    let supervisor = Arc::new(Supervisor::new(
        source,
        rules,
        executor,
        exec_handle,
        state_saver,
        cfg.replication.gtid_mode,
        cancel,
    ));

    info!(config = %cli.config, gtid_mode = cfg.replication.gtid_mode, "starting replication");

    let run_handle = tokio::spawn(Arc::clone(&supervisor).run());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, closing supervisor");

    if let Err(e) = supervisor.close().await {
        error!(error = %e, "error while closing supervisor");
    }

    match run_handle.await {
        Ok(Ok(())) => info!("replication run loop exited cleanly"),
        Ok(Err(e)) => error!(error = %e, "replication run loop exited with errors"),
        Err(e) => error!(error = %e, "replication run loop task panicked"),
    }

    Ok(())
}

fn init_tracing(configured_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(configured_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds the initial rule registry from configuration. Each rule's primary
/// key layout is a placeholder until the source's first table-changed
/// notification refreshes it with the table's real columns — schema
/// introspection at rule-registration time, like the wire protocol itself,
/// is out of scope for the source boundary this crate defines.
fn build_rule_registry(cfg: &Config) -> Result<RuleRegistry> {
    let mut handlers = StaticHandlerRegistry::new();
    handlers.register("filter", Box::new(ProjectionHandlerFactory));

    let registry = RuleRegistry::new();
    for rule_cfg in &cfg.replication.rules {
        let handler = handlers
            .create(&rule_cfg.upstream.plugin.name, &rule_cfg.upstream.plugin.config)
            .with_context(|| format!("building handler for rule {}", rule_cfg.source.table))?;

        let source = SourceInfo {
            schema: cfg.replication.source.database.clone(),
            table: rule_cfg.source.table.clone(),
            pks: vec![Column::new(0, "id", ColumnType::Number)],
            cols: Vec::new(),
        };

        let rule = Rule::new(source, handler)
            .with_context(|| format!("registering rule for {}", rule_cfg.source.table))?;
        registry.insert(rule);
    }

    if registry.is_empty() {
        warn!("no rules configured; replication will not write to the sink");
    }

    Ok(registry)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
