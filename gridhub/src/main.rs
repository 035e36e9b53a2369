/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Gridhub daemon: single-process host for the orchestration core.
//!
//! Wires the in-memory store, system clock, log-only event bus and
//! accept-all image validator into the [`Orchestrator`] and drives the two
//! periodic ticks until interrupted. Transports mount the [`Hub`] surface on
//! top of the same wiring.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridhub::api::Hub;
use gridhub::clock::SystemClock;
use gridhub::config::{Config, Mechanism};
use gridhub::orchestrator::Orchestrator;
use gridhub::ports::{AcceptAllImages, LogEventBus};
use gridhub::store::memory::MemoryStore;

/// Gridhub — trust-weighted task orchestration over an untrusted worker
/// fleet.
#[derive(Debug, Parser)]
#[command(name = "gridhub", version, about)]
struct Args {
    /// Path to the hub configuration YAML. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the scheduling mechanism from the config file.
    #[arg(long, value_enum)]
    mechanism: Option<CliMechanism>,

    /// Log filter, e.g. "info" or "gridhub=debug".
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliMechanism {
    Custom,
    Fifo,
}

impl From<CliMechanism> for Mechanism {
    fn from(value: CliMechanism) -> Self {
        match value {
            CliMechanism::Custom => Mechanism::Custom,
            CliMechanism::Fifo => Mechanism::Fifo,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).context("invalid --log-filter expression")?,
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(mechanism) = args.mechanism {
        config.mechanism = mechanism.into();
    }
    config.validate().context("configuration rejected")?;

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(SystemClock);
    let bus = Arc::new(LogEventBus);
    let images = Arc::new(AcceptAllImages);

    // The Hub shares the wiring with the orchestrator; a transport layer
    // would take this value and expose it.
    let _hub = Hub::new(
        store.clone(),
        clock.clone(),
        bus.clone(),
        images,
        config.clone(),
    );

    let orchestrator = Arc::new(Orchestrator::new(store, bus, clock, config.clone()));

    info!(
        mechanism = config.mechanism.as_str(),
        orchestration_interval_secs = config.orchestration_interval_secs,
        health_check_interval_secs = config.health_check_interval_secs,
        "gridhub starting"
    );

    let scheduling = tokio::spawn(orchestrator.clone().run_scheduling_loop());
    let liveness = tokio::spawn(orchestrator.clone().run_liveness_loop());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping ticks");

    scheduling.abort();
    liveness.abort();
    Ok(())
}
