use anyhow::{Context, Result};
use clap::Parser;
use orchestrator_config::{ConfigError, ConfigLoader, OrchestratorConfig};
use orchestrator_core::{Orchestrator, OrchestratorBuilder};
use orchestrator_service::api;
use orchestrator_service::cli::{Cli, Command};
use orchestrator_storage::implementations::{file, memory};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Extra time the demo waits beyond the event timeout.
const DEMO_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	// Initialize tracing
	setup_tracing(&cli.log_level)?;

	// Handle commands
	match cli.command {
		Some(Command::Start) | None => start_service(&cli.config).await,
		Some(Command::Validate) => validate_config(&cli.config).await,
		Some(Command::Demo { events }) => run_demo(&cli.config, events).await,
	}
}

async fn start_service(config_path: &Path) -> Result<()> {
	info!("Starting orchestrator");
	info!("Loading configuration from: {:?}", config_path);

	let config = ConfigLoader::new()
		.with_file(config_path)
		.load()
		.await
		.context("Failed to load configuration")?;

	info!("Service name: {}", config.service.name);
	info!("HTTP port: {}", config.service.http_port);
	info!("Storage backend: {}", config.storage.backend);

	let http_port = config.service.http_port;
	let orchestrator = Arc::new(build_orchestrator(config)?);

	let report = orchestrator
		.start()
		.await
		.context("Failed to start orchestrator")?;
	info!(
		resumed = report.resumed,
		finished = report.finished,
		"Recovered persisted instances"
	);

	let api_orchestrator = orchestrator.clone();
	let http_handle = tokio::spawn(async move {
		if let Err(e) = api::serve(api_orchestrator, http_port).await {
			error!("HTTP server failed: {:#}", e);
		}
	});

	info!("Orchestrator started successfully");

	// Wait for shutdown signal
	setup_shutdown_signal().await;

	info!("Shutdown signal received, stopping services...");

	orchestrator
		.shutdown()
		.await
		.context("Failed to shutdown orchestrator")?;

	http_handle.abort();

	info!("Orchestrator stopped");
	Ok(())
}

async fn validate_config(config_path: &Path) -> Result<()> {
	info!("Validating configuration file: {:?}", config_path);

	let config = ConfigLoader::new()
		.with_file(config_path)
		.load()
		.await
		.context("Failed to load configuration")?;

	info!("Configuration is valid");
	info!("Service name: {}", config.service.name);
	info!(
		"Engine: event timeout {}s, {} events by default",
		config.engine.event_timeout_secs, config.engine.default_event_count
	);
	info!(
		"Outbox: queue '{}', {} workers, {} attempts",
		config.outbox.queue_name, config.outbox.workers, config.outbox.max_attempts
	);
	info!("Storage: {}", config.storage.backend);

	Ok(())
}

/// Submits one instance in-process, lets the outbox deliver its events
/// and prints the final status report.
async fn run_demo(config_path: &Path, events: Option<usize>) -> Result<()> {
	let config = match ConfigLoader::new().with_file(config_path).load().await {
		Ok(config) => config,
		Err(ConfigError::FileNotFound(path)) => {
			warn!("Configuration file {} not found, using defaults", path);
			OrchestratorConfig::default()
		}
		Err(e) => return Err(e).context("Failed to load configuration"),
	};

	let wait = config.engine.event_timeout() + DEMO_GRACE;
	let orchestrator = build_orchestrator(config)?;
	if let Some(count) = events {
		orchestrator
			.engine()
			.check_event_count(count)
			.context("Invalid --events")?;
	}

	orchestrator
		.start()
		.await
		.context("Failed to start orchestrator")?;

	let instance_id = orchestrator
		.submit(events)
		.await
		.context("Failed to submit instance")?;

	let outcome = orchestrator
		.engine()
		.wait_for_terminal(&instance_id, wait)
		.await;

	orchestrator
		.shutdown()
		.await
		.context("Failed to shutdown orchestrator")?;

	let report = outcome.context("Instance did not finish")?;
	println!("{}", serde_json::to_string_pretty(&report)?);
	Ok(())
}

fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
	OrchestratorBuilder::new(config)
		.with_storage_factory("memory", memory::create_storage)
		.with_storage_factory("file", file::create_storage)
		.build()
		.context("Failed to build orchestrator")
}

fn setup_tracing(log_level: &str) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.try_init()
		.context("Failed to initialize tracing")?;

	Ok(())
}

async fn setup_shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(e) => {
				error!("Failed to install SIGTERM handler: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
