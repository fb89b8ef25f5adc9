//! Durable fan-out orchestration.
//!
//! The [`Orchestrator`] wires the three moving parts together: the
//! [`Dispatcher`] creates instances and fans their events out through the
//! [`Outbox`], whose drain workers deliver each envelope to the
//! [`OrchestrationEngine`]. The engine settles every wait registration
//! exactly once, either by a raise or by its deadline.

use orchestrator_outbox::{EventSink, Outbox, RetryPolicy};
use orchestrator_storage::{StorageInterface, StorageService};
use orchestrator_types::{EventBus, OrchestratorConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod replay;
pub mod store;
pub mod timers;

pub use clock::{Clock, SystemClock, TokioClock};
pub use dispatcher::Dispatcher;
pub use engine::{OrchestrationEngine, RaiseOutcome, RecoveryReport, StartOutcome, TickOutcome};
pub use error::{CoreError, EngineError, NotFoundReason};
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use store::InstanceStore;

pub struct Orchestrator {
	config: OrchestratorConfig,
	engine: OrchestrationEngine,
	dispatcher: Arc<Dispatcher>,
	outbox: Arc<Outbox>,
	event_bus: EventBus,
	lifecycle: LifecycleManager,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
	/// Replays persisted state, then starts the outbox drain.
	pub async fn start(&self) -> Result<RecoveryReport, CoreError> {
		self.lifecycle.begin_recovery().await?;

		let report = match self.recover().await {
			Ok(report) => report,
			Err(e) => {
				self.lifecycle.fail().await.ok();
				return Err(e);
			}
		};

		let sink: Arc<dyn EventSink> = Arc::new(self.engine.clone());
		let handles = self.outbox.start(sink, self.lifecycle.shutdown_sender());
		self.workers.lock().await.extend(handles);

		self.lifecycle.start().await?;
		info!(service = %self.config.service.name, "Orchestrator is running");
		Ok(report)
	}

	async fn recover(&self) -> Result<RecoveryReport, CoreError> {
		// Instances first, so recovered envelopes find them Running.
		let report = self.engine.recover().await?;
		self.outbox.recover().await?;
		Ok(report)
	}

	/// Stops the drain workers and deadline timers. Undelivered envelopes
	/// and running instances stay persisted for the next start.
	pub async fn shutdown(&self) -> Result<(), CoreError> {
		self.lifecycle.shutdown().await?;
		self.engine.shutdown();

		let workers = std::mem::take(&mut *self.workers.lock().await);
		for result in futures::future::join_all(workers).await {
			if let Err(e) = result {
				warn!(error = %e, "Outbox worker ended abnormally");
			}
		}

		info!(service = %self.config.service.name, "Orchestrator stopped");
		Ok(())
	}

	/// Submits an instance, falling back to the configured event count.
	pub async fn submit(&self, expected_event_count: Option<usize>) -> Result<String, CoreError> {
		let count = expected_event_count.unwrap_or(self.config.engine.default_event_count);
		Ok(self.dispatcher.submit(count).await?)
	}

	pub fn engine(&self) -> &OrchestrationEngine {
		&self.engine
	}

	pub fn dispatcher(&self) -> &Arc<Dispatcher> {
		&self.dispatcher
	}

	pub fn outbox(&self) -> &Arc<Outbox> {
		&self.outbox
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	pub fn lifecycle(&self) -> &LifecycleManager {
		&self.lifecycle
	}

	pub fn config(&self) -> &OrchestratorConfig {
		&self.config
	}
}

type StorageFactory = Box<dyn Fn(&toml::Value) -> Box<dyn StorageInterface> + Send>;

/// Builds an [`Orchestrator`] from configuration.
///
/// Storage backends are registered by name; `storage.backend` selects one
/// and `storage.config` is handed to its factory.
pub struct OrchestratorBuilder {
	config: OrchestratorConfig,
	storage_factories: HashMap<String, StorageFactory>,
	storage: Option<Arc<StorageService>>,
	clock: Option<Arc<dyn Clock>>,
}

impl OrchestratorBuilder {
	pub fn new(config: OrchestratorConfig) -> Self {
		Self {
			config,
			storage_factories: HashMap::new(),
			storage: None,
			clock: None,
		}
	}

	pub fn with_storage_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Box<dyn StorageInterface> + Send + 'static,
	{
		self.storage_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	/// Uses an existing storage service instead of a registered factory.
	pub fn with_storage(mut self, storage: Arc<StorageService>) -> Self {
		self.storage = Some(storage);
		self
	}

	/// Defaults to [`SystemClock`].
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn build(self) -> Result<Orchestrator, CoreError> {
		let storage = match self.storage {
			Some(storage) => storage,
			None => {
				let backend = &self.config.storage.backend;
				let factory = self.storage_factories.get(backend).ok_or_else(|| {
					CoreError::Configuration(format!(
						"No storage factory registered for backend '{}'",
						backend
					))
				})?;
				Arc::new(StorageService::new(factory(&self.config.storage.config)))
			}
		};

		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let event_bus = EventBus::new(self.config.engine.event_bus_capacity);

		let engine = OrchestrationEngine::new(
			self.config.engine.clone(),
			InstanceStore::new(storage.clone()),
			clock,
			event_bus.clone(),
		);
		let outbox = Arc::new(Outbox::new(
			self.config.outbox.clone(),
			storage,
			event_bus.clone(),
		));
		let retry = RetryPolicy::for_dispatcher(&self.config.outbox, &self.config.dispatcher);
		let dispatcher = Arc::new(Dispatcher::new(engine.clone(), outbox.clone(), retry));

		Ok(Orchestrator {
			config: self.config,
			engine,
			dispatcher,
			outbox,
			event_bus,
			lifecycle: LifecycleManager::new(),
			workers: Mutex::new(Vec::new()),
		})
	}
}
