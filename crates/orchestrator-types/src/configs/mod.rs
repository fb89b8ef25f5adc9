//! # Configuration Types
//!
//! Configuration structures for every component of the orchestrator.
//!
//! All sections carry serde defaults, so an empty file gives five events
//! per submission with a one minute per-event timeout.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
	/// Service identity, logging and HTTP settings
	#[serde(default)]
	pub service: ServiceSettings,
	/// Orchestration engine policy
	#[serde(default)]
	pub engine: EngineConfig,
	/// Outbox delivery settings
	#[serde(default)]
	pub outbox: OutboxConfig,
	/// Dispatcher settings
	#[serde(default)]
	pub dispatcher: DispatcherConfig,
	/// Storage backend selection
	#[serde(default)]
	pub storage: StorageConfig,
}

/// Core service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
	/// Name reported in logs and on the health endpoint
	#[serde(default = "default_service_name")]
	pub name: String,
	/// Logging level for the service
	#[serde(default = "default_log_level")]
	pub log_level: String,
	/// HTTP API server port
	#[serde(default = "default_http_port")]
	pub http_port: u16,
}

impl Default for ServiceSettings {
	fn default() -> Self {
		Self {
			name: default_service_name(),
			log_level: default_log_level(),
			http_port: default_http_port(),
		}
	}
}

/// Orchestration engine policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
	/// Per-event timeout, measured from the instance's activation
	#[serde(default = "default_event_timeout_secs")]
	pub event_timeout_secs: u64,
	/// Number of events fanned out when a submission does not specify one
	#[serde(default = "default_event_count")]
	pub default_event_count: usize,
	/// Largest event set a single instance may wait for
	#[serde(default = "default_max_event_count")]
	pub max_event_count: usize,
	/// Capacity of the broadcast event bus
	#[serde(default = "default_event_bus_capacity")]
	pub event_bus_capacity: usize,
}

impl EngineConfig {
	pub fn event_timeout(&self) -> Duration {
		Duration::from_secs(self.event_timeout_secs)
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			event_timeout_secs: default_event_timeout_secs(),
			default_event_count: default_event_count(),
			max_event_count: default_max_event_count(),
			event_bus_capacity: default_event_bus_capacity(),
		}
	}
}

/// Outbox delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
	/// Logical queue name, used to namespace persisted envelopes
	#[serde(default = "default_queue_name")]
	pub queue_name: String,
	/// Number of concurrent drain workers
	#[serde(default = "default_workers")]
	pub workers: usize,
	/// Delivery attempts before an envelope is dead-lettered
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	/// First retry delay
	#[serde(default = "default_initial_backoff_ms")]
	pub initial_backoff_ms: u64,
	/// Upper bound for retry delays
	#[serde(default = "default_max_backoff_ms")]
	pub max_backoff_ms: u64,
	/// How long an undelivered envelope is retained
	#[serde(default = "default_retention_secs")]
	pub retention_secs: u64,
}

impl OutboxConfig {
	pub fn retention(&self) -> Duration {
		Duration::from_secs(self.retention_secs)
	}
}

impl Default for OutboxConfig {
	fn default() -> Self {
		Self {
			queue_name: default_queue_name(),
			workers: default_workers(),
			max_attempts: default_max_attempts(),
			initial_backoff_ms: default_initial_backoff_ms(),
			max_backoff_ms: default_max_backoff_ms(),
			retention_secs: default_retention_secs(),
		}
	}
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
	/// Attempts made to enqueue each envelope before giving up
	#[serde(default = "default_enqueue_max_attempts")]
	pub enqueue_max_attempts: u32,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			enqueue_max_attempts: default_enqueue_max_attempts(),
		}
	}
}

/// Storage backend selection.
///
/// `backend` names a registered storage factory; `config` is handed to
/// that factory untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
	#[serde(default = "default_storage_backend")]
	pub backend: String,
	#[serde(default = "default_backend_table")]
	pub config: toml::Value,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			backend: default_storage_backend(),
			config: default_backend_table(),
		}
	}
}

fn default_service_name() -> String {
	"fanout-orchestrator".to_string()
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_http_port() -> u16 {
	7071
}

fn default_event_timeout_secs() -> u64 {
	60
}

fn default_event_count() -> usize {
	5
}

fn default_max_event_count() -> usize {
	10_000
}

fn default_event_bus_capacity() -> usize {
	1000
}

fn default_queue_name() -> String {
	"events".to_string()
}

fn default_workers() -> usize {
	4
}

fn default_max_attempts() -> u32 {
	5
}

fn default_initial_backoff_ms() -> u64 {
	200
}

fn default_max_backoff_ms() -> u64 {
	10_000
}

fn default_retention_secs() -> u64 {
	86_400
}

fn default_enqueue_max_attempts() -> u32 {
	3
}

fn default_storage_backend() -> String {
	"memory".to_string()
}

fn default_backend_table() -> toml::Value {
	toml::Value::Table(toml::map::Map::new())
}
