// orchestrator-config/src/lib.rs

use regex::Regex;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub use orchestrator_types::OrchestratorConfig;

/// Storage backends the service knows how to build.
pub const KNOWN_STORAGE_BACKENDS: &[&str] = &["memory", "file"];

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "ORCHESTRATOR_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<OrchestratorConfig, ConfigError> {
		// Load base configuration from file
		let mut config = if let Some(file_path) = &self.file_path {
			self.load_from_file(file_path).await?
		} else {
			return Err(ConfigError::FileNotFound(
				"No configuration file specified".to_string(),
			));
		};

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;

		Ok(config)
	}

	/// Parses configuration text, substituting `${VAR}` references and
	/// applying overrides, without touching the filesystem.
	pub fn load_from_str(&self, content: &str) -> Result<OrchestratorConfig, ConfigError> {
		let substituted = self.substitute_env_vars(content)?;
		let mut config: OrchestratorConfig =
			toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))?;

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;

		Ok(config)
	}

	async fn load_from_file(&self, file_path: &str) -> Result<OrchestratorConfig, ConfigError> {
		let content = match tokio::fs::read_to_string(file_path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(ConfigError::FileNotFound(file_path.to_string()))
			}
			Err(e) => return Err(e.into()),
		};

		let substituted_content = self.substitute_env_vars(&content)?;

		let config: OrchestratorConfig = toml::from_str(&substituted_content)
			.map_err(|e| ConfigError::ParseError(e.to_string()))?;

		Ok(config)
	}

	fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
		let mut result = content.to_string();

		// Find and replace ${VAR_NAME} patterns
		let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::ParseError(e.to_string()))?;

		for cap in re.captures_iter(content) {
			let full_match = &cap[0];
			let var_name = &cap[1];

			let env_value = env::var(var_name)
				.map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;

			result = result.replace(full_match, &env_value);
		}

		Ok(result)
	}

	fn apply_env_overrides(&self, config: &mut OrchestratorConfig) -> Result<(), ConfigError> {
		if let Ok(log_level) = env::var(format!("{}LOG_LEVEL", self.env_prefix)) {
			debug!("Overriding log level from environment");
			config.service.log_level = log_level;
		}

		if let Ok(http_port) = env::var(format!("{}HTTP_PORT", self.env_prefix)) {
			config.service.http_port = http_port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid HTTP port: {}", e)))?;
		}

		if let Ok(timeout) = env::var(format!("{}EVENT_TIMEOUT_SECS", self.env_prefix)) {
			config.engine.event_timeout_secs = timeout.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid event timeout: {}", e))
			})?;
		}

		Ok(())
	}
}

/// Checks cross-field constraints serde cannot express.
pub fn validate_config(config: &OrchestratorConfig) -> Result<(), ConfigError> {
	if config.engine.event_timeout_secs == 0 {
		return Err(ConfigError::ValidationError(
			"engine.event_timeout_secs must be greater than zero".to_string(),
		));
	}

	if config.engine.max_event_count == 0 {
		return Err(ConfigError::ValidationError(
			"engine.max_event_count must be at least 1".to_string(),
		));
	}

	if config.engine.default_event_count > config.engine.max_event_count {
		return Err(ConfigError::ValidationError(format!(
			"engine.default_event_count ({}) exceeds engine.max_event_count ({})",
			config.engine.default_event_count, config.engine.max_event_count
		)));
	}

	if config.outbox.queue_name.trim().is_empty() {
		return Err(ConfigError::ValidationError(
			"outbox.queue_name must not be empty".to_string(),
		));
	}

	if config.outbox.workers == 0 {
		return Err(ConfigError::ValidationError(
			"outbox.workers must be at least 1".to_string(),
		));
	}

	if config.outbox.max_attempts == 0 || config.dispatcher.enqueue_max_attempts == 0 {
		return Err(ConfigError::ValidationError(
			"attempt limits must be at least 1".to_string(),
		));
	}

	if config.outbox.initial_backoff_ms > config.outbox.max_backoff_ms {
		return Err(ConfigError::ValidationError(
			"outbox.initial_backoff_ms exceeds outbox.max_backoff_ms".to_string(),
		));
	}

	if !KNOWN_STORAGE_BACKENDS.contains(&config.storage.backend.as_str()) {
		return Err(ConfigError::ValidationError(format!(
			"Unknown storage backend: {}",
			config.storage.backend
		)));
	}

	if config.storage.backend == "file" && config.storage.config.get("storage_path").is_none() {
		return Err(ConfigError::ValidationError(
			"file storage requires storage.config.storage_path".to_string(),
		));
	}

	Ok(())
}
