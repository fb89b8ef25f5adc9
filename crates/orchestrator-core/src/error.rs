// orchestrator-core/src/error.rs

use orchestrator_outbox::OutboxError;
use orchestrator_storage::StorageError;
use orchestrator_types::{InstanceError, InstanceStatus};
use std::fmt;
use thiserror::Error;

/// Why an instance could not accept an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
	/// No record exists, possibly because it has not been created yet.
	Unknown,
	/// The record exists but the engine has not activated it yet.
	NotStarted,
	/// The instance already reached a terminal status.
	Terminal(InstanceStatus),
}

impl fmt::Display for NotFoundReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unknown => write!(f, "unknown instance"),
			Self::NotStarted => write!(f, "instance not started"),
			Self::Terminal(status) => write!(f, "instance already {}", status),
		}
	}
}

#[derive(Error, Debug)]
pub enum EngineError {
	#[error("Instance {instance_id} not found: {reason}")]
	NotFound {
		instance_id: String,
		reason: NotFoundReason,
	},

	#[error("Invalid instance: {0}")]
	InvalidInstance(#[from] InstanceError),

	#[error("Engine fault on instance {instance_id}: {reason}")]
	Fault { instance_id: String, reason: String },

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	#[error("Outbox error: {0}")]
	Outbox(#[from] OutboxError),

	#[error("Timed out waiting for instance {0}")]
	WaitTimeout(String),
}

impl EngineError {
	pub(crate) fn not_found(instance_id: &str, reason: NotFoundReason) -> Self {
		Self::NotFound {
			instance_id: instance_id.to_string(),
			reason,
		}
	}

	/// Whether repeating the same call later may succeed.
	///
	/// An instance that is unknown or not yet started may still appear;
	/// a terminal or faulted one never accepts events again.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::NotFound { reason, .. } => {
				matches!(reason, NotFoundReason::Unknown | NotFoundReason::NotStarted)
			}
			Self::Storage(_) | Self::Outbox(_) => true,
			Self::InvalidInstance(_) | Self::Fault { .. } | Self::WaitTimeout(_) => false,
		}
	}
}

#[derive(Error, Debug)]
pub enum CoreError {
	#[error("Configuration error: {0}")]
	Configuration(String),

	#[error("Lifecycle error: {0}")]
	Lifecycle(String),

	#[error("Engine error: {0}")]
	Engine(#[from] EngineError),

	#[error("Outbox error: {0}")]
	Outbox(#[from] OutboxError),

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
}
