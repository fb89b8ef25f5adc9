//! The durable orchestration record.
//!
//! A [`WorkInstance`] is written by the dispatcher while still `Pending`,
//! activated by the engine, and from then on mutated only by the engine.
//! The set of expected event ids never changes after creation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::HistoryEntry;

/// Generates a new globally unique identifier (128-bit random).
pub fn new_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

/// Errors raised while building a [`WorkInstance`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceError {
	/// The same event id was listed more than once.
	#[error("Duplicate expected event id: {0}")]
	DuplicateEventId(String),
	/// More expected events than the engine accepts per instance.
	#[error("Instance expects {requested} events, the limit is {limit}")]
	TooManyEvents { requested: usize, limit: usize },
	/// The instance id is empty.
	#[error("Instance id must not be empty")]
	EmptyInstanceId,
}

/// Lifecycle status of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
	Pending,
	Running,
	Completed,
	Failed,
	TimedOut,
}

impl InstanceStatus {
	/// Returns true once no further transition is possible.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
	}
}

impl fmt::Display for InstanceStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "Pending"),
			Self::Running => write!(f, "Running"),
			Self::Completed => write!(f, "Completed"),
			Self::Failed => write!(f, "Failed"),
			Self::TimedOut => write!(f, "TimedOut"),
		}
	}
}

/// Persisted state of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkInstance {
	/// Opaque unique identifier.
	pub id: String,
	/// Event ids this instance waits for, in creation order.
	pub expected_event_ids: Vec<String>,
	/// Current lifecycle status.
	pub status: InstanceStatus,
	/// When the dispatcher created the record (epoch millis).
	pub created_at_ms: u64,
	/// When the engine moved the record to `Running`. Deadlines are measured
	/// from here and this value is never reset.
	pub activated_at_ms: Option<u64>,
	/// Per-event timeout captured when the record was created.
	pub event_timeout_ms: u64,
	/// Append-only log of per-event outcomes.
	pub history: Vec<HistoryEntry>,
	/// Reason recorded when the instance ends `Failed`.
	pub failure: Option<String>,
}

impl WorkInstance {
	/// Creates a `Pending` instance, rejecting duplicate event ids.
	pub fn new(
		id: impl Into<String>,
		expected_event_ids: Vec<String>,
		event_timeout_ms: u64,
		created_at_ms: u64,
	) -> Result<Self, InstanceError> {
		let id = id.into();
		if id.is_empty() {
			return Err(InstanceError::EmptyInstanceId);
		}

		let mut seen = HashSet::with_capacity(expected_event_ids.len());
		for event_id in &expected_event_ids {
			if !seen.insert(event_id.as_str()) {
				return Err(InstanceError::DuplicateEventId(event_id.clone()));
			}
		}

		Ok(Self {
			id,
			expected_event_ids,
			status: InstanceStatus::Pending,
			created_at_ms,
			activated_at_ms: None,
			event_timeout_ms,
			history: Vec::new(),
			failure: None,
		})
	}

	/// Deadline shared by every registration of this instance, if activated.
	pub fn deadline_ms(&self) -> Option<u64> {
		self.activated_at_ms
			.map(|activated| activated.saturating_add(self.event_timeout_ms))
	}
}
