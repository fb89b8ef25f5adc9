//! Read-only status snapshot returned to callers.

use serde::{Deserialize, Serialize};

use crate::InstanceStatus;

/// Result of a status query. Never mutates state; safe to poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
	pub instance_id: String,
	pub status: InstanceStatus,
	pub satisfied_count: usize,
	pub expired_count: usize,
	pub total_count: usize,
}
