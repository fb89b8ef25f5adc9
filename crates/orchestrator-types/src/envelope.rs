//! Event envelopes carried by the outbox.

use serde::{Deserialize, Serialize};

/// An external event addressed to one orchestration instance.
///
/// The envelope references its instance by id only. The pair
/// `(instance_id, event_id)` is the idempotency key: re-enqueueing or
/// re-delivering the same envelope must have no additional effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub instance_id: String,
	pub event_id: String,
	/// Opaque payload passed through to the engine unchanged.
	#[serde(default)]
	pub payload: serde_json::Value,
}

impl EventEnvelope {
	pub fn new(
		instance_id: impl Into<String>,
		event_id: impl Into<String>,
		payload: serde_json::Value,
	) -> Self {
		Self {
			instance_id: instance_id.into(),
			event_id: event_id.into(),
			payload,
		}
	}

	/// Storage key identifying this envelope regardless of payload.
	pub fn idempotency_key(&self) -> String {
		format!("{}.{}", self.instance_id, self.event_id)
	}
}
