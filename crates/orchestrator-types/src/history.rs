//! History log entries.

use serde::{Deserialize, Serialize};

/// Terminal outcome recorded for one expected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventOutcome {
	/// The event was raised before its deadline.
	Satisfied,
	/// The deadline elapsed before the event was raised.
	Expired,
}

/// One append-only record in an instance's history.
///
/// Registrations are rebuilt from these entries on every activation, so an
/// entry is written at most once per event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
	/// Position in the log, starting at 1.
	pub sequence: u64,
	pub event_id: String,
	pub outcome: EventOutcome,
	/// Engine clock reading when the entry was appended (epoch millis).
	pub recorded_at_ms: u64,
	/// Payload of the raise that satisfied the event.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<serde_json::Value>,
}
