//! Per-event wait bookkeeping derived from history.

use serde::{Deserialize, Serialize};

use crate::EventOutcome;

/// State of a single wait registration.
///
/// Transitions are write-once: `Waiting` moves to exactly one of
/// `Satisfied` or `Expired` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
	Waiting,
	Satisfied,
	Expired,
}

impl RegistrationState {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, Self::Waiting)
	}
}

impl From<EventOutcome> for RegistrationState {
	fn from(outcome: EventOutcome) -> Self {
		match outcome {
			EventOutcome::Satisfied => Self::Satisfied,
			EventOutcome::Expired => Self::Expired,
		}
	}
}

/// Wait for one expected event of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRegistration {
	pub event_id: String,
	/// Absolute deadline (epoch millis), measured from the instance's activation.
	pub deadline_ms: u64,
	pub state: RegistrationState,
}

impl WaitRegistration {
	pub fn waiting(event_id: impl Into<String>, deadline_ms: u64) -> Self {
		Self {
			event_id: event_id.into(),
			deadline_ms,
			state: RegistrationState::Waiting,
		}
	}

	/// True when still waiting and the deadline has been reached.
	pub fn is_overdue(&self, now_ms: u64) -> bool {
		self.state == RegistrationState::Waiting && now_ms >= self.deadline_ms
	}
}
