//! Deterministic reconstruction of wait registrations from history.
//!
//! Live mutations and recovery go through the same [`ReplayState::apply`]
//! transition, so folding a persisted history always lands on the state
//! the engine held when it last wrote that history.

use orchestrator_types::{
	EventOutcome, HistoryEntry, InstanceStatus, RegistrationState, WaitRegistration, WorkInstance,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
	#[error("Instance was never activated")]
	NotActivated,

	#[error("History entry {sequence} references unexpected event {event_id}")]
	UnexpectedEvent { sequence: u64, event_id: String },

	#[error("History entry {sequence} records a second outcome for event {event_id}")]
	DuplicateOutcome { sequence: u64, event_id: String },

	#[error("History entry has sequence {found}, expected {expected}")]
	OutOfOrder { found: u64, expected: u64 },
}

/// Registrations of one instance in expected-event order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
	registrations: Vec<WaitRegistration>,
	applied: u64,
}

impl ReplayState {
	fn fresh(instance: &WorkInstance) -> Result<Self, ReplayError> {
		let deadline = instance.deadline_ms().ok_or(ReplayError::NotActivated)?;
		Ok(Self {
			registrations: instance
				.expected_event_ids
				.iter()
				.map(|event_id| WaitRegistration::waiting(event_id.as_str(), deadline))
				.collect(),
			applied: 0,
		})
	}

	/// Folds one history entry into the registrations.
	///
	/// Registrations are write-once: a second outcome for the same event
	/// is an inconsistency, not an update.
	pub fn apply(&mut self, entry: &HistoryEntry) -> Result<(), ReplayError> {
		let expected = self.applied + 1;
		if entry.sequence != expected {
			return Err(ReplayError::OutOfOrder {
				found: entry.sequence,
				expected,
			});
		}

		let registration = self
			.registrations
			.iter_mut()
			.find(|r| r.event_id == entry.event_id)
			.ok_or_else(|| ReplayError::UnexpectedEvent {
				sequence: entry.sequence,
				event_id: entry.event_id.clone(),
			})?;

		if registration.state.is_terminal() {
			return Err(ReplayError::DuplicateOutcome {
				sequence: entry.sequence,
				event_id: entry.event_id.clone(),
			});
		}

		registration.state = entry.outcome.into();
		self.applied = entry.sequence;
		Ok(())
	}

	pub fn registration(&self, event_id: &str) -> Option<&WaitRegistration> {
		self.registrations.iter().find(|r| r.event_id == event_id)
	}

	/// Sequence number the next history entry must carry.
	pub fn next_sequence(&self) -> u64 {
		self.applied + 1
	}

	pub fn satisfied_count(&self) -> usize {
		self.count(RegistrationState::Satisfied)
	}

	pub fn expired_count(&self) -> usize {
		self.count(RegistrationState::Expired)
	}

	pub fn waiting_count(&self) -> usize {
		self.count(RegistrationState::Waiting)
	}

	fn count(&self, state: RegistrationState) -> usize {
		self.registrations
			.iter()
			.filter(|r| r.state == state)
			.count()
	}

	/// Waiting registrations whose deadline is at or before `now_ms`.
	pub fn overdue(&self, now_ms: u64) -> Vec<String> {
		self.registrations
			.iter()
			.filter(|r| r.is_overdue(now_ms))
			.map(|r| r.event_id.clone())
			.collect()
	}

	/// Earliest deadline among registrations still waiting.
	pub fn next_deadline_ms(&self) -> Option<u64> {
		self.registrations
			.iter()
			.filter(|r| r.state == RegistrationState::Waiting)
			.map(|r| r.deadline_ms)
			.min()
	}
}

/// Rebuilds the registrations of an activated instance from its history.
pub fn replay(instance: &WorkInstance) -> Result<ReplayState, ReplayError> {
	let mut state = ReplayState::fresh(instance)?;
	for entry in &instance.history {
		state.apply(entry)?;
	}
	Ok(state)
}

/// Terminal status implied by the registrations, if any.
///
/// Completed only when every registration is Satisfied; TimedOut once
/// nothing is waiting and at least one expired.
pub fn evaluate(state: &ReplayState) -> Option<InstanceStatus> {
	if state.waiting_count() > 0 {
		return None;
	}
	if state.expired_count() > 0 {
		Some(InstanceStatus::TimedOut)
	} else {
		Some(InstanceStatus::Completed)
	}
}

/// Builds the history entry that records `outcome` for `event_id`.
pub fn record(
	state: &ReplayState,
	event_id: &str,
	outcome: EventOutcome,
	recorded_at_ms: u64,
	payload: Option<serde_json::Value>,
) -> HistoryEntry {
	HistoryEntry {
		sequence: state.next_sequence(),
		event_id: event_id.to_string(),
		outcome,
		recorded_at_ms,
		payload,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn activated(ids: &[&str]) -> WorkInstance {
		let mut instance = WorkInstance::new(
			"wf-replay",
			ids.iter().map(|id| id.to_string()).collect(),
			60_000,
			0,
		)
		.unwrap();
		instance.status = InstanceStatus::Running;
		instance.activated_at_ms = Some(1_000);
		instance
	}

	fn push(instance: &mut WorkInstance, event_id: &str, outcome: EventOutcome) {
		let state = replay(instance).unwrap();
		let entry = record(&state, event_id, outcome, 2_000, None);
		instance.history.push(entry);
	}

	#[test]
	fn test_fresh_instance_has_all_waiting() {
		let instance = activated(&["a", "b", "c"]);
		let state = replay(&instance).unwrap();

		assert_eq!(state.waiting_count(), 3);
		assert_eq!(state.next_deadline_ms(), Some(61_000));
		assert_eq!(evaluate(&state), None);
	}

	#[test]
	fn test_unactivated_instance_cannot_replay() {
		let instance = WorkInstance::new("wf", vec!["a".into()], 1_000, 0).unwrap();
		assert_eq!(replay(&instance), Err(ReplayError::NotActivated));
	}

	#[test]
	fn test_replay_is_deterministic() {
		let mut instance = activated(&["a", "b", "c", "d"]);
		push(&mut instance, "c", EventOutcome::Satisfied);
		push(&mut instance, "a", EventOutcome::Satisfied);
		push(&mut instance, "d", EventOutcome::Expired);

		let first = replay(&instance).unwrap();
		for _ in 0..10 {
			assert_eq!(replay(&instance).unwrap(), first);
		}
		assert_eq!(first.satisfied_count(), 2);
		assert_eq!(first.expired_count(), 1);
		assert_eq!(
			first.registration("b").map(|r| r.state),
			Some(RegistrationState::Waiting)
		);
	}

	#[test]
	fn test_evaluate_outcomes() {
		let mut completed = activated(&["a", "b"]);
		push(&mut completed, "a", EventOutcome::Satisfied);
		push(&mut completed, "b", EventOutcome::Satisfied);
		assert_eq!(
			evaluate(&replay(&completed).unwrap()),
			Some(InstanceStatus::Completed)
		);

		let mut timed_out = activated(&["a", "b"]);
		push(&mut timed_out, "a", EventOutcome::Satisfied);
		push(&mut timed_out, "b", EventOutcome::Expired);
		assert_eq!(
			evaluate(&replay(&timed_out).unwrap()),
			Some(InstanceStatus::TimedOut)
		);
	}

	#[test]
	fn test_empty_expected_set_completes() {
		let instance = activated(&[]);
		let state = replay(&instance).unwrap();
		assert_eq!(state.next_deadline_ms(), None);
		assert_eq!(evaluate(&state), Some(InstanceStatus::Completed));
	}

	#[test]
	fn test_second_outcome_is_rejected() {
		let mut instance = activated(&["a", "b"]);
		push(&mut instance, "a", EventOutcome::Satisfied);
		instance.history.push(HistoryEntry {
			sequence: 2,
			event_id: "a".into(),
			outcome: EventOutcome::Expired,
			recorded_at_ms: 3_000,
			payload: None,
		});

		assert_eq!(
			replay(&instance),
			Err(ReplayError::DuplicateOutcome {
				sequence: 2,
				event_id: "a".into()
			})
		);
	}

	#[test]
	fn test_unknown_event_and_gaps_are_rejected() {
		let mut unknown = activated(&["a"]);
		unknown.history.push(HistoryEntry {
			sequence: 1,
			event_id: "zzz".into(),
			outcome: EventOutcome::Satisfied,
			recorded_at_ms: 0,
			payload: None,
		});
		assert!(matches!(
			replay(&unknown),
			Err(ReplayError::UnexpectedEvent { .. })
		));

		let mut gap = activated(&["a"]);
		gap.history.push(HistoryEntry {
			sequence: 2,
			event_id: "a".into(),
			outcome: EventOutcome::Satisfied,
			recorded_at_ms: 0,
			payload: None,
		});
		assert_eq!(
			replay(&gap),
			Err(ReplayError::OutOfOrder {
				found: 2,
				expected: 1
			})
		);
	}

	#[test]
	fn test_overdue_respects_deadline_boundary() {
		let instance = activated(&["a", "b"]);
		let state = replay(&instance).unwrap();
		assert!(state.overdue(60_999).is_empty());
		assert_eq!(state.overdue(61_000), vec!["a".to_string(), "b".to_string()]);
	}
}
