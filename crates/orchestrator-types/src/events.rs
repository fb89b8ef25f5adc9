//! Event bus for broadcasting orchestration transitions.
//!
//! The engine and the outbox publish an [`OrchestrationEvent`] for every
//! state change. Nothing in the core depends on anyone listening: publishing
//! to a bus without subscribers is not an error worth reporting.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::InstanceStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrchestrationEvent {
	Instance(InstanceEvent),
	Outbox(OutboxEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstanceEvent {
	Created {
		instance_id: String,
		event_count: usize,
	},
	Started {
		instance_id: String,
		expected_event_ids: Vec<String>,
	},
	EventSatisfied {
		instance_id: String,
		event_id: String,
	},
	EventExpired {
		instance_id: String,
		event_id: String,
	},
	DuplicateRaise {
		instance_id: String,
		event_id: String,
	},
	Terminated {
		instance_id: String,
		status: InstanceStatus,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboxEvent {
	Enqueued {
		instance_id: String,
		event_id: String,
	},
	Delivered {
		instance_id: String,
		event_id: String,
		attempts: u32,
	},
	RetryScheduled {
		instance_id: String,
		event_id: String,
		attempt: u32,
		delay_ms: u64,
	},
	DeadLettered {
		instance_id: String,
		event_id: String,
		attempts: u32,
		error: String,
	},
}

impl OrchestrationEvent {
	/// Returns the terminal status if this event ends the given instance.
	pub fn terminal_status_of(&self, id: &str) -> Option<InstanceStatus> {
		match self {
			Self::Instance(InstanceEvent::Terminated {
				instance_id,
				status,
			}) if instance_id == id => Some(*status),
			_ => None,
		}
	}
}

/// Broadcast-based event bus shared by every component.
///
/// Cloning the bus creates a new handle to the same channel.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
	/// Creates a new EventBus with the specified channel capacity.
	///
	/// Slow subscribers lose the oldest events once `capacity` is exceeded.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event to all current subscribers.
	///
	/// Returns an error if there are no active subscribers.
	pub fn publish(
		&self,
		event: OrchestrationEvent,
	) -> Result<(), broadcast::error::SendError<OrchestrationEvent>> {
		self.sender.send(event)?;
		Ok(())
	}
}
