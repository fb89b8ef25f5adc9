// orchestrator-core/src/timers.rs

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// One deadline timer task per instance.
#[derive(Default)]
pub struct TimerRegistry {
	handles: DashMap<String, JoinHandle<()>>,
}

impl TimerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Installs a timer, aborting any previous one for the same instance.
	pub fn replace(&self, instance_id: &str, handle: JoinHandle<()>) {
		if let Some(previous) = self.handles.insert(instance_id.to_string(), handle) {
			previous.abort();
		}
	}

	pub fn cancel(&self, instance_id: &str) -> bool {
		match self.handles.remove(instance_id) {
			Some((_, handle)) => {
				handle.abort();
				true
			}
			None => false,
		}
	}

	pub fn cancel_all(&self) -> usize {
		let ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
		ids.iter().filter(|id| self.cancel(id)).count()
	}

	pub fn is_scheduled(&self, instance_id: &str) -> bool {
		self.handles
			.get(instance_id)
			.map(|handle| !handle.is_finished())
			.unwrap_or(false)
	}
}
