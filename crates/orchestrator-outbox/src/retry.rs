//! Retry policy shared by the outbox drain and the dispatcher.

use backoff::ExponentialBackoff;
use orchestrator_types::{DispatcherConfig, OutboxConfig};
use std::time::Duration;

/// Exponential backoff bounded by an attempt limit.
///
/// The elapsed-time cutoff of [`ExponentialBackoff`] is disabled; the
/// attempt count alone decides when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub initial_interval: Duration,
	pub max_interval: Duration,
	pub max_attempts: u32,
}

impl RetryPolicy {
	pub fn new(initial_interval: Duration, max_interval: Duration, max_attempts: u32) -> Self {
		Self {
			initial_interval,
			max_interval,
			max_attempts,
		}
	}

	pub fn from_outbox_config(config: &OutboxConfig) -> Self {
		Self::new(
			Duration::from_millis(config.initial_backoff_ms),
			Duration::from_millis(config.max_backoff_ms),
			config.max_attempts,
		)
	}

	/// Enqueue retries reuse the outbox intervals with their own attempt limit.
	pub fn for_dispatcher(outbox: &OutboxConfig, dispatcher: &DispatcherConfig) -> Self {
		Self {
			max_attempts: dispatcher.enqueue_max_attempts,
			..Self::from_outbox_config(outbox)
		}
	}

	/// Fresh backoff state for one envelope.
	pub fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoff {
			current_interval: self.initial_interval,
			initial_interval: self.initial_interval,
			max_interval: self.max_interval,
			max_elapsed_time: None,
			..ExponentialBackoff::default()
		}
	}

	pub fn is_exhausted(&self, attempts: u32) -> bool {
		attempts >= self.max_attempts
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use backoff::backoff::Backoff;

	#[test]
	fn test_backoff_is_bounded_and_never_stops() {
		let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 3);
		let mut backoff = policy.backoff();

		for _ in 0..50 {
			let delay = backoff.next_backoff().expect("elapsed-time cutoff is disabled");
			// Randomization may push a single delay up to 1.5x the cap.
			assert!(delay <= Duration::from_millis(1_500));
		}
	}

	#[test]
	fn test_attempt_limit() {
		let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 3);
		assert!(!policy.is_exhausted(2));
		assert!(policy.is_exhausted(3));
	}

	#[test]
	fn test_dispatcher_policy_uses_its_own_limit() {
		let outbox = OutboxConfig::default();
		let dispatcher = DispatcherConfig {
			enqueue_max_attempts: 7,
		};
		let policy = RetryPolicy::for_dispatcher(&outbox, &dispatcher);
		assert_eq!(policy.max_attempts, 7);
		assert_eq!(policy.initial_interval, Duration::from_millis(outbox.initial_backoff_ms));
	}
}
