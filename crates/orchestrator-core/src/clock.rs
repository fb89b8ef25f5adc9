//! Time sources for deadlines.

use tokio::time::Instant;

/// Supplies the engine's notion of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
	fn now_ms(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> u64 {
		chrono::Utc::now().timestamp_millis().max(0) as u64
	}
}

/// Monotonic clock anchored to an epoch reading.
///
/// Backed by `tokio::time::Instant`, so it follows paused and advanced
/// time in tests and agrees exactly with the timers the engine sleeps on.
/// Share one instance between engines that must agree on time.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
	anchor: Instant,
	epoch_ms: u64,
}

impl TokioClock {
	pub fn new() -> Self {
		Self::starting_at(SystemClock.now_ms())
	}

	pub fn starting_at(epoch_ms: u64) -> Self {
		Self {
			anchor: Instant::now(),
			epoch_ms,
		}
	}
}

impl Default for TokioClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for TokioClock {
	fn now_ms(&self) -> u64 {
		self.epoch_ms + self.anchor.elapsed().as_millis() as u64
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test(start_paused = true)]
	async fn test_tokio_clock_follows_paused_time() {
		let clock = TokioClock::starting_at(1_000);
		assert_eq!(clock.now_ms(), 1_000);

		tokio::time::advance(Duration::from_millis(250)).await;
		assert_eq!(clock.now_ms(), 1_250);
	}

	#[test]
	fn test_system_clock_is_after_2020() {
		assert!(SystemClock.now_ms() > 1_577_836_800_000);
	}
}
