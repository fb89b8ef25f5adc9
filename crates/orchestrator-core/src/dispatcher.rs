//! Fan-out entry point.
//!
//! A submission creates an instance with freshly generated event ids,
//! persists it, starts it on the engine and then hands one envelope per
//! expected event to the outbox. The caller never waits for the events
//! themselves.

use crate::engine::OrchestrationEngine;
use crate::error::EngineError;
use backoff::backoff::Backoff;
use orchestrator_outbox::{Outbox, RetryPolicy};
use orchestrator_types::{new_id, EventEnvelope, WorkInstance};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Dispatcher {
	engine: OrchestrationEngine,
	outbox: Arc<Outbox>,
	retry: RetryPolicy,
}

impl Dispatcher {
	pub fn new(engine: OrchestrationEngine, outbox: Arc<Outbox>, retry: RetryPolicy) -> Self {
		Self {
			engine,
			outbox,
			retry,
		}
	}

	/// Creates, starts and fans out an instance waiting for
	/// `expected_event_count` events. Returns once every envelope is
	/// durably enqueued.
	pub async fn submit(&self, expected_event_count: usize) -> Result<String, EngineError> {
		let instance = self.prepare(expected_event_count).await?;
		let instance_id = instance.id.clone();
		self.activate(instance).await?;
		Ok(instance_id)
	}

	/// Like [`submit`](Self::submit) but returns right after the instance
	/// is persisted; activation and fan-out continue in the background.
	pub async fn submit_detached(
		self: &Arc<Self>,
		expected_event_count: usize,
	) -> Result<String, EngineError> {
		let instance = self.prepare(expected_event_count).await?;
		let instance_id = instance.id.clone();

		let dispatcher = Arc::clone(self);
		tokio::spawn(async move {
			let instance_id = instance.id.clone();
			if let Err(e) = dispatcher.activate(instance).await {
				error!(instance_id = %instance_id, error = %e, "Fan-out failed");
			}
		});

		Ok(instance_id)
	}

	async fn prepare(&self, expected_event_count: usize) -> Result<WorkInstance, EngineError> {
		self.engine.check_event_count(expected_event_count)?;
		let event_ids: Vec<String> = (0..expected_event_count).map(|_| new_id()).collect();
		let instance = WorkInstance::new(
			new_id(),
			event_ids,
			self.engine.event_timeout_ms(),
			self.engine.now_ms(),
		)?;

		self.engine.create(instance.clone()).await?;
		info!(
			instance_id = %instance.id,
			events = ?instance.expected_event_ids,
			"Instance is going to wait the following events"
		);
		Ok(instance)
	}

	async fn activate(&self, instance: WorkInstance) -> Result<(), EngineError> {
		self.engine
			.start(&instance.id, instance.expected_event_ids.clone())
			.await?;

		for event_id in &instance.expected_event_ids {
			let envelope = EventEnvelope::new(&instance.id, event_id, json!({ "id": event_id }));
			self.enqueue_with_retry(envelope).await?;
		}
		Ok(())
	}

	async fn enqueue_with_retry(&self, envelope: EventEnvelope) -> Result<(), EngineError> {
		let mut backoff = self.retry.backoff();
		let mut attempts = 0;

		loop {
			attempts += 1;
			match self.outbox.enqueue(envelope.clone()).await {
				Ok(()) => return Ok(()),
				Err(e) if !self.retry.is_exhausted(attempts) => {
					let delay = backoff
						.next_backoff()
						.unwrap_or(self.retry.max_interval);
					warn!(
						instance_id = %envelope.instance_id,
						event_id = %envelope.event_id,
						attempts,
						error = %e,
						"Enqueue failed, retrying in {:?}",
						delay
					);
					tokio::time::sleep(delay).await;
				}
				Err(e) => {
					error!(
						instance_id = %envelope.instance_id,
						event_id = %envelope.event_id,
						attempts,
						error = %e,
						"Enqueue failed, giving up"
					);
					return Err(e.into());
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::TokioClock;
	use crate::store::InstanceStore;
	use async_trait::async_trait;
	use orchestrator_storage::implementations::memory::MemoryStorage;
	use orchestrator_storage::{StorageError, StorageInterface, StorageService};
	use orchestrator_types::{EngineConfig, EventBus, InstanceError, InstanceStatus, OutboxConfig};
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::time::Duration;

	/// Fails the first `failures` writes to the outbox namespace.
	struct FlakyOutboxStorage {
		inner: MemoryStorage,
		failures: AtomicU32,
	}

	#[async_trait]
	impl StorageInterface for FlakyOutboxStorage {
		async fn get_bytes(&self, namespace: &str, id: &str) -> Result<Vec<u8>, StorageError> {
			self.inner.get_bytes(namespace, id).await
		}

		async fn set_bytes(
			&self,
			namespace: &str,
			id: &str,
			value: Vec<u8>,
			ttl: Option<Duration>,
		) -> Result<(), StorageError> {
			if namespace.ends_with("_outbox")
				&& self
					.failures
					.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
					.is_ok()
			{
				return Err(StorageError::Backend("disk unavailable".into()));
			}
			self.inner.set_bytes(namespace, id, value, ttl).await
		}

		async fn delete(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
			self.inner.delete(namespace, id).await
		}

		async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
			self.inner.exists(namespace, id).await
		}

		async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
			self.inner.list_ids(namespace).await
		}
	}

	fn dispatcher_over(backend: Box<dyn StorageInterface>, attempts: u32) -> Arc<Dispatcher> {
		let storage = Arc::new(StorageService::new(backend));
		let bus = EventBus::new(256);
		let engine = OrchestrationEngine::new(
			EngineConfig::default(),
			InstanceStore::new(storage.clone()),
			Arc::new(TokioClock::new()),
			bus.clone(),
		);
		let outbox = Arc::new(Outbox::new(OutboxConfig::default(), storage, bus));
		let retry = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50), attempts);
		Arc::new(Dispatcher::new(engine, outbox, retry))
	}

	#[tokio::test(start_paused = true)]
	async fn test_submit_persists_and_enqueues_every_event() {
		let dispatcher = dispatcher_over(Box::new(MemoryStorage::new()), 3);
		let instance_id = dispatcher.submit(5).await.unwrap();

		let instance = dispatcher.engine.instance(&instance_id).await.unwrap();
		assert_eq!(instance.status, InstanceStatus::Running);
		assert_eq!(instance.expected_event_ids.len(), 5);
		assert_eq!(dispatcher.outbox.pending_count().await.unwrap(), 5);
	}

	#[tokio::test(start_paused = true)]
	async fn test_enqueue_retries_transient_failures() {
		let backend = FlakyOutboxStorage {
			inner: MemoryStorage::new(),
			failures: AtomicU32::new(2),
		};
		let dispatcher = dispatcher_over(Box::new(backend), 3);

		let instance_id = dispatcher.submit(1).await.unwrap();
		assert_eq!(dispatcher.outbox.pending_count().await.unwrap(), 1);
		assert_eq!(
			dispatcher.engine.get_status(&instance_id).await.unwrap().status,
			InstanceStatus::Running
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_enqueue_gives_up_after_attempt_limit() {
		let backend = FlakyOutboxStorage {
			inner: MemoryStorage::new(),
			failures: AtomicU32::new(10),
		};
		let dispatcher = dispatcher_over(Box::new(backend), 2);

		let err = dispatcher.submit(1).await.unwrap_err();
		assert!(matches!(err, EngineError::Outbox(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_submit_rejects_oversized_event_set() {
		let dispatcher = dispatcher_over(Box::new(MemoryStorage::new()), 3);
		let limit = EngineConfig::default().max_event_count;

		for requested in [limit + 1, usize::MAX] {
			let err = dispatcher.submit(requested).await.unwrap_err();
			assert!(matches!(
				err,
				EngineError::InvalidInstance(InstanceError::TooManyEvents { .. })
			));
		}
		assert_eq!(dispatcher.outbox.pending_count().await.unwrap(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_submit_detached_returns_persisted_id() {
		let dispatcher = dispatcher_over(Box::new(MemoryStorage::new()), 3);
		let instance_id = dispatcher.submit_detached(2).await.unwrap();

		// The record exists before activation finishes.
		assert!(dispatcher.engine.instance(&instance_id).await.is_ok());

		for _ in 0..10 {
			if dispatcher.outbox.pending_count().await.unwrap() == 2 {
				break;
			}
			tokio::task::yield_now().await;
		}
		assert_eq!(dispatcher.outbox.pending_count().await.unwrap(), 2);
		assert_eq!(
			dispatcher.engine.get_status(&instance_id).await.unwrap().status,
			InstanceStatus::Running
		);
	}
}
