//! Durable at-least-once delivery queue.
//!
//! Envelopes are persisted before they are handed to the in-process queue
//! and removed only once the sink acknowledges them, so a crash between
//! enqueue and delivery is repaired by [`Outbox::recover`]. A pool of drain
//! workers shares a single queue; nothing about delivery order is
//! guaranteed, and the same envelope may be delivered more than once.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use orchestrator_storage::{StorageError, StorageService};
use orchestrator_types::{EventBus, EventEnvelope, OrchestrationEvent, OutboxConfig, OutboxEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod retry;

pub use retry::RetryPolicy;

/// Errors surfaced by outbox operations.
#[derive(Debug, Error)]
pub enum OutboxError {
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Outbox queue closed")]
	Closed,
}

/// Failure reported by an [`EventSink`] for one delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
	/// Transient; the envelope is retried with backoff.
	#[error("Retryable delivery failure: {0}")]
	Retryable(String),
	/// Permanent; the envelope is acknowledged and dropped with a warning.
	#[error("Delivery rejected: {0}")]
	Rejected(String),
}

/// Destination of drained envelopes.
#[async_trait]
pub trait EventSink: Send + Sync {
	async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), DeliveryError>;
}

/// Envelope whose delivery attempts ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
	pub envelope: EventEnvelope,
	pub attempts: u32,
	pub last_error: String,
}

struct QueuedEnvelope {
	envelope: EventEnvelope,
	attempts: u32,
	backoff: ExponentialBackoff,
}

pub struct Outbox {
	config: OutboxConfig,
	retry: RetryPolicy,
	storage: Arc<StorageService>,
	event_bus: EventBus,
	sender: mpsc::UnboundedSender<QueuedEnvelope>,
	receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedEnvelope>>>,
}

impl Outbox {
	pub fn new(config: OutboxConfig, storage: Arc<StorageService>, event_bus: EventBus) -> Self {
		let (sender, receiver) = mpsc::unbounded_channel();
		Self {
			retry: RetryPolicy::from_outbox_config(&config),
			config,
			storage,
			event_bus,
			sender,
			receiver: Arc::new(Mutex::new(receiver)),
		}
	}

	fn pending_namespace(&self) -> String {
		format!("{}_outbox", self.config.queue_name)
	}

	fn dead_letter_namespace(&self) -> String {
		format!("{}_dead_letters", self.config.queue_name)
	}

	/// Durably records an envelope and queues it for delivery.
	///
	/// Enqueueing the same envelope twice stores it once and may deliver
	/// it twice.
	pub async fn enqueue(&self, envelope: EventEnvelope) -> Result<(), OutboxError> {
		self.storage
			.store_with_ttl(
				&self.pending_namespace(),
				&envelope.idempotency_key(),
				&envelope,
				Some(self.config.retention()),
			)
			.await?;

		self.event_bus
			.publish(OrchestrationEvent::Outbox(OutboxEvent::Enqueued {
				instance_id: envelope.instance_id.clone(),
				event_id: envelope.event_id.clone(),
			}))
			.ok();

		debug!(
			queue = %self.config.queue_name,
			instance_id = %envelope.instance_id,
			event_id = %envelope.event_id,
			"Envelope enqueued"
		);

		self.push(envelope)
	}

	fn push(&self, envelope: EventEnvelope) -> Result<(), OutboxError> {
		self.sender
			.send(QueuedEnvelope {
				envelope,
				attempts: 0,
				backoff: self.retry.backoff(),
			})
			.map_err(|_| OutboxError::Closed)
	}

	/// Re-queues every envelope still persisted from a previous run.
	pub async fn recover(&self) -> Result<usize, OutboxError> {
		let namespace = self.pending_namespace();
		let mut recovered = 0;

		for key in self.storage.list(&namespace).await? {
			match self.storage.find::<EventEnvelope>(&namespace, &key).await? {
				Some(envelope) => {
					self.push(envelope)?;
					recovered += 1;
				}
				None => continue,
			}
		}

		if recovered > 0 {
			info!(queue = %self.config.queue_name, recovered, "Recovered undelivered envelopes");
		}
		Ok(recovered)
	}

	/// Number of persisted envelopes not yet acknowledged.
	pub async fn pending_count(&self) -> Result<usize, OutboxError> {
		Ok(self.storage.list(&self.pending_namespace()).await?.len())
	}

	pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, OutboxError> {
		let namespace = self.dead_letter_namespace();
		let mut letters = Vec::new();
		for key in self.storage.list(&namespace).await? {
			if let Some(letter) = self.storage.find::<DeadLetter>(&namespace, &key).await? {
				letters.push(letter);
			}
		}
		Ok(letters)
	}

	/// Spawns the drain workers. Each stops when `shutdown` fires.
	pub fn start(
		self: &Arc<Self>,
		sink: Arc<dyn EventSink>,
		shutdown: &broadcast::Sender<()>,
	) -> Vec<JoinHandle<()>> {
		info!(
			queue = %self.config.queue_name,
			workers = self.config.workers,
			"Starting outbox drain"
		);

		(0..self.config.workers)
			.map(|worker| {
				let outbox = Arc::clone(self);
				let sink = Arc::clone(&sink);
				let shutdown = shutdown.subscribe();
				tokio::spawn(async move { outbox.drain(worker, sink, shutdown).await })
			})
			.collect()
	}

	async fn drain(
		self: Arc<Self>,
		worker: usize,
		sink: Arc<dyn EventSink>,
		mut shutdown: broadcast::Receiver<()>,
	) {
		loop {
			let next = tokio::select! {
				item = async { self.receiver.lock().await.recv().await } => item,
				_ = shutdown.recv() => None,
			};

			match next {
				Some(item) => self.process(sink.as_ref(), item).await,
				None => break,
			}
		}
		debug!(queue = %self.config.queue_name, worker, "Outbox worker stopped");
	}

	async fn process(&self, sink: &dyn EventSink, mut item: QueuedEnvelope) {
		item.attempts += 1;
		let envelope = &item.envelope;

		match sink.deliver(envelope).await {
			Ok(()) => {
				self.acknowledge(envelope).await;
				self.event_bus
					.publish(OrchestrationEvent::Outbox(OutboxEvent::Delivered {
						instance_id: envelope.instance_id.clone(),
						event_id: envelope.event_id.clone(),
						attempts: item.attempts,
					}))
					.ok();
				info!(
					instance_id = %envelope.instance_id,
					event_id = %envelope.event_id,
					"Event sent to orchestration"
				);
			}
			Err(DeliveryError::Rejected(reason)) => {
				warn!(
					instance_id = %envelope.instance_id,
					event_id = %envelope.event_id,
					%reason,
					"Delivery rejected, dropping envelope"
				);
				self.acknowledge(envelope).await;
			}
			Err(DeliveryError::Retryable(reason)) => {
				if self.retry.is_exhausted(item.attempts) {
					self.dead_letter(item, reason).await;
					return;
				}

				let delay = item
					.backoff
					.next_backoff()
					.unwrap_or(self.retry.max_interval);

				debug!(
					instance_id = %envelope.instance_id,
					event_id = %envelope.event_id,
					attempt = item.attempts,
					delay_ms = delay.as_millis() as u64,
					%reason,
					"Delivery failed, scheduling retry"
				);
				self.event_bus
					.publish(OrchestrationEvent::Outbox(OutboxEvent::RetryScheduled {
						instance_id: envelope.instance_id.clone(),
						event_id: envelope.event_id.clone(),
						attempt: item.attempts,
						delay_ms: delay.as_millis() as u64,
					}))
					.ok();

				let sender = self.sender.clone();
				tokio::spawn(async move {
					tokio::time::sleep(delay).await;
					// A closed queue leaves the envelope persisted for recovery.
					let _ = sender.send(item);
				});
			}
		}
	}

	async fn acknowledge(&self, envelope: &EventEnvelope) {
		if let Err(e) = self
			.storage
			.remove(&self.pending_namespace(), &envelope.idempotency_key())
			.await
		{
			// The envelope stays persisted and is redelivered after recovery.
			warn!(
				instance_id = %envelope.instance_id,
				event_id = %envelope.event_id,
				error = %e,
				"Failed to acknowledge envelope"
			);
		}
	}

	async fn dead_letter(&self, item: QueuedEnvelope, last_error: String) {
		let envelope = item.envelope;
		let key = envelope.idempotency_key();

		error!(
			queue = %self.config.queue_name,
			instance_id = %envelope.instance_id,
			event_id = %envelope.event_id,
			attempts = item.attempts,
			error = %last_error,
			"Delivery attempts exhausted, moving envelope to dead letters"
		);

		self.event_bus
			.publish(OrchestrationEvent::Outbox(OutboxEvent::DeadLettered {
				instance_id: envelope.instance_id.clone(),
				event_id: envelope.event_id.clone(),
				attempts: item.attempts,
				error: last_error.clone(),
			}))
			.ok();

		let letter = DeadLetter {
			envelope,
			attempts: item.attempts,
			last_error,
		};

		if let Err(e) = self
			.storage
			.store(&self.dead_letter_namespace(), &key, &letter)
			.await
		{
			error!(error = %e, key = %key, "Failed to persist dead letter");
			return;
		}

		if let Err(e) = self.storage.remove(&self.pending_namespace(), &key).await {
			warn!(error = %e, key = %key, "Failed to remove dead-lettered envelope from outbox");
		}
	}
}
