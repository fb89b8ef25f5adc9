//! Orchestration engine.
//!
//! Every mutation of an instance runs inside that instance's critical
//! section: a `tokio::sync::Mutex` looked up by id. Inside it the engine
//! loads the record, replays its history, appends only the entries the
//! operation implies, evaluates completion and persists the result before
//! the lock is released. Raises and deadline sweeps for the same instance
//! therefore never interleave, and whichever runs first decides the
//! outcome of a registration for good.

use crate::clock::Clock;
use crate::error::{EngineError, NotFoundReason};
use crate::replay::{self, ReplayState};
use crate::store::InstanceStore;
use crate::timers::TimerRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use orchestrator_outbox::{DeliveryError, EventSink};
use orchestrator_types::{
	EngineConfig, EventBus, EventEnvelope, EventOutcome, InstanceError, InstanceEvent,
	InstanceStatus, OrchestrationEvent, RegistrationState, StatusReport, WorkInstance,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Delay before a timer retries a sweep that hit a transient error.
const TIMER_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
	Started,
	/// The instance was already activated; nothing was changed.
	AlreadyStarted(InstanceStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaiseOutcome {
	/// The registration moved from Waiting to Satisfied.
	Satisfied { status: InstanceStatus },
	/// The registration was already Satisfied.
	Duplicate,
	/// The registration's deadline passed before the raise was processed.
	Expired { status: InstanceStatus },
	/// The instance does not wait for this event id.
	UnknownEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
	pub expired: Vec<String>,
	pub status: InstanceStatus,
	pub next_deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
	/// Running instances whose timers were re-armed.
	pub resumed: usize,
	/// Instances that reached, or had already reached, a terminal status.
	pub finished: usize,
	/// Instances persisted by a dispatcher but never started.
	pub pending: usize,
	/// Instances failed because their history could not be replayed.
	pub faulted: usize,
}

/// Critical section for one instance.
///
/// The map entry is dropped together with the last holder, so the lock
/// map only holds ids with an operation in flight.
struct InstanceGuard<'a> {
	locks: &'a DashMap<String, Arc<Mutex<()>>>,
	instance_id: String,
	guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
	fn drop(&mut self) {
		self.guard.take();
		// Waiters hold their own clone of the mutex.
		self.locks
			.remove_if(&self.instance_id, |_, mutex| Arc::strong_count(mutex) == 1);
	}
}

enum Resumed {
	Running,
	Finished,
	Pending,
}

struct EngineInner {
	config: EngineConfig,
	store: InstanceStore,
	clock: Arc<dyn Clock>,
	event_bus: EventBus,
	locks: DashMap<String, Arc<Mutex<()>>>,
	timers: TimerRegistry,
}

/// Cheap to clone; clones share locks, timers and storage.
#[derive(Clone)]
pub struct OrchestrationEngine {
	inner: Arc<EngineInner>,
}

impl OrchestrationEngine {
	pub fn new(
		config: EngineConfig,
		store: InstanceStore,
		clock: Arc<dyn Clock>,
		event_bus: EventBus,
	) -> Self {
		Self {
			inner: Arc::new(EngineInner {
				config,
				store,
				clock,
				event_bus,
				locks: DashMap::new(),
				timers: TimerRegistry::new(),
			}),
		}
	}

	pub fn now_ms(&self) -> u64 {
		self.inner.clock.now_ms()
	}

	pub fn event_timeout_ms(&self) -> u64 {
		self.inner.config.event_timeout().as_millis() as u64
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.inner.event_bus
	}

	/// Rejects event sets larger than `engine.max_event_count`.
	pub fn check_event_count(&self, requested: usize) -> Result<(), EngineError> {
		let limit = self.inner.config.max_event_count;
		if requested > limit {
			return Err(InstanceError::TooManyEvents { requested, limit }.into());
		}
		Ok(())
	}

	/// Persists a Pending instance unless a record with its id exists.
	pub async fn create(&self, instance: WorkInstance) -> Result<(), EngineError> {
		self.check_event_count(instance.expected_event_ids.len())?;
		let _guard = self.lock(&instance.id).await;
		if self.inner.store.load(&instance.id).await?.is_some() {
			debug!(instance_id = %instance.id, "Instance already exists, create ignored");
			return Ok(());
		}

		self.inner.store.save(&instance).await?;
		self.publish(InstanceEvent::Created {
			instance_id: instance.id.clone(),
			event_count: instance.expected_event_ids.len(),
		});
		Ok(())
	}

	/// Activates an instance and arms its deadline timer.
	///
	/// The activation time is recorded once; starting an instance that is
	/// already Running or terminal changes nothing.
	pub async fn start(
		&self,
		instance_id: &str,
		expected_event_ids: Vec<String>,
	) -> Result<StartOutcome, EngineError> {
		self.check_event_count(expected_event_ids.len())?;
		let _guard = self.lock(instance_id).await;
		let now = self.now_ms();

		let mut instance = match self.inner.store.load(instance_id).await? {
			Some(existing) if existing.status != InstanceStatus::Pending => {
				debug!(instance_id, status = %existing.status, "Instance already started");
				return Ok(StartOutcome::AlreadyStarted(existing.status));
			}
			Some(existing) => {
				if existing.expected_event_ids != expected_event_ids {
					warn!(
						instance_id,
						"Start requested with a different event set, keeping the persisted one"
					);
				}
				existing
			}
			None => {
				WorkInstance::new(instance_id, expected_event_ids, self.event_timeout_ms(), now)?
			}
		};

		instance.status = InstanceStatus::Running;
		instance.activated_at_ms = Some(now);
		let (instance, state) = self.replay_or_fail(instance).await?;

		info!(
			instance_id,
			expected = ?instance.expected_event_ids,
			"Instance is started"
		);
		let started = InstanceEvent::Started {
			instance_id: instance_id.to_string(),
			expected_event_ids: instance.expected_event_ids.clone(),
		};
		let status = self.commit(instance, &state, vec![started]).await?;
		if !status.is_terminal() {
			self.schedule_timer(instance_id, state.next_deadline_ms());
		}

		Ok(StartOutcome::Started)
	}

	/// Records the arrival of an event.
	///
	/// Registrations already past their deadline are expired first, so a
	/// raise processed at or after the deadline loses to expiry.
	pub async fn raise(
		&self,
		instance_id: &str,
		event_id: &str,
		payload: serde_json::Value,
	) -> Result<RaiseOutcome, EngineError> {
		let _guard = self.lock(instance_id).await;
		let instance = self.load_running(instance_id).await?;
		let (mut instance, mut state) = self.replay_or_fail(instance).await?;
		let recorded = instance.history.len();
		let now = self.now_ms();

		let expired = expire_overdue(&mut instance, &mut state, now)?;
		let mut events = expired_events(instance_id, &expired);

		let previous = state.registration(event_id).map(|r| r.state);
		match previous {
			Some(RegistrationState::Waiting) => {
				append(
					&mut instance,
					&mut state,
					event_id,
					EventOutcome::Satisfied,
					now,
					Some(payload),
				)?;
				info!(instance_id, event_id, "Event is raised");
				events.push(InstanceEvent::EventSatisfied {
					instance_id: instance_id.to_string(),
					event_id: event_id.to_string(),
				});
			}
			Some(RegistrationState::Satisfied) | Some(RegistrationState::Expired) => {
				debug!(instance_id, event_id, "Duplicate raise ignored");
				events.push(InstanceEvent::DuplicateRaise {
					instance_id: instance_id.to_string(),
					event_id: event_id.to_string(),
				});
			}
			None => {
				warn!(instance_id, event_id, "Raise for an event the instance does not expect");
			}
		}

		let status = if instance.history.len() == recorded {
			events.into_iter().for_each(|event| self.publish(event));
			instance.status
		} else {
			self.commit(instance, &state, events).await?
		};

		Ok(match previous {
			Some(RegistrationState::Waiting) => RaiseOutcome::Satisfied { status },
			Some(RegistrationState::Satisfied) => RaiseOutcome::Duplicate,
			Some(RegistrationState::Expired) => RaiseOutcome::Expired { status },
			None => RaiseOutcome::UnknownEvent,
		})
	}

	/// Expires every registration whose deadline has passed.
	pub async fn tick(&self, instance_id: &str) -> Result<TickOutcome, EngineError> {
		let _guard = self.lock(instance_id).await;
		let instance = self.load_running(instance_id).await?;
		let (mut instance, mut state) = self.replay_or_fail(instance).await?;
		let now = self.now_ms();

		let expired = expire_overdue(&mut instance, &mut state, now)?;
		let status = if expired.is_empty() {
			instance.status
		} else {
			let events = expired_events(instance_id, &expired);
			self.commit(instance, &state, events).await?
		};

		Ok(TickOutcome {
			expired,
			status,
			next_deadline_ms: if status.is_terminal() {
				None
			} else {
				state.next_deadline_ms()
			},
		})
	}

	/// Fails a non-terminal instance.
	pub async fn cancel(&self, instance_id: &str, reason: &str) -> Result<InstanceStatus, EngineError> {
		let _guard = self.lock(instance_id).await;
		let mut instance = match self.inner.store.load(instance_id).await? {
			None => return Err(EngineError::not_found(instance_id, NotFoundReason::Unknown)),
			Some(instance) if instance.status.is_terminal() => {
				return Err(EngineError::not_found(
					instance_id,
					NotFoundReason::Terminal(instance.status),
				))
			}
			Some(instance) => instance,
		};

		warn!(instance_id, reason, "Instance is cancelled");
		instance.failure = Some(reason.to_string());
		self.finish(instance, InstanceStatus::Failed).await?;
		Ok(InstanceStatus::Failed)
	}

	/// Read-only snapshot; takes no instance lock.
	pub async fn get_status(&self, instance_id: &str) -> Result<StatusReport, EngineError> {
		let instance = self.instance(instance_id).await?;
		Ok(status_report(&instance))
	}

	pub async fn instance(&self, instance_id: &str) -> Result<WorkInstance, EngineError> {
		self.inner
			.store
			.load(instance_id)
			.await?
			.ok_or_else(|| EngineError::not_found(instance_id, NotFoundReason::Unknown))
	}

	/// Waits until the instance reaches a terminal status.
	pub async fn wait_for_terminal(
		&self,
		instance_id: &str,
		timeout: Duration,
	) -> Result<StatusReport, EngineError> {
		let mut events = self.inner.event_bus.subscribe();
		tokio::time::timeout(timeout, self.await_terminal(instance_id, &mut events))
			.await
			.map_err(|_| EngineError::WaitTimeout(instance_id.to_string()))?
	}

	async fn await_terminal(
		&self,
		instance_id: &str,
		events: &mut broadcast::Receiver<OrchestrationEvent>,
	) -> Result<StatusReport, EngineError> {
		loop {
			let report = self.get_status(instance_id).await?;
			if report.status.is_terminal() {
				return Ok(report);
			}

			loop {
				match events.recv().await {
					Ok(event) if event.terminal_status_of(instance_id).is_some() => break,
					Ok(_) => continue,
					// Missed events; re-read the record.
					Err(RecvError::Lagged(_)) => break,
					Err(RecvError::Closed) => {
						return Err(EngineError::WaitTimeout(instance_id.to_string()))
					}
				}
			}
		}
	}

	/// Replays every active instance and re-arms its timer.
	///
	/// Deadlines stay anchored to the persisted activation time, so time
	/// spent down counts against them.
	pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
		let mut report = RecoveryReport::default();

		for instance_id in self.inner.store.active_ids().await? {
			match self.resume(&instance_id).await {
				Ok(Resumed::Running) => report.resumed += 1,
				Ok(Resumed::Finished) => report.finished += 1,
				Ok(Resumed::Pending) => report.pending += 1,
				Err(EngineError::Fault { .. }) => report.faulted += 1,
				Err(e) => return Err(e),
			}
		}

		info!(
			resumed = report.resumed,
			finished = report.finished,
			pending = report.pending,
			faulted = report.faulted,
			"Engine recovery complete"
		);
		Ok(report)
	}

	/// Stops every deadline timer. Persisted state is untouched.
	pub fn shutdown(&self) {
		let cancelled = self.inner.timers.cancel_all();
		info!(cancelled, "Engine timers stopped");
	}

	async fn resume(&self, instance_id: &str) -> Result<Resumed, EngineError> {
		let _guard = self.lock(instance_id).await;
		let Some(instance) = self.inner.store.load_active(instance_id).await? else {
			return Ok(Resumed::Finished);
		};

		match instance.status {
			InstanceStatus::Pending => {
				warn!(instance_id, "Instance was never started, leaving it pending");
				Ok(Resumed::Pending)
			}
			InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::TimedOut => {
				self.inner.store.archive(&instance).await?;
				debug!(instance_id, status = %instance.status, "Archived terminal instance");
				Ok(Resumed::Finished)
			}
			InstanceStatus::Running => {
				let (mut instance, mut state) = self.replay_or_fail(instance).await?;
				info!(
					instance_id,
					satisfied = state.satisfied_count(),
					waiting = state.waiting_count(),
					"Instance is replayed"
				);

				let expired = expire_overdue(&mut instance, &mut state, self.now_ms())?;
				let status = if expired.is_empty() && replay::evaluate(&state).is_none() {
					instance.status
				} else {
					let events = expired_events(instance_id, &expired);
					self.commit(instance, &state, events).await?
				};

				if status.is_terminal() {
					Ok(Resumed::Finished)
				} else {
					self.schedule_timer(instance_id, state.next_deadline_ms());
					Ok(Resumed::Running)
				}
			}
		}
	}

	async fn lock(&self, instance_id: &str) -> InstanceGuard<'_> {
		let mutex = self
			.inner
			.locks
			.entry(instance_id.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();
		InstanceGuard {
			locks: &self.inner.locks,
			instance_id: instance_id.to_string(),
			guard: Some(mutex.lock_owned().await),
		}
	}

	async fn load_running(&self, instance_id: &str) -> Result<WorkInstance, EngineError> {
		let Some(instance) = self.inner.store.load(instance_id).await? else {
			return Err(EngineError::not_found(instance_id, NotFoundReason::Unknown));
		};
		match instance.status {
			InstanceStatus::Running => Ok(instance),
			InstanceStatus::Pending => Err(EngineError::not_found(
				instance_id,
				NotFoundReason::NotStarted,
			)),
			status => Err(EngineError::not_found(
				instance_id,
				NotFoundReason::Terminal(status),
			)),
		}
	}

	/// Replays history; an inconsistent log fails the instance.
	async fn replay_or_fail(
		&self,
		instance: WorkInstance,
	) -> Result<(WorkInstance, ReplayState), EngineError> {
		match replay::replay(&instance) {
			Ok(state) => Ok((instance, state)),
			Err(e) => {
				let instance_id = instance.id.clone();
				error!(instance_id = %instance_id, error = %e, "History cannot be replayed");
				let mut failed = instance;
				failed.failure = Some(e.to_string());
				self.finish(failed, InstanceStatus::Failed).await?;
				Err(EngineError::Fault {
					instance_id,
					reason: e.to_string(),
				})
			}
		}
	}

	/// Persists the instance, archiving it if the registrations are
	/// settled, then publishes `events`.
	async fn commit(
		&self,
		mut instance: WorkInstance,
		state: &ReplayState,
		events: Vec<InstanceEvent>,
	) -> Result<InstanceStatus, EngineError> {
		let terminal = replay::evaluate(state);
		match terminal {
			Some(status) => {
				instance.status = status;
				self.inner.store.archive(&instance).await?;
			}
			None => self.inner.store.save(&instance).await?,
		}

		events.into_iter().for_each(|event| self.publish(event));
		if terminal.is_some() {
			self.finished(&instance);
		}
		Ok(instance.status)
	}

	async fn finish(
		&self,
		mut instance: WorkInstance,
		status: InstanceStatus,
	) -> Result<(), EngineError> {
		instance.status = status;
		self.inner.store.archive(&instance).await?;
		self.finished(&instance);
		Ok(())
	}

	fn finished(&self, instance: &WorkInstance) {
		self.inner.timers.cancel(&instance.id);
		info!(instance_id = %instance.id, status = %instance.status, "Instance is finished");
		self.publish(InstanceEvent::Terminated {
			instance_id: instance.id.clone(),
			status: instance.status,
		});
	}

	fn publish(&self, event: InstanceEvent) {
		self.inner
			.event_bus
			.publish(OrchestrationEvent::Instance(event))
			.ok();
	}

	fn schedule_timer(&self, instance_id: &str, deadline_ms: Option<u64>) {
		let Some(deadline_ms) = deadline_ms else {
			return;
		};
		let engine = self.clone();
		let id = instance_id.to_string();
		let handle = tokio::spawn(async move { engine.run_timer(id, deadline_ms).await });
		self.inner.timers.replace(instance_id, handle);
	}

	async fn run_timer(self, instance_id: String, mut deadline_ms: u64) {
		loop {
			let delay = deadline_ms.saturating_sub(self.now_ms());
			tokio::time::sleep(Duration::from_millis(delay)).await;

			// Aborting this timer must not cut a sweep short.
			let engine = self.clone();
			let id = instance_id.clone();
			let sweep = tokio::spawn(async move { engine.tick(&id).await });

			match sweep.await {
				Ok(Ok(TickOutcome {
					next_deadline_ms: Some(next),
					..
				})) => deadline_ms = next,
				Ok(Ok(_)) => break,
				Ok(Err(e)) if e.is_retryable() => {
					warn!(instance_id = %instance_id, error = %e, "Deadline sweep failed, retrying");
					deadline_ms = self.now_ms() + TIMER_RETRY_DELAY_MS;
				}
				Ok(Err(e)) => {
					debug!(instance_id = %instance_id, error = %e, "Deadline timer stopped");
					break;
				}
				Err(e) => {
					error!(instance_id = %instance_id, error = %e, "Deadline sweep panicked");
					break;
				}
			}
		}
	}
}

#[async_trait]
impl EventSink for OrchestrationEngine {
	async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), DeliveryError> {
		match self
			.raise(
				&envelope.instance_id,
				&envelope.event_id,
				envelope.payload.clone(),
			)
			.await
		{
			Ok(_) => Ok(()),
			Err(e) if e.is_retryable() => Err(DeliveryError::Retryable(e.to_string())),
			Err(e) => Err(DeliveryError::Rejected(e.to_string())),
		}
	}
}

fn append(
	instance: &mut WorkInstance,
	state: &mut ReplayState,
	event_id: &str,
	outcome: EventOutcome,
	now_ms: u64,
	payload: Option<serde_json::Value>,
) -> Result<(), EngineError> {
	let entry = replay::record(state, event_id, outcome, now_ms, payload);
	state.apply(&entry).map_err(|e| EngineError::Fault {
		instance_id: instance.id.clone(),
		reason: e.to_string(),
	})?;
	instance.history.push(entry);
	Ok(())
}

fn expire_overdue(
	instance: &mut WorkInstance,
	state: &mut ReplayState,
	now_ms: u64,
) -> Result<Vec<String>, EngineError> {
	let overdue = state.overdue(now_ms);
	for event_id in &overdue {
		append(instance, state, event_id, EventOutcome::Expired, now_ms, None)?;
		warn!(instance_id = %instance.id, event_id = %event_id, "Event expired");
	}
	Ok(overdue)
}

fn expired_events(instance_id: &str, expired: &[String]) -> Vec<InstanceEvent> {
	expired
		.iter()
		.map(|event_id| InstanceEvent::EventExpired {
			instance_id: instance_id.to_string(),
			event_id: event_id.clone(),
		})
		.collect()
}

fn status_report(instance: &WorkInstance) -> StatusReport {
	let count = |outcome: EventOutcome| {
		instance
			.history
			.iter()
			.filter(|entry| entry.outcome == outcome)
			.count()
	};

	StatusReport {
		instance_id: instance.id.clone(),
		status: instance.status,
		satisfied_count: count(EventOutcome::Satisfied),
		expired_count: count(EventOutcome::Expired),
		total_count: instance.expected_event_ids.len(),
	}
}
