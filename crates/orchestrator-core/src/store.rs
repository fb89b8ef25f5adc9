// orchestrator-core/src/store.rs

use orchestrator_storage::{StorageError, StorageService};
use orchestrator_types::WorkInstance;
use std::sync::Arc;

const ACTIVE_NAMESPACE: &str = "instances";
const ARCHIVE_NAMESPACE: &str = "archived_instances";

/// Typed access to instance records.
///
/// Non-terminal instances live in the active namespace; terminal ones are
/// moved to the archive so recovery only scans work that can still change.
#[derive(Clone)]
pub struct InstanceStore {
	storage: Arc<StorageService>,
}

impl InstanceStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Looks up an instance, active first, then archived.
	pub async fn load(&self, instance_id: &str) -> Result<Option<WorkInstance>, StorageError> {
		if let Some(instance) = self.load_active(instance_id).await? {
			return Ok(Some(instance));
		}
		self.storage.find(ARCHIVE_NAMESPACE, instance_id).await
	}

	pub async fn load_active(
		&self,
		instance_id: &str,
	) -> Result<Option<WorkInstance>, StorageError> {
		self.storage.find(ACTIVE_NAMESPACE, instance_id).await
	}

	pub async fn save(&self, instance: &WorkInstance) -> Result<(), StorageError> {
		self.storage
			.store(ACTIVE_NAMESPACE, &instance.id, instance)
			.await
	}

	/// Writes the archived copy before dropping the active one, so a crash
	/// in between leaves a terminal record in the active namespace that
	/// recovery finishes archiving.
	pub async fn archive(&self, instance: &WorkInstance) -> Result<(), StorageError> {
		self.storage
			.store(ARCHIVE_NAMESPACE, &instance.id, instance)
			.await?;
		match self.storage.remove(ACTIVE_NAMESPACE, &instance.id).await {
			Ok(()) | Err(StorageError::NotFound) => Ok(()),
			Err(e) => Err(e),
		}
	}

	pub async fn active_ids(&self) -> Result<Vec<String>, StorageError> {
		self.storage.list(ACTIVE_NAMESPACE).await
	}
}
