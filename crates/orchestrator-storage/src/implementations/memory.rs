//! In-memory storage backend.
//!
//! Cloning a [`MemoryStorage`] shares the underlying map, which lets several
//! engines in one process (or one test) observe the same "durable" state.
//! TTLs are enforced lazily on read and list.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl Entry {
	fn is_expired(&self, now: Instant) -> bool {
		self.expires_at.is_some_and(|at| now >= at)
	}
}

/// In-memory storage implementation
#[derive(Clone, Default)]
pub struct MemoryStorage {
	data: Arc<DashMap<(String, String), Entry>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	fn key(namespace: &str, id: &str) -> (String, String) {
		(namespace.to_string(), id.to_string())
	}

	fn live_entry(&self, namespace: &str, id: &str) -> Option<Entry> {
		let key = Self::key(namespace, id);
		let entry = self.data.get(&key)?.clone();
		if entry.is_expired(Instant::now()) {
			self.data.remove(&key);
			return None;
		}
		Some(entry)
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, namespace: &str, id: &str) -> Result<Vec<u8>, StorageError> {
		self.live_entry(namespace, id)
			.map(|entry| entry.value)
			.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		namespace: &str,
		id: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let expires_at = ttl.map(|ttl| Instant::now() + ttl);
		self.data
			.insert(Self::key(namespace, id), Entry { value, expires_at });
		Ok(())
	}

	async fn delete(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.data.remove(&Self::key(namespace, id));
		Ok(())
	}

	async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		Ok(self.live_entry(namespace, id).is_some())
	}

	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let now = Instant::now();
		let mut ids: Vec<String> = self
			.data
			.iter()
			.filter(|entry| entry.key().0 == namespace && !entry.value().is_expired(now))
			.map(|entry| entry.key().1.clone())
			.collect();
		ids.sort();
		Ok(ids)
	}
}

/// Factory function matching the file backend's signature. The memory
/// backend takes no configuration.
pub fn create_storage(_config: &toml::Value) -> Box<dyn StorageInterface> {
	Box::new(MemoryStorage::new())
}
