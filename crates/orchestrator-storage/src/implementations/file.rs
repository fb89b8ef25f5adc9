//! File-based storage backend.
//!
//! Each namespace is a directory below the base path and each id a JSON
//! file inside it. Writes go to a uniquely named temp file that is then
//! renamed over the target, so readers never see a partial record.
//!
//! A TTL is kept in a sibling `<id>.expires` file holding the expiry in
//! epoch milliseconds. Expired records are removed lazily on read and list.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const EXTENSION: &str = "json";
const EXPIRY_EXTENSION: &str = "expires";

/// File-based storage implementation.
pub struct FileStorage {
	/// Base directory path for storing files.
	base_path: PathBuf,
}

impl FileStorage {
	/// Creates a new FileStorage instance with the specified base path.
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}

	fn namespace_dir(&self, namespace: &str) -> PathBuf {
		self.base_path.join(sanitize(namespace))
	}

	fn get_file_path(&self, namespace: &str, id: &str) -> PathBuf {
		self.namespace_dir(namespace)
			.join(format!("{}.{}", sanitize(id), EXTENSION))
	}

	fn get_expiry_path(&self, namespace: &str, id: &str) -> PathBuf {
		self.namespace_dir(namespace)
			.join(format!("{}.{}", sanitize(id), EXPIRY_EXTENSION))
	}

	/// Deletes the record if its TTL has passed. Returns true when it did.
	async fn purge_if_expired(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		let expires_at_ms = match fs::read_to_string(self.get_expiry_path(namespace, id)).await {
			Ok(content) => content.trim().parse::<i64>().map_err(|e| {
				StorageError::Backend(format!("Corrupt expiry for {}/{}: {}", namespace, id, e))
			})?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		if now_ms() < expires_at_ms {
			return Ok(false);
		}
		self.delete(namespace, id).await?;
		Ok(true)
	}
}

fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
	match fs::remove_file(path).await {
		Ok(_) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(StorageError::Backend(e.to_string())),
	}
}

/// Writes to a uniquely named temp file, then renames it over `path`.
async fn write_atomic(path: &Path, value: Vec<u8>) -> Result<(), StorageError> {
	// Two writers of the same key must not share a temp file.
	let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
	fs::write(&temp_path, value)
		.await
		.map_err(|e| StorageError::Backend(e.to_string()))?;

	fs::rename(&temp_path, path)
		.await
		.map_err(|e| StorageError::Backend(e.to_string()))
}

fn sanitize(segment: &str) -> String {
	segment.replace(['/', '\\', ':'], "_")
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, namespace: &str, id: &str) -> Result<Vec<u8>, StorageError> {
		if self.purge_if_expired(namespace, id).await? {
			return Err(StorageError::NotFound);
		}
		let path = self.get_file_path(namespace, id);

		match fs::read(&path).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn set_bytes(
		&self,
		namespace: &str,
		id: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		fs::create_dir_all(self.namespace_dir(namespace))
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		write_atomic(&self.get_file_path(namespace, id), value).await?;

		let expiry_path = self.get_expiry_path(namespace, id);
		match ttl {
			Some(ttl) => {
				let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
				let expires_at_ms = now_ms().saturating_add(ttl_ms);
				write_atomic(&expiry_path, expires_at_ms.to_string().into_bytes()).await
			}
			None => remove_if_present(&expiry_path).await,
		}
	}

	async fn delete(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		remove_if_present(&self.get_file_path(namespace, id)).await?;
		remove_if_present(&self.get_expiry_path(namespace, id)).await
	}

	async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		if self.purge_if_expired(namespace, id).await? {
			return Ok(false);
		}
		fs::try_exists(self.get_file_path(namespace, id))
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}

	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let mut entries = match fs::read_dir(self.namespace_dir(namespace)).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut ids = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
				continue;
			}
			if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
				if !self.purge_if_expired(namespace, stem).await? {
					ids.push(stem.to_string());
				}
			}
		}
		ids.sort();
		Ok(ids)
	}
}

/// Factory function to create a storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Box<dyn StorageInterface> {
	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage")
		.to_string();

	Box::new(FileStorage::new(PathBuf::from(storage_path)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_file_storage_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("instances", "wf-1", b"{}".to_vec(), None)
			.await
			.unwrap();

		assert_eq!(storage.get_bytes("instances", "wf-1").await.unwrap(), b"{}");
		assert!(storage.exists("instances", "wf-1").await.unwrap());
		assert!(matches!(
			storage.get_bytes("instances", "missing").await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_overwrite_leaves_no_temp_files() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		for value in [b"1".to_vec(), b"2".to_vec()] {
			storage
				.set_bytes("instances", "wf-1", value, None)
				.await
				.unwrap();
		}

		assert_eq!(storage.get_bytes("instances", "wf-1").await.unwrap(), b"2");
		let files = std::fs::read_dir(dir.path().join("instances"))
			.unwrap()
			.count();
		assert_eq!(files, 1);
	}

	#[tokio::test]
	async fn test_list_and_delete() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		assert!(storage.list_ids("events_outbox").await.unwrap().is_empty());

		for id in ["wf.b", "wf.a"] {
			storage
				.set_bytes("events_outbox", id, b"{}".to_vec(), None)
				.await
				.unwrap();
		}
		assert_eq!(
			storage.list_ids("events_outbox").await.unwrap(),
			vec!["wf.a", "wf.b"]
		);

		storage.delete("events_outbox", "wf.a").await.unwrap();
		storage.delete("events_outbox", "wf.a").await.unwrap();
		assert_eq!(storage.list_ids("events_outbox").await.unwrap(), vec!["wf.b"]);
	}

	#[tokio::test]
	async fn test_expired_records_are_dropped() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("events_outbox", "wf.a", b"{}".to_vec(), Some(Duration::ZERO))
			.await
			.unwrap();
		storage
			.set_bytes(
				"events_outbox",
				"wf.b",
				b"{}".to_vec(),
				Some(Duration::from_secs(3600)),
			)
			.await
			.unwrap();

		assert_eq!(storage.list_ids("events_outbox").await.unwrap(), vec!["wf.b"]);
		assert!(matches!(
			storage.get_bytes("events_outbox", "wf.a").await,
			Err(StorageError::NotFound)
		));
		assert!(!storage.exists("events_outbox", "wf.a").await.unwrap());
		assert_eq!(storage.get_bytes("events_outbox", "wf.b").await.unwrap(), b"{}");

		// Only the live record and its expiry file remain.
		let files = std::fs::read_dir(dir.path().join("events_outbox"))
			.unwrap()
			.count();
		assert_eq!(files, 2);
	}

	#[tokio::test]
	async fn test_rewrite_without_ttl_clears_expiry() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("instances", "wf-1", b"1".to_vec(), Some(Duration::ZERO))
			.await
			.unwrap();
		storage
			.set_bytes("instances", "wf-1", b"2".to_vec(), None)
			.await
			.unwrap();

		assert_eq!(storage.get_bytes("instances", "wf-1").await.unwrap(), b"2");
	}

	#[test]
	fn test_factory_reads_storage_path() {
		let config: toml::Value = toml::from_str("storage_path = \"/tmp/orchestrator\"").unwrap();
		// Construction only; nothing touches the filesystem yet.
		let _storage = create_storage(&config);
	}
}
