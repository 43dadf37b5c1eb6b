// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Opaque key-value blob storage for persisted pipeline state.
//!
//! The pipeline stores each collection as one text blob under one key and
//! rewrites the whole blob on every change. Any backend that can get, set and
//! remove a string by key will do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;

/// Key-value storage for serialized pipeline state.
#[async_trait]
pub trait BlobStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
	async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
	async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store. Clones share the same contents, which lets tests
/// simulate a process restart by handing the store to a new client.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
	inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBlobStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		Ok(self.inner.lock().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		self
			.inner
			.lock()
			.await
			.insert(key.to_string(), value.to_string());
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), StoreError> {
		self.inner.lock().await.remove(key);
		Ok(())
	}
}

/// One file per key inside a directory. Writes go to a temporary file that
/// is renamed over the target, so a crash mid-write leaves the previous
/// value intact.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
	dir: PathBuf,
}

impl FileBlobStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	/// Uses `$XDG_STATE_HOME/tally/analytics`, falling back to the data dir.
	pub fn from_xdg() -> Result<Self, StoreError> {
		let state_dir = dirs::state_dir()
			.or_else(|| dirs::data_dir().map(|d| d.join("state")))
			.ok_or_else(|| {
				StoreError::Io(std::io::Error::new(
					std::io::ErrorKind::NotFound,
					"could not determine XDG state directory",
				))
			})?;

		let dir = state_dir.join("tally").join("analytics");
		std::fs::create_dir_all(&dir)?;

		info!(dir = %dir.display(), "initialized analytics blob store");

		Ok(Self { dir })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
		let valid = !key.is_empty()
			&& !key.starts_with('.')
			&& key
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
		if !valid {
			return Err(StoreError::InvalidKey(key.to_string()));
		}
		Ok(self.dir.join(format!("{key}.json")))
	}
}

#[async_trait]
impl BlobStore for FileBlobStore {
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		let path = self.path_for(key)?;
		match tokio::fs::read_to_string(&path).await {
			Ok(contents) => Ok(Some(contents)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "blob not found");
				Ok(None)
			}
			Err(e) => Err(e.into()),
		}
	}

	async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let path = self.path_for(key)?;
		tokio::fs::create_dir_all(&self.dir).await?;

		let tmp_path = path.with_extension("json.tmp");
		tokio::fs::write(&tmp_path, value).await?;
		tokio::fs::rename(&tmp_path, &path).await?;

		debug!(path = %path.display(), bytes = value.len(), "wrote blob");
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), StoreError> {
		let path = self.path_for(key)?;
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}
