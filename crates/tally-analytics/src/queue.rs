// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable FIFO of events waiting for delivery.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_analytics_core::{EventId, QueueEntry};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::BlobStore;

/// Snapshot of the live queue for health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
	pub size: usize,
	/// Number of entries per retry count.
	pub retry_histogram: BTreeMap<u32, usize>,
	pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Bounded, ordered queue persisted as a single blob.
///
/// Entries are kept oldest first. When the queue is full the oldest entries
/// are evicted, and each eviction is logged because it is data loss.
pub struct PersistentQueue {
	store: Arc<dyn BlobStore>,
	key: String,
	max_size: usize,
	entries: VecDeque<QueueEntry>,
}

impl PersistentQueue {
	pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, max_size: usize) -> Self {
		Self {
			store,
			key: key.into(),
			max_size: max_size.max(1),
			entries: VecDeque::new(),
		}
	}

	/// Replaces the in-memory contents with the persisted blob.
	///
	/// A missing blob yields an empty queue. A blob that does not parse is
	/// logged and treated as empty; store I/O errors are returned and leave
	/// the in-memory queue untouched.
	pub async fn load(&mut self) -> Result<usize, StoreError> {
		let Some(blob) = self.store.get(&self.key).await? else {
			debug!(key = %self.key, "no persisted queue, starting empty");
			self.entries.clear();
			return Ok(0);
		};

		let loaded: Vec<QueueEntry> = match serde_json::from_str(&blob) {
			Ok(entries) => entries,
			Err(e) => {
				warn!(key = %self.key, error = %e, "persisted queue is corrupt, starting empty");
				Vec::new()
			}
		};

		let mut seen = HashSet::new();
		self.entries = loaded
			.into_iter()
			.filter(|entry| seen.insert(entry.event_id()))
			.collect();
		self.evict_overflow();

		debug!(key = %self.key, count = self.entries.len(), "loaded persisted queue");
		Ok(self.entries.len())
	}

	/// Writes the whole queue to the blob store.
	pub async fn persist(&self) -> Result<(), StoreError> {
		let blob = serde_json::to_string(&self.entries)?;
		self.store.set(&self.key, &blob).await?;
		debug!(key = %self.key, count = self.entries.len(), "persisted queue");
		Ok(())
	}

	/// Appends an entry, returning whatever had to be evicted to make room.
	pub fn push(&mut self, entry: QueueEntry) -> Vec<QueueEntry> {
		self.entries.push_back(entry);
		self.evict_overflow()
	}

	/// Clones up to `max` of the oldest entries.
	pub fn peek_batch(&self, max: usize) -> Vec<QueueEntry> {
		self.entries.iter().take(max).cloned().collect()
	}

	/// Removes the entries with the given ids, returning the ones found.
	pub fn remove(&mut self, ids: &[EventId]) -> Vec<QueueEntry> {
		let ids: HashSet<&EventId> = ids.iter().collect();
		let (removed, kept): (Vec<_>, Vec<_>) = self
			.entries
			.drain(..)
			.partition(|entry| ids.contains(&entry.event.event_id));
		self.entries = kept.into();
		removed
	}

	/// Counts one failed delivery against each listed entry. Entries whose
	/// retry count reaches `max_retries` are removed and returned.
	pub fn increment_retries(&mut self, ids: &[EventId], max_retries: u32) -> Vec<QueueEntry> {
		let ids: HashSet<&EventId> = ids.iter().collect();
		for entry in self.entries.iter_mut() {
			if ids.contains(&entry.event.event_id) {
				entry.retry_count = entry.retry_count.saturating_add(1);
			}
		}
		self.drain_exhausted(max_retries)
	}

	/// Removes and returns every entry with `retry_count >= max_retries`.
	pub fn drain_exhausted(&mut self, max_retries: u32) -> Vec<QueueEntry> {
		let (exhausted, kept): (Vec<_>, Vec<_>) = self
			.entries
			.drain(..)
			.partition(|entry| entry.retry_count >= max_retries);
		self.entries = kept.into();
		exhausted
	}

	pub fn contains(&self, id: &EventId) -> bool {
		self.entries.iter().any(|entry| &entry.event.event_id == id)
	}

	pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
		self.entries.iter()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn max_size(&self) -> usize {
		self.max_size
	}

	pub fn stats(&self) -> QueueStats {
		let mut retry_histogram = BTreeMap::new();
		for entry in &self.entries {
			*retry_histogram.entry(entry.retry_count).or_insert(0) += 1;
		}
		QueueStats {
			size: self.entries.len(),
			retry_histogram,
			oldest_queued_at: self.entries.iter().map(|e| e.first_queued_at).min(),
		}
	}

	fn evict_overflow(&mut self) -> Vec<QueueEntry> {
		let mut evicted = Vec::new();
		while self.entries.len() > self.max_size {
			if let Some(dropped) = self.entries.pop_front() {
				warn!(
					event_id = %dropped.event.event_id,
					event_name = %dropped.event.event_name,
					retry_count = dropped.retry_count,
					max_queue_size = self.max_size,
					"dropped analytics event due to queue overflow"
				);
				evicted.push(dropped);
			}
		}
		evicted
	}
}
