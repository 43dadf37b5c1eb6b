// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Dead-letter queue: events that left the retry path for good.
//!
//! Nothing in here resubmits automatically. Callers inspect the entries and
//! decide whether to re-inject them, which keeps a persistently failing
//! event from spinning in a tight loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_analytics_core::{AnalyticsEvent, DeadLetterEntry, EventId, EventName, FailureReason};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::BlobStore;

/// Aggregate view of the dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterStats {
	pub size: usize,
	pub max_size: usize,
	/// Entries dropped to respect `max_size` since this instance was created.
	pub total_evicted: u64,
	pub oldest_failed_at: Option<DateTime<Utc>>,
	pub newest_failed_at: Option<DateTime<Utc>>,
	pub by_failure_reason: BTreeMap<FailureReason, usize>,
	pub by_event_name: BTreeMap<EventName, usize>,
}

/// Bounded store of [`DeadLetterEntry`] values, persisted as one blob.
pub struct DeadLetterQueue {
	store: Arc<dyn BlobStore>,
	key: String,
	max_size: usize,
	entries: VecDeque<DeadLetterEntry>,
	total_evicted: u64,
}

impl DeadLetterQueue {
	pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, max_size: usize) -> Self {
		Self {
			store,
			key: key.into(),
			max_size: max_size.max(1),
			entries: VecDeque::new(),
			total_evicted: 0,
		}
	}

	/// Replaces the in-memory contents with the persisted blob. Missing or
	/// corrupt blobs yield an empty queue.
	pub async fn load(&mut self) -> Result<usize, StoreError> {
		let Some(blob) = self.store.get(&self.key).await? else {
			self.entries.clear();
			return Ok(0);
		};

		self.entries = match serde_json::from_str::<Vec<DeadLetterEntry>>(&blob) {
			Ok(entries) => entries.into(),
			Err(e) => {
				warn!(key = %self.key, error = %e, "persisted dead-letter queue is corrupt, starting empty");
				VecDeque::new()
			}
		};
		self.evict_overflow();

		debug!(key = %self.key, count = self.entries.len(), "loaded dead-letter queue");
		Ok(self.entries.len())
	}

	pub async fn persist(&self) -> Result<(), StoreError> {
		let blob = serde_json::to_string(&self.entries)?;
		self.store.set(&self.key, &blob).await?;
		debug!(key = %self.key, count = self.entries.len(), "persisted dead-letter queue");
		Ok(())
	}

	/// Appends a dead letter, evicting the oldest entries past `max_size`.
	pub fn add(
		&mut self,
		event: AnalyticsEvent,
		failure_reason: FailureReason,
		retry_count: u32,
		last_error: Option<String>,
	) -> Vec<DeadLetterEntry> {
		warn!(
			event_id = %event.event_id,
			event_name = %event.event_name,
			failure_reason = %failure_reason,
			retry_count,
			last_error = last_error.as_deref().unwrap_or(""),
			"analytics event dead-lettered"
		);
		self
			.entries
			.push_back(DeadLetterEntry::new(event, failure_reason, retry_count, last_error));
		self.evict_overflow()
	}

	pub fn get_all(&self) -> Vec<DeadLetterEntry> {
		self.entries.iter().cloned().collect()
	}

	pub fn get_by_event_name(&self, event_name: EventName) -> Vec<DeadLetterEntry> {
		self
			.entries
			.iter()
			.filter(|e| e.event.event_name == event_name)
			.cloned()
			.collect()
	}

	pub fn get_by_failure_reason(&self, reason: &FailureReason) -> Vec<DeadLetterEntry> {
		self
			.entries
			.iter()
			.filter(|e| &e.failure_reason == reason)
			.cloned()
			.collect()
	}

	/// Removes the entry at `index` (oldest is 0) and hands its event back.
	pub fn retry(&mut self, index: usize) -> Option<AnalyticsEvent> {
		let entry = self.entries.remove(index)?;
		info!(event_id = %entry.event.event_id, "dead-lettered event released for retry");
		Some(entry.event)
	}

	/// Drains every event, oldest first.
	pub fn retry_all(&mut self) -> Vec<AnalyticsEvent> {
		let events: Vec<_> = self.entries.drain(..).map(|e| e.event).collect();
		if !events.is_empty() {
			info!(count = events.len(), "dead-letter queue drained for retry");
		}
		events
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn contains(&self, id: &EventId) -> bool {
		self.entries.iter().any(|e| &e.event.event_id == id)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn get_stats(&self) -> DeadLetterStats {
		let mut by_failure_reason = BTreeMap::new();
		let mut by_event_name = BTreeMap::new();
		for entry in &self.entries {
			*by_failure_reason.entry(entry.failure_reason).or_insert(0) += 1;
			*by_event_name.entry(entry.event.event_name).or_insert(0) += 1;
		}

		DeadLetterStats {
			size: self.entries.len(),
			max_size: self.max_size,
			total_evicted: self.total_evicted,
			oldest_failed_at: self.entries.iter().map(|e| e.failed_at).min(),
			newest_failed_at: self.entries.iter().map(|e| e.failed_at).max(),
			by_failure_reason,
			by_event_name,
		}
	}

	fn evict_overflow(&mut self) -> Vec<DeadLetterEntry> {
		let mut evicted = Vec::new();
		while self.entries.len() > self.max_size {
			if let Some(dropped) = self.entries.pop_front() {
				self.total_evicted += 1;
				warn!(
					event_id = %dropped.event.event_id,
					event_name = %dropped.event.event_name,
					failure_reason = %dropped.failure_reason,
					max_dlq_size = self.max_size,
					"evicted dead-lettered event due to capacity"
				);
				evicted.push(dropped);
			}
		}
		evicted
	}
}
