// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery metadata wrapped around events while they wait or after they fail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{AnalyticsEvent, EventId};

/// An event waiting in the live queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
	pub event: AnalyticsEvent,
	#[serde(default)]
	pub retry_count: u32,
	pub first_queued_at: DateTime<Utc>,
}

impl QueueEntry {
	pub fn new(event: AnalyticsEvent) -> Self {
		Self {
			event,
			retry_count: 0,
			first_queued_at: Utc::now(),
		}
	}

	pub fn event_id(&self) -> EventId {
		self.event.event_id
	}
}

/// Why an event left the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
	/// Every queue-level attempt failed with a retryable outcome.
	RetriesExhausted,
	/// The collector refused the batch; retrying cannot help.
	Rejected { status_code: Option<u16> },
}

impl fmt::Display for FailureReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FailureReason::RetriesExhausted => f.write_str("retries_exhausted"),
			FailureReason::Rejected {
				status_code: Some(status),
			} => write!(f, "rejected_{status}"),
			FailureReason::Rejected { status_code: None } => f.write_str("rejected"),
		}
	}
}

/// An event that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
	pub event: AnalyticsEvent,
	pub failure_reason: FailureReason,
	pub failed_at: DateTime<Utc>,
	pub retry_count: u32,
	pub last_error: Option<String>,
}

impl DeadLetterEntry {
	pub fn new(
		event: AnalyticsEvent,
		failure_reason: FailureReason,
		retry_count: u32,
		last_error: Option<String>,
	) -> Self {
		Self {
			event,
			failure_reason,
			failed_at: Utc::now(),
			retry_count,
			last_error,
		}
	}
}
