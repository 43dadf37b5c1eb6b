// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Analytics events and their closed property schema.
//!
//! Every event type declares the property keys it may carry. Values are
//! scalars only, so an event serializes to a flat JSON object that the
//! collector can ingest without a per-event schema lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Longest property key accepted.
pub const MAX_PROP_KEY_LEN: usize = 64;
/// Longest string property value accepted, in bytes.
pub const MAX_PROP_STRING_LEN: usize = 256;

/// Unique identifier for an event.
///
/// UUIDv7, so identifiers sort by creation time. The id is serialized with
/// the event and never regenerated on load, which lets the collector
/// deduplicate at-least-once deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		let uuid7_val = uuid7::uuid7();
		Self(Uuid::from_bytes(*uuid7_val.as_bytes()))
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Identifier for one process lifetime of the host app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// The known event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
	AppOpened,
	AppBackgrounded,
	ScreenViewed,
	ListCreated,
	ListItemCompleted,
	NoteCreated,
	CalendarEventCreated,
	SyncFailed,
}

impl EventName {
	pub const ALL: [EventName; 8] = [
		EventName::AppOpened,
		EventName::AppBackgrounded,
		EventName::ScreenViewed,
		EventName::ListCreated,
		EventName::ListItemCompleted,
		EventName::NoteCreated,
		EventName::CalendarEventCreated,
		EventName::SyncFailed,
	];

	/// Wire name, identical to the serialized form.
	pub fn as_str(&self) -> &'static str {
		match self {
			EventName::AppOpened => "app_opened",
			EventName::AppBackgrounded => "app_backgrounded",
			EventName::ScreenViewed => "screen_viewed",
			EventName::ListCreated => "list_created",
			EventName::ListItemCompleted => "list_item_completed",
			EventName::NoteCreated => "note_created",
			EventName::CalendarEventCreated => "calendar_event_created",
			EventName::SyncFailed => "sync_failed",
		}
	}

	/// Property keys this event type may carry.
	pub fn allowed_props(&self) -> &'static [&'static str] {
		match self {
			EventName::AppOpened => &["install_age_bucket", "network_state", "cold_start"],
			EventName::AppBackgrounded => &["session_duration_bucket"],
			EventName::ScreenViewed => &["screen_name", "previous_screen"],
			EventName::ListCreated => &["item_count", "source"],
			EventName::ListItemCompleted => &["list_size_bucket"],
			EventName::NoteCreated => &["char_count_bucket", "has_attachment"],
			EventName::CalendarEventCreated => &["has_reminder", "duration_bucket"],
			EventName::SyncFailed => &["error_code", "network_state"],
		}
	}

	/// Checks `props` against this event type's schema.
	pub fn validate(&self, props: &Props) -> Result<()> {
		let allowed = self.allowed_props();
		for (key, value) in props.iter() {
			if key.is_empty() || key.len() > MAX_PROP_KEY_LEN {
				return Err(CoreError::InvalidPropertyKey {
					max: MAX_PROP_KEY_LEN,
				});
			}
			if !allowed.contains(&key.as_str()) {
				return Err(CoreError::PropertyNotAllowed {
					event: *self,
					key: key.clone(),
				});
			}
			match value {
				PropValue::Text(s) if s.len() > MAX_PROP_STRING_LEN => {
					return Err(CoreError::PropertyTooLong {
						key: key.clone(),
						max: MAX_PROP_STRING_LEN,
					});
				}
				PropValue::Float(f) if !f.is_finite() => {
					return Err(CoreError::NonFiniteNumber { key: key.clone() });
				}
				_ => {}
			}
		}
		Ok(())
	}
}

impl fmt::Display for EventName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventName {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self> {
		EventName::ALL
			.iter()
			.copied()
			.find(|name| name.as_str() == s)
			.ok_or_else(|| CoreError::UnknownEventName(s.to_string()))
	}
}

/// A scalar property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
}

impl From<bool> for PropValue {
	fn from(v: bool) -> Self {
		PropValue::Bool(v)
	}
}

impl From<i64> for PropValue {
	fn from(v: i64) -> Self {
		PropValue::Int(v)
	}
}

impl From<i32> for PropValue {
	fn from(v: i32) -> Self {
		PropValue::Int(i64::from(v))
	}
}

impl From<u32> for PropValue {
	fn from(v: u32) -> Self {
		PropValue::Int(i64::from(v))
	}
}

impl From<f64> for PropValue {
	fn from(v: f64) -> Self {
		PropValue::Float(v)
	}
}

impl From<&str> for PropValue {
	fn from(v: &str) -> Self {
		PropValue::Text(v.to_string())
	}
}

impl From<String> for PropValue {
	fn from(v: String) -> Self {
		PropValue::Text(v)
	}
}

/// Event properties, keyed and ordered by name.
///
/// ```
/// use tally_analytics_core::Props;
///
/// let props = Props::new()
///     .insert("screen_name", "calendar")
///     .insert("item_count", 3);
/// assert_eq!(props.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props {
	inner: BTreeMap<String, PropValue>,
}

impl Props {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a property, replacing any previous value for `key`.
	pub fn insert<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<PropValue>,
	{
		self.inner.insert(key.into(), value.into());
		self
	}

	pub fn get(&self, key: &str) -> Option<&PropValue> {
		self.inner.get(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &PropValue)> {
		self.inner.iter()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}
}

/// An immutable analytics fact, created once when a producer logs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
	pub event_id: EventId,
	pub event_name: EventName,
	pub occurred_at: DateTime<Utc>,
	pub session_id: SessionId,
	#[serde(default)]
	pub props: Props,
	pub app_version: String,
	pub platform: String,
}

impl AnalyticsEvent {
	/// Stamps a new event after validating `props` against the event schema.
	pub fn new(
		event_name: EventName,
		props: Props,
		session_id: SessionId,
		app_version: impl Into<String>,
		platform: impl Into<String>,
	) -> Result<Self> {
		event_name.validate(&props)?;

		Ok(Self {
			event_id: EventId::new(),
			event_name,
			occurred_at: Utc::now(),
			session_id,
			props,
			app_version: app_version.into(),
			platform: platform.into(),
		})
	}
}
