// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for Tally analytics delivery.
//!
//! This crate holds the data model shared by the delivery pipeline:
//!
//! - [`AnalyticsEvent`]: an immutable fact logged by a producer
//! - [`EventName`]: the closed set of known event types and their allowed properties
//! - [`QueueEntry`]: an event waiting for delivery, with its retry counter
//! - [`DeadLetterEntry`]: an event permanently removed from the retry path
//!
//! # Example
//!
//! ```
//! use tally_analytics_core::{AnalyticsEvent, EventName, Props, SessionId};
//!
//! let props = Props::new()
//!     .insert("install_age_bucket", "0d")
//!     .insert("network_state", "offline");
//!
//! let event = AnalyticsEvent::new(
//!     EventName::AppOpened,
//!     props,
//!     SessionId::new(),
//!     "1.4.0",
//!     "ios",
//! ).unwrap();
//!
//! assert_eq!(event.event_name.as_str(), "app_opened");
//! ```

pub mod entry;
pub mod error;
pub mod event;

pub use entry::{DeadLetterEntry, FailureReason, QueueEntry};
pub use error::{CoreError, Result};
pub use event::{
	AnalyticsEvent, EventId, EventName, PropValue, Props, SessionId, MAX_PROP_KEY_LEN,
	MAX_PROP_STRING_LEN,
};
