// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

use crate::event::EventName;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
	#[error("unknown event name: {0}")]
	UnknownEventName(String),

	#[error("property '{key}' is not allowed on event '{event}'")]
	PropertyNotAllowed { event: EventName, key: String },

	#[error("property key is empty or longer than {max} bytes")]
	InvalidPropertyKey { max: usize },

	#[error("property '{key}' exceeds {max} bytes")]
	PropertyTooLong { key: String, max: usize },

	#[error("property '{key}' is not a finite number")]
	NonFiniteNumber { key: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
