// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the analytics delivery pipeline.

use tally_analytics_config::ConfigError;
use tally_common_http::{is_retryable_status, RetryableError};
use thiserror::Error;

/// Client-facing errors. `log()` never returns these; they surface only from
/// construction and lifecycle calls.
#[derive(Debug, Error)]
pub enum AnalyticsError {
	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,

	/// Configuration was rejected at build time.
	#[error("invalid configuration: {0}")]
	InvalidConfig(#[from] ConfigError),

	/// HTTP client could not be constructed.
	#[error("HTTP client setup failed: {0}")]
	HttpClient(#[source] reqwest::Error),

	/// Persisted state could not be read or written.
	#[error("store error: {0}")]
	Store(#[from] StoreError),
}

/// Blob store failures.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("invalid store key: {0}")]
	InvalidKey(String),
}

/// A single delivery attempt failure, before classification.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("network error: {0}")]
	Network(#[from] reqwest::Error),

	#[error("collector responded with status {status}")]
	Status { status: u16, body: String },

	#[error("failed to encode batch: {0}")]
	Encode(#[source] serde_json::Error),
}

impl TransportError {
	pub fn status_code(&self) -> Option<u16> {
		match self {
			TransportError::Status { status, .. } => Some(*status),
			TransportError::Network(e) => e.status().map(|s| s.as_u16()),
			TransportError::Encode(_) => None,
		}
	}
}

impl RetryableError for TransportError {
	fn is_retryable(&self) -> bool {
		match self {
			TransportError::Network(e) => e.is_retryable(),
			TransportError::Status { status, .. } => reqwest::StatusCode::from_u16(*status)
				.map(is_retryable_status)
				.unwrap_or(false),
			TransportError::Encode(_) => false,
		}
	}
}

/// Result type alias for analytics operations.
pub type Result<T> = std::result::Result<T, AnalyticsError>;
