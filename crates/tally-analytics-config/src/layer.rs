// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Analytics configuration layer and its finalized form.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8787/ingest";
pub const DEFAULT_DESTINATION_KEY: &str = "events";
pub const DEFAULT_QUEUE_KEY: &str = "tally.analytics.queue";
pub const DEFAULT_DLQ_KEY: &str = "tally.analytics.dlq";

/// One source's view of the configuration. Unset fields defer to
/// lower-precedence layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsConfigLayer {
	pub enabled: Option<bool>,
	pub endpoint: Option<String>,
	pub destination_key: Option<String>,
	pub transport_max_retries: Option<u32>,
	pub client_max_retries: Option<u32>,
	pub request_timeout_ms: Option<u64>,
	pub flush_interval_ms: Option<u64>,
	pub max_batch_size: Option<usize>,
	pub max_queue_size: Option<usize>,
	pub max_dlq_size: Option<usize>,
	pub circuit_breaker_failure_threshold: Option<f64>,
	pub circuit_breaker_window_size: Option<usize>,
	pub circuit_breaker_min_requests: Option<usize>,
	pub circuit_breaker_cooldown_ms: Option<u64>,
	pub app_version: Option<String>,
	pub platform: Option<String>,
	pub queue_key: Option<String>,
	pub dlq_key: Option<String>,
}

macro_rules! merge_fields {
	($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
		$(
			if $other.$field.is_some() {
				$self.$field = $other.$field;
			}
		)+
	};
}

impl AnalyticsConfigLayer {
	/// Overlays `other` on top of `self`.
	pub fn merge(&mut self, other: Self) {
		merge_fields!(
			self,
			other,
			enabled,
			endpoint,
			destination_key,
			transport_max_retries,
			client_max_retries,
			request_timeout_ms,
			flush_interval_ms,
			max_batch_size,
			max_queue_size,
			max_dlq_size,
			circuit_breaker_failure_threshold,
			circuit_breaker_window_size,
			circuit_breaker_min_requests,
			circuit_breaker_cooldown_ms,
			app_version,
			platform,
			queue_key,
			dlq_key,
		);
	}

	/// Fills gaps with defaults and validates the result.
	pub fn finalize(self) -> Result<AnalyticsConfig, ConfigError> {
		let defaults = AnalyticsConfig::default();
		let config = AnalyticsConfig {
			enabled: self.enabled.unwrap_or(defaults.enabled),
			endpoint: self.endpoint.unwrap_or(defaults.endpoint),
			destination_key: self.destination_key.unwrap_or(defaults.destination_key),
			transport_max_retries: self
				.transport_max_retries
				.unwrap_or(defaults.transport_max_retries),
			client_max_retries: self.client_max_retries.unwrap_or(defaults.client_max_retries),
			request_timeout_ms: self.request_timeout_ms.unwrap_or(defaults.request_timeout_ms),
			flush_interval_ms: self.flush_interval_ms.unwrap_or(defaults.flush_interval_ms),
			max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
			max_queue_size: self.max_queue_size.unwrap_or(defaults.max_queue_size),
			max_dlq_size: self.max_dlq_size.unwrap_or(defaults.max_dlq_size),
			circuit_breaker_failure_threshold: self
				.circuit_breaker_failure_threshold
				.unwrap_or(defaults.circuit_breaker_failure_threshold),
			circuit_breaker_window_size: self
				.circuit_breaker_window_size
				.unwrap_or(defaults.circuit_breaker_window_size),
			circuit_breaker_min_requests: self
				.circuit_breaker_min_requests
				.unwrap_or(defaults.circuit_breaker_min_requests),
			circuit_breaker_cooldown_ms: self
				.circuit_breaker_cooldown_ms
				.unwrap_or(defaults.circuit_breaker_cooldown_ms),
			app_version: self.app_version.unwrap_or(defaults.app_version),
			platform: self.platform.unwrap_or(defaults.platform),
			queue_key: self.queue_key.unwrap_or(defaults.queue_key),
			dlq_key: self.dlq_key.unwrap_or(defaults.dlq_key),
		};
		config.validate()?;
		Ok(config)
	}
}

/// Fully resolved analytics delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsConfig {
	/// Kill switch. When false nothing is queued or sent.
	pub enabled: bool,
	/// Collector base URL.
	pub endpoint: String,
	/// Path segment appended to `endpoint` for event batches.
	pub destination_key: String,
	/// Immediate re-attempts inside a single transport send.
	pub transport_max_retries: u32,
	/// Failed flush cycles an event survives before it is dead-lettered.
	pub client_max_retries: u32,
	pub request_timeout_ms: u64,
	pub flush_interval_ms: u64,
	pub max_batch_size: usize,
	pub max_queue_size: usize,
	pub max_dlq_size: usize,
	/// Failure ratio in (0, 1] that opens the circuit.
	pub circuit_breaker_failure_threshold: f64,
	/// Number of most recent outcomes the ratio is computed over.
	pub circuit_breaker_window_size: usize,
	/// Outcomes required in the window before the circuit may open.
	pub circuit_breaker_min_requests: usize,
	pub circuit_breaker_cooldown_ms: u64,
	pub app_version: String,
	pub platform: String,
	/// Blob store key of the live queue.
	pub queue_key: String,
	/// Blob store key of the dead-letter queue.
	pub dlq_key: String,
}

impl Default for AnalyticsConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			endpoint: DEFAULT_ENDPOINT.to_string(),
			destination_key: DEFAULT_DESTINATION_KEY.to_string(),
			transport_max_retries: 2,
			client_max_retries: 5,
			request_timeout_ms: 10_000,
			flush_interval_ms: 30_000,
			max_batch_size: 50,
			max_queue_size: 1000,
			max_dlq_size: 500,
			circuit_breaker_failure_threshold: 0.5,
			circuit_breaker_window_size: 10,
			circuit_breaker_min_requests: 5,
			circuit_breaker_cooldown_ms: 30_000,
			app_version: "0.0.0".to_string(),
			platform: std::env::consts::OS.to_string(),
			queue_key: DEFAULT_QUEUE_KEY.to_string(),
			dlq_key: DEFAULT_DLQ_KEY.to_string(),
		}
	}
}

impl AnalyticsConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}

	pub fn flush_interval(&self) -> Duration {
		Duration::from_millis(self.flush_interval_ms)
	}

	pub fn circuit_breaker_cooldown(&self) -> Duration {
		Duration::from_millis(self.circuit_breaker_cooldown_ms)
	}

	/// Rejects configurations the pipeline cannot run with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let url = Url::parse(&self.endpoint)
			.map_err(|e| ConfigError::invalid_value("endpoint", e.to_string()))?;
		if !matches!(url.scheme(), "http" | "https") {
			return Err(ConfigError::invalid_value(
				"endpoint",
				format!("unsupported scheme '{}'", url.scheme()),
			));
		}
		if self.destination_key.trim().is_empty() {
			return Err(ConfigError::MissingField("destination_key".to_string()));
		}
		if self.client_max_retries == 0 {
			return Err(ConfigError::invalid_value(
				"client_max_retries",
				"must be at least 1",
			));
		}
		for (key, value) in [
			("max_batch_size", self.max_batch_size),
			("max_queue_size", self.max_queue_size),
			("max_dlq_size", self.max_dlq_size),
			("circuit_breaker_window_size", self.circuit_breaker_window_size),
		] {
			if value == 0 {
				return Err(ConfigError::invalid_value(key, "must be greater than zero"));
			}
		}
		for (key, value) in [
			("flush_interval_ms", self.flush_interval_ms),
			("request_timeout_ms", self.request_timeout_ms),
		] {
			if value == 0 {
				return Err(ConfigError::invalid_value(key, "must be greater than zero"));
			}
		}
		let threshold = self.circuit_breaker_failure_threshold;
		if !(threshold > 0.0 && threshold <= 1.0) {
			return Err(ConfigError::invalid_value(
				"circuit_breaker_failure_threshold",
				format!("{threshold} is outside (0, 1]"),
			));
		}
		if self.circuit_breaker_min_requests > self.circuit_breaker_window_size {
			return Err(ConfigError::invalid_value(
				"circuit_breaker_min_requests",
				"must not exceed circuit_breaker_window_size",
			));
		}
		if self.queue_key == self.dlq_key {
			return Err(ConfigError::invalid_value(
				"dlq_key",
				"must differ from queue_key",
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_default_values_validate() {
		let config = AnalyticsConfig::default();
		assert!(config.enabled);
		assert_eq!(config.client_max_retries, 5);
		assert_eq!(config.flush_interval(), Duration::from_secs(30));
		config.validate().unwrap();
	}

	#[test]
	fn test_layer_finalize_defaults() {
		let config = AnalyticsConfigLayer::default().finalize().unwrap();
		assert_eq!(config, AnalyticsConfig::default());
	}

	#[test]
	fn test_merge_overwrites_only_set_fields() {
		let mut base = AnalyticsConfigLayer {
			endpoint: Some("https://collector.example.com".to_string()),
			max_queue_size: Some(200),
			..Default::default()
		};
		base.merge(AnalyticsConfigLayer {
			max_queue_size: Some(300),
			enabled: Some(false),
			..Default::default()
		});
		assert_eq!(base.endpoint.as_deref(), Some("https://collector.example.com"));
		assert_eq!(base.max_queue_size, Some(300));
		assert_eq!(base.enabled, Some(false));
	}

	#[test]
	fn test_invalid_endpoint_rejected() {
		let err = AnalyticsConfigLayer {
			endpoint: Some("not a url".to_string()),
			..Default::default()
		}
		.finalize()
		.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "endpoint"));
	}

	#[test]
	fn test_non_http_endpoint_rejected() {
		let err = AnalyticsConfigLayer {
			endpoint: Some("ftp://collector.example.com".to_string()),
			..Default::default()
		}
		.finalize()
		.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
	}

	#[test]
	fn test_zero_client_retries_rejected() {
		let err = AnalyticsConfigLayer {
			client_max_retries: Some(0),
			..Default::default()
		}
		.finalize()
		.unwrap_err();
		assert!(
			matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "client_max_retries")
		);
	}

	#[test]
	fn test_zero_request_timeout_rejected() {
		let err = AnalyticsConfigLayer {
			request_timeout_ms: Some(0),
			..Default::default()
		}
		.finalize()
		.unwrap_err();
		assert!(
			matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "request_timeout_ms")
		);
	}

	#[test]
	fn test_min_requests_above_window_rejected() {
		let err = AnalyticsConfigLayer {
			circuit_breaker_window_size: Some(4),
			circuit_breaker_min_requests: Some(5),
			..Default::default()
		}
		.finalize()
		.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
	}

	#[test]
	fn test_shared_store_keys_rejected() {
		let err = AnalyticsConfigLayer {
			dlq_key: Some(DEFAULT_QUEUE_KEY.to_string()),
			..Default::default()
		}
		.finalize()
		.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "dlq_key"));
	}

	#[test]
	fn test_deserialize_layer_partial() {
		let layer: AnalyticsConfigLayer = toml::from_str(
			r#"
endpoint = "https://collector.example.com"
client_max_retries = 3
"#,
		)
		.unwrap();
		assert_eq!(layer.client_max_retries, Some(3));
		assert!(layer.max_queue_size.is_none());
	}

	#[test]
	fn test_serde_roundtrip() {
		let config = AnalyticsConfig {
			endpoint: "https://collector.example.com".to_string(),
			max_dlq_size: 42,
			..Default::default()
		};
		let toml_str = toml::to_string(&config).unwrap();
		let parsed: AnalyticsConfig = toml::from_str(&toml_str).unwrap();
		assert_eq!(config, parsed);
	}

	proptest! {
		#[test]
		fn threshold_validation_matches_range(threshold in -1.0f64..2.0) {
			let result = AnalyticsConfigLayer {
				circuit_breaker_failure_threshold: Some(threshold),
				..Default::default()
			}
			.finalize();
			prop_assert_eq!(result.is_ok(), threshold > 0.0 && threshold <= 1.0);
		}
	}
}
