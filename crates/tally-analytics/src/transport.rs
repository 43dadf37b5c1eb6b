// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of event batches to the collector.

use async_trait::async_trait;
use reqwest::{header, Client};
use tally_analytics_config::AnalyticsConfig;
use tally_analytics_core::AnalyticsEvent;
use tally_common_http::{RetryConfig, RetryableError};
use tracing::{debug, warn};

use crate::error::{AnalyticsError, TransportError};

/// Classified outcome of one [`Transport::send`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
	pub success: bool,
	/// Only meaningful when `success` is false.
	pub should_retry: bool,
	pub status_code: Option<u16>,
	pub error: Option<String>,
}

impl SendResult {
	pub fn ok(status_code: Option<u16>) -> Self {
		Self {
			success: true,
			should_retry: false,
			status_code,
			error: None,
		}
	}

	pub fn retryable(status_code: Option<u16>, error: impl Into<String>) -> Self {
		Self {
			success: false,
			should_retry: true,
			status_code,
			error: Some(error.into()),
		}
	}

	pub fn permanent(status_code: Option<u16>, error: impl Into<String>) -> Self {
		Self {
			success: false,
			should_retry: false,
			status_code,
			error: Some(error.into()),
		}
	}
}

/// Sends a batch of events to a named destination.
///
/// Implementations never return an error; every failure is folded into the
/// [`SendResult`] classification.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, events: &[AnalyticsEvent], destination: &str) -> SendResult;
}

/// POSTs batches as a JSON array to `{endpoint}/{destination}`.
pub struct HttpTransport {
	client: Client,
	endpoint: String,
	enabled: bool,
	retry_config: RetryConfig,
}

impl HttpTransport {
	/// Builds a transport from the client configuration.
	///
	/// A transport built with `enabled = false` answers every send with a
	/// retryable failure. Paired with an enabled client that failure spends
	/// retry budget and ends in the dead-letter queue, so build it from the
	/// same configuration as the client. [`AnalyticsClientBuilder`] does this
	/// when no transport is supplied.
	///
	/// [`AnalyticsClientBuilder`]: crate::AnalyticsClientBuilder
	pub fn new(config: &AnalyticsConfig) -> Result<Self, AnalyticsError> {
		let client = tally_common_http::builder()
			.timeout(config.request_timeout())
			.build()
			.map_err(AnalyticsError::HttpClient)?;

		Ok(Self {
			client,
			endpoint: config.endpoint.trim_end_matches('/').to_string(),
			enabled: config.enabled,
			retry_config: RetryConfig::with_max_retries(config.transport_max_retries),
		})
	}

	/// Overrides the backoff policy used for immediate re-attempts.
	pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
		self.retry_config = retry_config;
		self
	}

	pub fn url_for(&self, destination: &str) -> String {
		format!("{}/{}", self.endpoint, destination.trim_start_matches('/'))
	}

	async fn post(&self, url: &str, payload: &[u8]) -> Result<u16, TransportError> {
		tally_common_http::retry(&self.retry_config, || async {
			let response = self
				.client
				.post(url)
				.header(header::CONTENT_TYPE, "application/json")
				.body(payload.to_vec())
				.send()
				.await?;

			let status = response.status();
			if status.is_success() {
				return Ok(status.as_u16());
			}

			let body = response.text().await.unwrap_or_default();
			Err(TransportError::Status {
				status: status.as_u16(),
				body,
			})
		})
		.await
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, events: &[AnalyticsEvent], destination: &str) -> SendResult {
		if !self.enabled {
			return SendResult::retryable(None, "transport disabled");
		}
		if events.is_empty() {
			return SendResult::ok(None);
		}

		let payload = match serde_json::to_vec(events) {
			Ok(payload) => payload,
			Err(e) => {
				let err = TransportError::Encode(e);
				warn!(error = %err, count = events.len(), "could not encode analytics batch");
				return SendResult::permanent(None, err.to_string());
			}
		};

		let url = self.url_for(destination);
		debug!(url = %url, count = events.len(), bytes = payload.len(), "sending analytics batch");

		match self.post(&url, &payload).await {
			Ok(status) => {
				debug!(url = %url, status, count = events.len(), "analytics batch delivered");
				SendResult::ok(Some(status))
			}
			Err(err) => {
				let status = err.status_code();
				let retryable = err.is_retryable();
				warn!(
					url = %url,
					error = %err,
					status = status.unwrap_or_default(),
					retryable,
					"analytics batch delivery failed"
				);
				if retryable {
					SendResult::retryable(status, err.to_string())
				} else {
					SendResult::permanent(status, err.to_string())
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;
	use tally_analytics_core::{EventName, Props, SessionId};
	use wiremock::matchers::{body_json, header as header_is, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn config(endpoint: &str) -> AnalyticsConfig {
		AnalyticsConfig {
			endpoint: endpoint.to_string(),
			request_timeout_ms: 200,
			..AnalyticsConfig::default()
		}
	}

	fn fast_retry(max_retries: u32) -> RetryConfig {
		RetryConfig {
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
			jitter: false,
			..RetryConfig::with_max_retries(max_retries)
		}
	}

	fn transport(server: &MockServer, max_retries: u32) -> HttpTransport {
		HttpTransport::new(&config(&server.uri()))
			.unwrap()
			.with_retry_config(fast_retry(max_retries))
	}

	fn batch() -> Vec<AnalyticsEvent> {
		vec![
			AnalyticsEvent::new(EventName::AppOpened, Props::new(), SessionId::new(), "1.0.0", "ios")
				.unwrap(),
		]
	}

	#[tokio::test]
	async fn test_success_posts_json_array() {
		let server = MockServer::start().await;
		let events = batch();
		Mock::given(method("POST"))
			.and(path("/events"))
			.and(header_is("content-type", "application/json"))
			.and(body_json(&events))
			.respond_with(ResponseTemplate::new(202))
			.expect(1)
			.mount(&server)
			.await;

		let result = transport(&server, 2).send(&events, "events").await;
		assert_eq!(result, SendResult::ok(Some(202)));
	}

	#[tokio::test]
	async fn test_server_error_is_retried_then_retryable() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/events"))
			.respond_with(ResponseTemplate::new(503))
			.expect(3)
			.mount(&server)
			.await;

		let result = transport(&server, 2).send(&batch(), "events").await;
		assert!(!result.success);
		assert!(result.should_retry);
		assert_eq!(result.status_code, Some(503));
	}

	#[tokio::test]
	async fn test_recovers_within_internal_retries() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500))
			.up_to_n_times(1)
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let result = transport(&server, 2).send(&batch(), "events").await;
		assert!(result.success);
	}

	#[tokio::test]
	async fn test_client_error_is_permanent_without_retry() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(400).set_body_string("bad event"))
			.expect(1)
			.mount(&server)
			.await;

		let result = transport(&server, 2).send(&batch(), "events").await;
		assert!(!result.success);
		assert!(!result.should_retry);
		assert_eq!(result.status_code, Some(400));
	}

	#[tokio::test]
	async fn test_throttling_is_retryable() {
		for code in [408u16, 429] {
			let server = MockServer::start().await;
			Mock::given(method("POST"))
				.respond_with(ResponseTemplate::new(code))
				.mount(&server)
				.await;

			let result = transport(&server, 0).send(&batch(), "events").await;
			assert!(result.should_retry, "status {code}");
			assert_eq!(result.status_code, Some(code));
		}
	}

	#[tokio::test]
	async fn test_timeout_is_retryable() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
			.mount(&server)
			.await;

		let result = transport(&server, 0).send(&batch(), "events").await;
		assert!(!result.success);
		assert!(result.should_retry);
		assert_eq!(result.status_code, None);
	}

	#[tokio::test]
	async fn test_connection_refused_is_retryable() {
		let t = HttpTransport::new(&config("http://127.0.0.1:1"))
			.unwrap()
			.with_retry_config(fast_retry(0));
		let result = t.send(&batch(), "events").await;
		assert!(result.should_retry);
	}

	#[tokio::test]
	async fn test_disabled_transport_skips_network() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.expect(0)
			.mount(&server)
			.await;

		let mut cfg = config(&server.uri());
		cfg.enabled = false;
		let result = HttpTransport::new(&cfg).unwrap().send(&batch(), "events").await;
		assert_eq!(result, SendResult::retryable(None, "transport disabled"));
	}

	#[test]
	fn test_url_joins_destination() {
		let t = HttpTransport::new(&config("https://collect.example.com/ingest/")).unwrap();
		assert_eq!(t.url_for("events"), "https://collect.example.com/ingest/events");
		assert_eq!(t.url_for("/events"), "https://collect.example.com/ingest/events");
	}
}
