// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Retry with exponential backoff for transient request failures.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

/// Statuses a well-behaved client may re-attempt.
const RETRYABLE_STATUSES: [StatusCode; 6] = [
	StatusCode::TOO_MANY_REQUESTS,
	StatusCode::REQUEST_TIMEOUT,
	StatusCode::INTERNAL_SERVER_ERROR,
	StatusCode::BAD_GATEWAY,
	StatusCode::SERVICE_UNAVAILABLE,
	StatusCode::GATEWAY_TIMEOUT,
];

/// Backoff policy for [`retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
	/// Total attempts including the first one. Zero is treated as one.
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(200),
			max_delay: Duration::from_secs(5),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// Builds a policy allowing `max_retries` re-attempts after the first try.
	pub fn with_max_retries(max_retries: u32) -> Self {
		Self {
			max_attempts: max_retries.saturating_add(1),
			..Self::default()
		}
	}

	/// A policy that never re-attempts.
	pub fn no_retry() -> Self {
		Self::with_max_retries(0)
	}

	/// Delay to wait before re-attempt number `attempt` (zero based).
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let exponential =
			self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
		let capped = exponential.min(self.max_delay.as_secs_f64());

		let final_delay = if self.jitter {
			capped * (0.5 + fastrand::f64())
		} else {
			capped
		};

		Duration::from_secs_f64(final_delay.max(0.0))
	}
}

/// Returns true if a response with this status is worth re-attempting.
pub fn is_retryable_status(status: StatusCode) -> bool {
	status.is_server_error() || RETRYABLE_STATUSES.contains(&status)
}

/// Errors that know whether another attempt could succeed.
pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() || self.is_request() {
			return true;
		}

		match self.status() {
			Some(status) => is_retryable_status(status),
			None => false,
		}
	}
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget in `cfg` is spent. The last error is returned.
pub async fn retry<F, Fut, T, E>(cfg: &RetryConfig, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Debug,
{
	let max_attempts = cfg.max_attempts.max(1);
	let mut attempt = 0;

	loop {
		match f().await {
			Ok(result) => {
				if attempt > 0 {
					debug!(attempt = attempt + 1, "request succeeded after retry");
				}
				return Ok(result);
			}
			Err(err) => {
				attempt += 1;

				if !err.is_retryable() {
					debug!(error = ?err, attempt, "non-retryable error encountered");
					return Err(err);
				}

				if attempt >= max_attempts {
					warn!(
						error = ?err,
						attempt,
						max_attempts,
						"max retry attempts exhausted"
					);
					return Err(err);
				}

				let delay = cfg.delay_for(attempt - 1);
				warn!(
					error = ?err,
					attempt,
					max_attempts,
					delay_ms = delay.as_millis() as u64,
					"retrying after error"
				);

				tokio::time::sleep(delay).await;
			}
		}
	}
}
