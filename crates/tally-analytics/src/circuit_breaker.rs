// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rolling-window circuit breaker gating delivery attempts.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tally_analytics_config::AnalyticsConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	/// Attempts flow normally.
	Closed,
	/// Attempts are refused until the cooldown elapses.
	Open,
	/// One trial attempt decides between closing and re-opening.
	HalfOpen,
}

impl fmt::Display for CircuitState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			CircuitState::Closed => "closed",
			CircuitState::Open => "open",
			CircuitState::HalfOpen => "half_open",
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
	/// Failure ratio in the window at which the circuit opens.
	pub failure_threshold: f64,
	/// Number of most recent outcomes considered.
	pub window_size: usize,
	/// Outcomes required in the window before the ratio is evaluated.
	pub min_requests: usize,
	pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 0.5,
			window_size: 10,
			min_requests: 5,
			cooldown: Duration::from_secs(30),
		}
	}
}

impl From<&AnalyticsConfig> for CircuitBreakerConfig {
	fn from(config: &AnalyticsConfig) -> Self {
		Self {
			failure_threshold: config.circuit_breaker_failure_threshold,
			window_size: config.circuit_breaker_window_size,
			min_requests: config.circuit_breaker_min_requests,
			cooldown: config.circuit_breaker_cooldown(),
		}
	}
}

#[derive(Debug)]
struct Inner {
	state: CircuitState,
	/// `true` marks a failure.
	window: VecDeque<bool>,
	opened_at: Option<Instant>,
	trial_in_flight: bool,
}

/// Tracks recent delivery outcomes and refuses attempts while the backend
/// looks unhealthy.
///
/// All methods take `&self`; the state sits behind a short synchronous lock
/// that is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
	config: CircuitBreakerConfig,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(config: CircuitBreakerConfig) -> Self {
		let window = VecDeque::with_capacity(config.window_size);
		Self {
			config,
			inner: Mutex::new(Inner {
				state: CircuitState::Closed,
				window,
				opened_at: None,
				trial_in_flight: false,
			}),
		}
	}

	pub fn config(&self) -> &CircuitBreakerConfig {
		&self.config
	}

	/// Current state, moving Open to HalfOpen once the cooldown has elapsed.
	pub fn state(&self) -> CircuitState {
		let mut inner = self.lock();
		self.apply_cooldown(&mut inner);
		inner.state
	}

	/// Whether a delivery attempt may go out now.
	///
	/// In HalfOpen only one caller gets `true`; it holds the trial slot until
	/// it reports an outcome.
	pub fn can_attempt(&self) -> bool {
		let mut inner = self.lock();
		self.apply_cooldown(&mut inner);
		match inner.state {
			CircuitState::Closed => true,
			CircuitState::Open => false,
			CircuitState::HalfOpen => {
				if inner.trial_in_flight {
					false
				} else {
					inner.trial_in_flight = true;
					debug!("circuit half-open, allowing trial attempt");
					true
				}
			}
		}
	}

	/// Like [`can_attempt`](Self::can_attempt), but hands back a permit.
	///
	/// A permit dropped without reporting an outcome gives a HalfOpen trial
	/// slot back, so a cancelled attempt cannot wedge the breaker.
	pub fn try_attempt(&self) -> Option<AttemptPermit<'_>> {
		self.can_attempt().then(|| AttemptPermit {
			breaker: self,
			settled: false,
		})
	}

	pub fn record_success(&self) {
		let mut inner = self.lock();
		match inner.state {
			CircuitState::HalfOpen => {
				inner.state = CircuitState::Closed;
				inner.window.clear();
				inner.opened_at = None;
				inner.trial_in_flight = false;
				info!("circuit closed after successful trial");
			}
			CircuitState::Closed => self.push_outcome(&mut inner, false),
			CircuitState::Open => {}
		}
	}

	pub fn record_failure(&self) {
		let mut inner = self.lock();
		match inner.state {
			CircuitState::HalfOpen => {
				warn!(
					cooldown_ms = self.config.cooldown.as_millis() as u64,
					"trial attempt failed, circuit re-opened"
				);
				self.open(&mut inner);
			}
			CircuitState::Closed => {
				self.push_outcome(&mut inner, true);
				let total = inner.window.len();
				if total < self.config.min_requests {
					return;
				}
				let failures = inner.window.iter().filter(|failed| **failed).count();
				let ratio = failures as f64 / total as f64;
				if ratio >= self.config.failure_threshold {
					warn!(
						failures,
						total,
						ratio,
						cooldown_ms = self.config.cooldown.as_millis() as u64,
						"circuit opened after repeated delivery failures"
					);
					self.open(&mut inner);
				}
			}
			CircuitState::Open => {}
		}
	}

	fn release_trial(&self) {
		let mut inner = self.lock();
		if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
			inner.trial_in_flight = false;
			debug!("trial attempt abandoned, slot released");
		}
	}

	fn push_outcome(&self, inner: &mut Inner, failed: bool) {
		inner.window.push_back(failed);
		while inner.window.len() > self.config.window_size.max(1) {
			inner.window.pop_front();
		}
	}

	fn open(&self, inner: &mut Inner) {
		inner.state = CircuitState::Open;
		inner.opened_at = Some(Instant::now());
		inner.window.clear();
		inner.trial_in_flight = false;
	}

	fn apply_cooldown(&self, inner: &mut Inner) {
		if inner.state != CircuitState::Open {
			return;
		}
		let cooled = inner
			.opened_at
			.map(|at| at.elapsed() >= self.config.cooldown)
			.unwrap_or(true);
		if cooled {
			inner.state = CircuitState::HalfOpen;
			inner.trial_in_flight = false;
			debug!("circuit cooldown elapsed");
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}
}

/// An admitted delivery attempt. Report its outcome through
/// [`success`](Self::success) or [`failure`](Self::failure).
#[derive(Debug)]
#[must_use = "dropping the permit abandons the attempt"]
pub struct AttemptPermit<'a> {
	breaker: &'a CircuitBreaker,
	settled: bool,
}

impl AttemptPermit<'_> {
	pub fn success(mut self) {
		self.settled = true;
		self.breaker.record_success();
	}

	pub fn failure(mut self) {
		self.settled = true;
		self.breaker.record_failure();
	}
}

impl Drop for AttemptPermit<'_> {
	fn drop(&mut self) {
		if !self.settled {
			self.breaker.release_trial();
		}
	}
}

impl Default for CircuitBreaker {
	fn default() -> Self {
		Self::new(CircuitBreakerConfig::default())
	}
}
