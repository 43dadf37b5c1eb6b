// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: built-in defaults, a TOML file and environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::layer::AnalyticsConfigLayer;

/// Prefix shared by every environment variable this crate reads.
pub const ENV_PREFIX: &str = "TALLY_ANALYTICS_";

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<AnalyticsConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<AnalyticsConfigLayer, ConfigError> {
		// Finalize fills every unset field, so the defaults layer stays empty.
		Ok(AnalyticsConfigLayer::default())
	}
}

/// TOML file configuration source. A missing file contributes nothing.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// `$XDG_CONFIG_HOME/tally/analytics.toml`, if a config dir exists.
	pub fn user() -> Option<Self> {
		dirs::config_dir().map(|dir| Self::new(dir.join("tally").join("analytics.toml")))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<AnalyticsConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(AnalyticsConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: AnalyticsConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable source.
///
/// Convention: `TALLY_ANALYTICS_<FIELD>`, e.g. `TALLY_ANALYTICS_MAX_QUEUE_SIZE`.
pub struct EnvSource {
	lookup: EnvLookup,
}

impl EnvSource {
	/// Reads the process environment.
	pub fn new() -> Self {
		Self::with_lookup(|name| std::env::var(name).ok())
	}

	/// Reads variables through `lookup` instead of the process environment.
	pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
		Self {
			lookup: Box::new(lookup),
		}
	}

	fn var(&self, field: &str) -> Option<String> {
		(self.lookup)(&format!("{ENV_PREFIX}{field}")).filter(|s| !s.is_empty())
	}

	fn bool(&self, field: &str) -> Option<bool> {
		self
			.var(field)
			.map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn parsed<T: FromStr>(&self, field: &str) -> Result<Option<T>, ConfigError> {
		match self.var(field) {
			Some(v) => v.parse().map(Some).map_err(|_| {
				ConfigError::invalid_value(
					format!("{ENV_PREFIX}{field}"),
					format!("cannot parse '{v}'"),
				)
			}),
			None => Ok(None),
		}
	}
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<AnalyticsConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(AnalyticsConfigLayer {
			enabled: self.bool("ENABLED"),
			endpoint: self.var("ENDPOINT"),
			destination_key: self.var("DESTINATION_KEY"),
			transport_max_retries: self.parsed("TRANSPORT_MAX_RETRIES")?,
			client_max_retries: self.parsed("CLIENT_MAX_RETRIES")?,
			request_timeout_ms: self.parsed("REQUEST_TIMEOUT_MS")?,
			flush_interval_ms: self.parsed("FLUSH_INTERVAL_MS")?,
			max_batch_size: self.parsed("MAX_BATCH_SIZE")?,
			max_queue_size: self.parsed("MAX_QUEUE_SIZE")?,
			max_dlq_size: self.parsed("MAX_DLQ_SIZE")?,
			circuit_breaker_failure_threshold: self.parsed("CIRCUIT_BREAKER_FAILURE_THRESHOLD")?,
			circuit_breaker_window_size: self.parsed("CIRCUIT_BREAKER_WINDOW_SIZE")?,
			circuit_breaker_min_requests: self.parsed("CIRCUIT_BREAKER_MIN_REQUESTS")?,
			circuit_breaker_cooldown_ms: self.parsed("CIRCUIT_BREAKER_COOLDOWN_MS")?,
			app_version: self.var("APP_VERSION"),
			platform: self.var("PLATFORM"),
			queue_key: self.var("QUEUE_KEY"),
			dlq_key: self.var("DLQ_KEY"),
		})
	}
}
