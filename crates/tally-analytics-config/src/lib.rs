// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for Tally analytics delivery.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Validation that fails fast on malformed values
//! - Consistent environment variable naming (`TALLY_ANALYTICS_*`)
//!
//! # Usage
//!
//! ```ignore
//! use tally_analytics_config::load_config;
//!
//! let config = load_config()?;
//! println!("delivering to {}", config.endpoint);
//! ```

pub mod error;
pub mod layer;
pub mod sources;

pub use error::ConfigError;
pub use layer::{
	AnalyticsConfig, AnalyticsConfigLayer, DEFAULT_DESTINATION_KEY, DEFAULT_DLQ_KEY,
	DEFAULT_ENDPOINT, DEFAULT_QUEUE_KEY,
};
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource, ENV_PREFIX};

use tracing::{debug, info};

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`TALLY_ANALYTICS_*`)
/// 2. Config file (`$XDG_CONFIG_HOME/tally/analytics.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<AnalyticsConfig, ConfigError> {
	let mut sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(DefaultsSource)];
	if let Some(file) = TomlSource::user() {
		sources.push(Box::new(file));
	}
	sources.push(Box::new(EnvSource::new()));

	load_config_from(sources)
}

/// Merges `sources` in precedence order and finalizes the result.
pub fn load_config_from(
	mut sources: Vec<Box<dyn ConfigSource>>,
) -> Result<AnalyticsConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = AnalyticsConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	let config = merged.finalize()?;
	info!(
		endpoint = %config.endpoint,
		enabled = config.enabled,
		"analytics configuration loaded"
	);
	Ok(config)
}
