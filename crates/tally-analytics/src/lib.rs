// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Offline-tolerant analytics delivery for Tally apps.
//!
//! Events logged through [`AnalyticsClient::log`] are validated, written to a
//! durable queue and delivered in batches through a [`Transport`]. Failed
//! batches are retried across flush cycles; events that run out of retries
//! or that the collector refuses land in the [`DeadLetterQueue`]. A
//! [`CircuitBreaker`] pauses delivery while the collector keeps failing.
//!
//! # Example
//!
//! ```ignore
//! use tally_analytics::{AnalyticsClient, LifecycleEvent};
//! use tally_analytics_core::{EventName, Props};
//!
//! let client = AnalyticsClient::builder()
//!     .config(tally_analytics_config::load_config()?)
//!     .build()?;
//! client.initialize().await?;
//!
//! client.log(EventName::AppOpened, Props::new().insert("cold_start", true)).await;
//! client.notify(LifecycleEvent::AppForeground);
//!
//! client.shutdown().await?;
//! ```

pub mod circuit_breaker;
pub mod client;
pub mod dead_letter;
pub mod error;
pub mod queue;
pub mod store;
pub mod transport;

pub use circuit_breaker::{AttemptPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{AnalyticsClient, AnalyticsClientBuilder, EventHook, FlushOutcome, LifecycleEvent};
pub use dead_letter::{DeadLetterQueue, DeadLetterStats};
pub use error::{AnalyticsError, Result, StoreError, TransportError};
pub use queue::{PersistentQueue, QueueStats};
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use transport::{HttpTransport, SendResult, Transport};
