// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end delivery behaviour against a scripted transport.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tally_analytics::{
	AnalyticsClient, BlobStore, CircuitState, FileBlobStore, FlushOutcome, MemoryBlobStore,
	SendResult, Transport,
};
use tally_analytics_config::AnalyticsConfig;
use tally_analytics_core::{AnalyticsEvent, EventId, EventName, FailureReason, Props, QueueEntry};
use tempfile::TempDir;
use tokio::sync::Notify;

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Returns scripted results in order, then repeats `fallback`.
struct ScriptedTransport {
	script: Mutex<VecDeque<SendResult>>,
	fallback: SendResult,
	calls: Mutex<Vec<Vec<EventId>>>,
}

impl ScriptedTransport {
	fn new(script: impl IntoIterator<Item = SendResult>, fallback: SendResult) -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(script.into_iter().collect()),
			fallback,
			calls: Mutex::new(Vec::new()),
		})
	}

	fn always(result: SendResult) -> Arc<Self> {
		Self::new([], result)
	}

	fn call_count(&self) -> usize {
		self.calls.lock().unwrap().len()
	}

	fn sent_ids(&self) -> Vec<EventId> {
		self.calls.lock().unwrap().iter().flatten().copied().collect()
	}
}

#[async_trait]
impl Transport for ScriptedTransport {
	async fn send(&self, events: &[AnalyticsEvent], _destination: &str) -> SendResult {
		self
			.calls
			.lock()
			.unwrap()
			.push(events.iter().map(|e| e.event_id).collect());
		self
			.script
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or_else(|| self.fallback.clone())
	}
}

/// Parks every send until released, so a flush can be held in flight.
struct GatedTransport {
	started: Notify,
	release: Notify,
	calls: Mutex<usize>,
}

#[async_trait]
impl Transport for GatedTransport {
	async fn send(&self, _events: &[AnalyticsEvent], _destination: &str) -> SendResult {
		*self.calls.lock().unwrap() += 1;
		self.started.notify_one();
		self.release.notified().await;
		SendResult::ok(Some(200))
	}
}

fn ok() -> SendResult {
	SendResult::ok(Some(200))
}

fn unavailable() -> SendResult {
	SendResult::retryable(Some(503), "collector responded with status 503")
}

fn config() -> AnalyticsConfig {
	AnalyticsConfig {
		flush_interval_ms: 3_600_000,
		..AnalyticsConfig::default()
	}
}

fn client_with(
	config: AnalyticsConfig,
	transport: Arc<dyn Transport>,
	store: Arc<dyn BlobStore>,
) -> AnalyticsClient {
	AnalyticsClient::builder()
		.config(config)
		.transport_arc(transport)
		.store_arc(store)
		.build()
		.unwrap()
}

fn offline_open_props() -> Props {
	Props::new()
		.insert("install_age_bucket", "0d")
		.insert("network_state", "offline")
}

#[tokio::test]
async fn retryable_failure_then_success_drains_queue() {
	init_tracing();
	let transport = ScriptedTransport::new([unavailable()], ok());
	let c = client_with(config(), transport.clone(), Arc::new(MemoryBlobStore::new()));

	let id = c.log(EventName::AppOpened, offline_open_props()).await.unwrap();

	assert!(matches!(c.flush().await.unwrap(), FlushOutcome::Failed { .. }));
	assert_eq!(c.get_queue_stats().await.size, 1);

	assert_eq!(c.flush().await.unwrap(), FlushOutcome::Delivered { count: 1 });
	assert_eq!(c.get_queue_stats().await.size, 0);
	assert_eq!(transport.sent_ids(), vec![id, id]);
	assert!(c.dead_letters().await.is_empty());
}

#[tokio::test]
async fn client_error_is_dead_lettered_on_first_flush() {
	init_tracing();
	let transport = ScriptedTransport::always(SendResult::permanent(Some(400), "bad request"));
	let c = client_with(config(), transport, Arc::new(MemoryBlobStore::new()));

	let id = c.log(EventName::AppOpened, offline_open_props()).await.unwrap();
	c.flush().await.unwrap();

	assert_eq!(c.get_queue_stats().await.size, 0);
	let dead = c.dead_letters().await;
	assert_eq!(dead.len(), 1);
	assert_eq!(dead[0].event.event_id, id);
	assert_eq!(
		dead[0].failure_reason,
		FailureReason::Rejected {
			status_code: Some(400)
		}
	);
	assert_eq!(dead[0].retry_count, 0);
}

#[tokio::test]
async fn retries_exhaust_after_client_budget() {
	init_tracing();
	let transport = ScriptedTransport::always(unavailable());
	let cfg = AnalyticsConfig {
		client_max_retries: 2,
		..config()
	};
	let c = client_with(cfg, transport.clone(), Arc::new(MemoryBlobStore::new()));

	let id = c.log(EventName::SyncFailed, Props::new()).await.unwrap();
	c.flush().await.unwrap();
	c.flush().await.unwrap();

	assert_eq!(c.get_queue_stats().await.size, 0);
	let dead = c.dead_letters().await;
	assert_eq!(dead.len(), 1);
	assert_eq!(dead[0].event.event_id, id);
	assert_eq!(dead[0].retry_count, 2);
	assert_eq!(dead[0].failure_reason, FailureReason::RetriesExhausted);
	assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_and_allows_one_trial_after_cooldown() {
	init_tracing();
	let transport = ScriptedTransport::always(unavailable());
	let cfg = AnalyticsConfig {
		client_max_retries: 100,
		..config()
	};
	let c = client_with(cfg, transport.clone(), Arc::new(MemoryBlobStore::new()));
	c.log(EventName::AppOpened, Props::new()).await.unwrap();

	for _ in 0..5 {
		assert!(matches!(c.flush().await.unwrap(), FlushOutcome::Failed { .. }));
	}
	assert_eq!(c.circuit_state(), CircuitState::Open);
	assert_eq!(transport.call_count(), 5);

	// Skips while open neither call out nor spend retry budget.
	assert_eq!(
		c.flush().await.unwrap(),
		FlushOutcome::CircuitOpen { pending: 1 }
	);
	assert_eq!(transport.call_count(), 5);
	assert_eq!(c.get_queue_stats().await.retry_histogram.get(&5), Some(&1));

	tokio::time::advance(Duration::from_millis(30_000)).await;
	assert_eq!(c.circuit_state(), CircuitState::HalfOpen);

	// The trial fails and the breaker re-opens, so the next flush is refused.
	assert!(matches!(c.flush().await.unwrap(), FlushOutcome::Failed { .. }));
	assert_eq!(transport.call_count(), 6);
	assert_eq!(c.circuit_state(), CircuitState::Open);
	assert!(matches!(
		c.flush().await.unwrap(),
		FlushOutcome::CircuitOpen { .. }
	));
	assert_eq!(transport.call_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn successful_trial_closes_breaker() {
	init_tracing();
	let transport = ScriptedTransport::new(vec![unavailable(); 5], ok());
	let c = client_with(config(), transport.clone(), Arc::new(MemoryBlobStore::new()));
	c.log(EventName::AppOpened, Props::new()).await.unwrap();

	for _ in 0..5 {
		c.flush().await.unwrap();
	}
	assert_eq!(c.circuit_state(), CircuitState::Open);

	tokio::time::advance(Duration::from_secs(31)).await;
	assert_eq!(c.flush().await.unwrap(), FlushOutcome::Delivered { count: 1 });
	assert_eq!(c.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn concurrent_flush_does_not_duplicate_delivery() {
	init_tracing();
	let transport = Arc::new(GatedTransport {
		started: Notify::new(),
		release: Notify::new(),
		calls: Mutex::new(0),
	});
	let c = client_with(config(), transport.clone(), Arc::new(MemoryBlobStore::new()));
	c.log(EventName::AppOpened, Props::new()).await.unwrap();

	let first = {
		let c = c.clone();
		tokio::spawn(async move { c.flush().await })
	};
	transport.started.notified().await;

	assert_eq!(c.flush().await.unwrap(), FlushOutcome::AlreadyInFlight);
	assert_eq!(c.get_queue_stats().await.retry_histogram.get(&0), Some(&1));

	transport.release.notify_one();
	let outcome = first.await.unwrap().unwrap();
	assert_eq!(outcome, FlushOutcome::Delivered { count: 1 });
	assert_eq!(*transport.calls.lock().unwrap(), 1);
	assert_eq!(c.get_queue_stats().await.size, 0);
}

#[tokio::test]
async fn events_logged_during_flush_are_kept() {
	init_tracing();
	let transport = Arc::new(GatedTransport {
		started: Notify::new(),
		release: Notify::new(),
		calls: Mutex::new(0),
	});
	let store = MemoryBlobStore::new();
	let c = client_with(config(), transport.clone(), Arc::new(store.clone()));
	c.log(EventName::AppOpened, Props::new()).await.unwrap();

	let first = {
		let c = c.clone();
		tokio::spawn(async move { c.flush().await })
	};
	transport.started.notified().await;

	let late = c.log(EventName::ScreenViewed, Props::new()).await.unwrap();
	transport.release.notify_one();
	first.await.unwrap().unwrap();

	let blob = store.get("tally.analytics.queue").await.unwrap().unwrap();
	let remaining: Vec<QueueEntry> = serde_json::from_str(&blob).unwrap();
	assert_eq!(remaining.len(), 1);
	assert_eq!(remaining[0].event_id(), late);
	assert_eq!(remaining[0].retry_count, 0);
}

#[tokio::test]
async fn queue_survives_restart_with_file_store() {
	init_tracing();
	let tmp = TempDir::new().unwrap();
	let transport = ScriptedTransport::always(unavailable());

	let logged: Vec<EventId> = {
		let c = client_with(
			config(),
			transport.clone(),
			Arc::new(FileBlobStore::new(tmp.path())),
		);
		let mut ids = Vec::new();
		for screen in ["home", "lists", "settings"] {
			let props = Props::new().insert("screen_name", screen);
			ids.push(c.log(EventName::ScreenViewed, props).await.unwrap());
		}
		c.flush().await.unwrap();
		ids
	};

	let delivered = ScriptedTransport::always(ok());
	let c = client_with(
		config(),
		delivered.clone(),
		Arc::new(FileBlobStore::new(tmp.path())),
	);
	c.initialize().await.unwrap();

	let stats = c.get_queue_stats().await;
	assert_eq!(stats.size, 3);
	assert_eq!(stats.retry_histogram.get(&1), Some(&3));

	c.shutdown().await.unwrap();
	assert_eq!(delivered.sent_ids(), logged);
}

#[tokio::test]
async fn lowered_retry_budget_dead_letters_on_restore() {
	init_tracing();
	let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
	let transport = ScriptedTransport::always(unavailable());

	let first = client_with(config(), transport.clone(), Arc::clone(&store));
	let id = first.log(EventName::NoteCreated, Props::new()).await.unwrap();
	first.flush().await.unwrap();
	first.flush().await.unwrap();

	let cfg = AnalyticsConfig {
		client_max_retries: 2,
		..config()
	};
	let second = client_with(cfg, transport, store);
	second.initialize().await.unwrap();

	assert_eq!(second.get_queue_stats().await.size, 0);
	let dead = second.dead_letters().await;
	assert_eq!(dead.len(), 1);
	assert_eq!(dead[0].event.event_id, id);
	second.shutdown().await.unwrap();
}

#[tokio::test]
async fn dead_letter_queue_respects_bound() {
	init_tracing();
	let transport = ScriptedTransport::always(SendResult::permanent(Some(422), "unprocessable"));
	let cfg = AnalyticsConfig {
		max_dlq_size: 3,
		..config()
	};
	let c = client_with(cfg, transport, Arc::new(MemoryBlobStore::new()));

	let mut ids = Vec::new();
	for _ in 0..5 {
		ids.push(c.log(EventName::ListCreated, Props::new()).await.unwrap());
		c.flush().await.unwrap();
	}

	let stats = c.dead_letter_stats().await;
	assert_eq!(stats.size, 3);
	assert_eq!(stats.total_evicted, 2);
	let kept: Vec<_> = c.dead_letters().await.iter().map(|e| e.event.event_id).collect();
	assert_eq!(kept, ids[2..].to_vec());
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(32))]

	#[test]
	fn logged_events_survive_restart(screens in prop::collection::vec("[a-z]{1,12}", 0..20)) {
		let (logged, restored) = tokio_test::block_on(async {
			let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
			let transport = ScriptedTransport::always(ok());

			let before = client_with(config(), transport.clone(), Arc::clone(&store));
			let mut logged = HashSet::new();
			for screen in &screens {
				let props = Props::new().insert("screen_name", screen.as_str());
				logged.insert(before.log(EventName::ScreenViewed, props).await.unwrap());
			}
			drop(before);

			let after = client_with(config(), transport.clone(), store);
			after.flush_all().await.unwrap();
			let restored: HashSet<EventId> = transport.sent_ids().into_iter().collect();
			(logged, restored)
		});

		prop_assert_eq!(logged, restored);
	}
}
