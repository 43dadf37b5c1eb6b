// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Overflow eviction is data loss and must surface as a warning.

use std::fmt;
use std::sync::{Arc, Mutex};

use tally_analytics::{DeadLetterQueue, MemoryBlobStore, PersistentQueue};
use tally_analytics_core::{AnalyticsEvent, EventName, FailureReason, Props, QueueEntry, SessionId};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Collects the message of every warn-level event.
#[derive(Clone, Default)]
struct WarnCapture(Arc<Mutex<Vec<String>>>);

impl WarnCapture {
	fn count(&self, message: &str) -> usize {
		self.0.lock().unwrap().iter().filter(|m| *m == message).count()
	}
}

impl<S: Subscriber> Layer<S> for WarnCapture {
	fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
		if *event.metadata().level() != Level::WARN {
			return;
		}
		let mut visitor = MessageVisitor(String::new());
		event.record(&mut visitor);
		self.0.lock().unwrap().push(visitor.0);
	}
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
	fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
		if field.name() == "message" {
			self.0 = format!("{value:?}");
		}
	}
}

fn event() -> AnalyticsEvent {
	AnalyticsEvent::new(EventName::AppOpened, Props::new(), SessionId::new(), "1.0.0", "ios").unwrap()
}

#[test]
fn queue_overflow_logs_warning_per_eviction() {
	let capture = WarnCapture::default();
	let subscriber = tracing_subscriber::registry().with(capture.clone());
	let store = Arc::new(MemoryBlobStore::new());

	let evicted = tracing::subscriber::with_default(subscriber, || {
		let mut queue = PersistentQueue::new(store, "tally.analytics.queue", 2);
		(0..4)
			.flat_map(|_| queue.push(QueueEntry::new(event())))
			.count()
	});

	assert_eq!(evicted, 2);
	assert_eq!(
		capture.count("dropped analytics event due to queue overflow"),
		2
	);
}

#[test]
fn dead_letter_overflow_logs_warning_per_eviction() {
	let capture = WarnCapture::default();
	let subscriber = tracing_subscriber::registry().with(capture.clone());
	let store = Arc::new(MemoryBlobStore::new());

	let evicted = tracing::subscriber::with_default(subscriber, || {
		let mut dlq = DeadLetterQueue::new(store, "tally.analytics.dlq", 1);
		(0..3)
			.flat_map(|_| dlq.add(event(), FailureReason::RetriesExhausted, 5, None))
			.count()
	});

	assert_eq!(evicted, 2);
	assert_eq!(
		capture.count("evicted dead-lettered event due to capacity"),
		2
	);
	assert_eq!(capture.count("analytics event dead-lettered"), 3);
}
