// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The analytics client: event intake, flush orchestration and lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tally_analytics_config::AnalyticsConfig;
use tally_analytics_core::{
	AnalyticsEvent, DeadLetterEntry, EventId, EventName, FailureReason, Props, QueueEntry,
	SessionId,
};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::dead_letter::{DeadLetterQueue, DeadLetterStats};
use crate::error::{AnalyticsError, Result};
use crate::queue::{PersistentQueue, QueueStats};
use crate::store::{BlobStore, FileBlobStore};
use crate::transport::{HttpTransport, Transport};

/// Pre-queue transform applied to every logged event. Returning `None`
/// drops the event.
pub type EventHook = Arc<dyn Fn(AnalyticsEvent) -> Option<AnalyticsEvent> + Send + Sync>;

/// Host lifecycle signals the client reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
	AppForeground,
	AppBackground,
	NetworkRestored,
}

/// What a single flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
	/// Nothing was queued.
	Empty,
	/// The batch was accepted and removed from the queue.
	Delivered { count: usize },
	/// A retryable failure; entries stay queued unless they ran out of retries.
	Failed {
		attempted: usize,
		dead_lettered: usize,
		error: Option<String>,
	},
	/// The collector refused the batch; every entry was dead-lettered.
	Rejected {
		count: usize,
		status_code: Option<u16>,
	},
	/// The circuit breaker refused the attempt. Nothing was sent.
	CircuitOpen { pending: usize },
	/// Another flush was already running.
	AlreadyInFlight,
	/// Delivery is switched off by configuration.
	Disabled,
}

/// Builder for constructing an [`AnalyticsClient`].
pub struct AnalyticsClientBuilder {
	config: Option<AnalyticsConfig>,
	transport: Option<Arc<dyn Transport>>,
	store: Option<Arc<dyn BlobStore>>,
	session_id: Option<SessionId>,
	hooks: Vec<EventHook>,
}

impl AnalyticsClientBuilder {
	pub fn new() -> Self {
		Self {
			config: None,
			transport: None,
			store: None,
			session_id: None,
			hooks: Vec::new(),
		}
	}

	/// Sets the configuration. Defaults to [`AnalyticsConfig::default`].
	pub fn config(mut self, config: AnalyticsConfig) -> Self {
		self.config = Some(config);
		self
	}

	/// Sets the transport. Defaults to an [`HttpTransport`] built from the
	/// configuration.
	pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
		self.transport = Some(Arc::new(transport));
		self
	}

	/// Shares an existing transport handle.
	pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Sets the blob store. Defaults to a [`FileBlobStore`] under the XDG
	/// state directory.
	pub fn store(mut self, store: impl BlobStore + 'static) -> Self {
		self.store = Some(Arc::new(store));
		self
	}

	pub fn store_arc(mut self, store: Arc<dyn BlobStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Fixes the session id stamped on events. A random one is generated
	/// otherwise.
	pub fn session_id(mut self, session_id: SessionId) -> Self {
		self.session_id = Some(session_id);
		self
	}

	/// Appends a hook. Hooks run in registration order.
	pub fn event_hook(
		mut self,
		hook: impl Fn(AnalyticsEvent) -> Option<AnalyticsEvent> + Send + Sync + 'static,
	) -> Self {
		self.hooks.push(Arc::new(hook));
		self
	}

	pub fn build(self) -> Result<AnalyticsClient> {
		let config = self.config.unwrap_or_default();
		config.validate()?;

		let transport = match self.transport {
			Some(transport) => transport,
			None => Arc::new(HttpTransport::new(&config)?),
		};
		let store = match self.store {
			Some(store) => store,
			None => Arc::new(FileBlobStore::from_xdg()?),
		};

		let queue = PersistentQueue::new(Arc::clone(&store), &config.queue_key, config.max_queue_size);
		let dlq = DeadLetterQueue::new(store, &config.dlq_key, config.max_dlq_size);
		let breaker = CircuitBreaker::new(CircuitBreakerConfig::from(&config));
		let session_id = self.session_id.unwrap_or_default();

		info!(
			endpoint = %config.endpoint,
			destination = %config.destination_key,
			enabled = config.enabled,
			session_id = %session_id,
			"analytics client created"
		);

		Ok(AnalyticsClient {
			inner: Arc::new(ClientInner {
				config,
				transport,
				breaker,
				session_id,
				hooks: self.hooks,
				state: Mutex::new(PipelineState {
					queue,
					dlq,
					loaded: false,
				}),
				flushing: AtomicBool::new(false),
				closed: AtomicBool::new(false),
				loop_started: AtomicBool::new(false),
				flush_notify: Notify::new(),
				task: std::sync::Mutex::new(None),
			}),
		})
	}
}

impl Default for AnalyticsClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct PipelineState {
	queue: PersistentQueue,
	dlq: DeadLetterQueue,
	loaded: bool,
}

struct ClientInner {
	config: AnalyticsConfig,
	transport: Arc<dyn Transport>,
	breaker: CircuitBreaker,
	session_id: SessionId,
	hooks: Vec<EventHook>,
	state: Mutex<PipelineState>,
	flushing: AtomicBool,
	closed: AtomicBool,
	loop_started: AtomicBool,
	flush_notify: Notify,
	task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Releases the flush slot when dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
	fn acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| Self(flag))
	}
}

impl Drop for FlushGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl ClientInner {
	/// Locks the pipeline state, restoring it from the store on first use.
	async fn state(&self) -> MutexGuard<'_, PipelineState> {
		let mut state = self.state.lock().await;
		if !state.loaded {
			self.restore(&mut state).await;
		}
		state
	}

	async fn restore(&self, state: &mut PipelineState) {
		state.loaded = true;

		if let Err(e) = state.queue.load().await {
			warn!(error = %e, "could not load persisted analytics queue, continuing in memory");
		}
		if let Err(e) = state.dlq.load().await {
			warn!(error = %e, "could not load persisted dead-letter queue, continuing in memory");
		}

		// An interrupted move into the dead-letter queue can leave an event in
		// both stores; the dead-letter copy wins.
		let duplicated: Vec<EventId> = state
			.queue
			.entries()
			.map(QueueEntry::event_id)
			.filter(|id| state.dlq.contains(id))
			.collect();
		let mut dirty = !state.queue.remove(&duplicated).is_empty();
		if dirty {
			debug!(count = duplicated.len(), "dropped queue entries already dead-lettered");
		}

		// A lowered retry budget can leave stored entries already exhausted.
		let exhausted = state.queue.drain_exhausted(self.config.client_max_retries);
		if !exhausted.is_empty() {
			for entry in exhausted {
				state.dlq.add(
					entry.event,
					FailureReason::RetriesExhausted,
					entry.retry_count,
					None,
				);
			}
			dirty = persist_dlq(state).await;
		}
		if dirty {
			persist_queue(state).await;
		}

		info!(
			queued = state.queue.len(),
			dead_lettered = state.dlq.len(),
			"analytics state restored"
		);
	}

	async fn flush(&self) -> FlushOutcome {
		if !self.config.enabled {
			return FlushOutcome::Disabled;
		}
		let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
			debug!("flush already in flight, skipping");
			return FlushOutcome::AlreadyInFlight;
		};

		let (batch, pending) = {
			let state = self.state().await;
			(state.queue.peek_batch(self.config.max_batch_size), state.queue.len())
		};
		if batch.is_empty() {
			return FlushOutcome::Empty;
		}
		let Some(permit) = self.breaker.try_attempt() else {
			debug!(pending, "circuit open, skipping flush");
			return FlushOutcome::CircuitOpen { pending };
		};

		let ids: Vec<EventId> = batch.iter().map(QueueEntry::event_id).collect();
		let events: Vec<AnalyticsEvent> = batch.into_iter().map(|entry| entry.event).collect();

		// The queue stays unlocked while the request is in flight.
		let result = self
			.transport
			.send(&events, &self.config.destination_key)
			.await;

		let mut state = self.state().await;
		if result.success {
			permit.success();
			let removed = state.queue.remove(&ids);
			persist_queue(&state).await;
			debug!(count = removed.len(), "analytics batch flushed");
			return FlushOutcome::Delivered { count: ids.len() };
		}

		if result.should_retry {
			permit.failure();
			let exhausted = state
				.queue
				.increment_retries(&ids, self.config.client_max_retries);
			let dead_lettered = exhausted.len();
			for entry in exhausted {
				state.dlq.add(
					entry.event,
					FailureReason::RetriesExhausted,
					entry.retry_count,
					result.error.clone(),
				);
			}
			if dead_lettered == 0 || persist_dlq(&state).await {
				persist_queue(&state).await;
			}
			debug!(
				attempted = ids.len(),
				dead_lettered,
				error = result.error.as_deref().unwrap_or(""),
				"analytics flush failed, will retry"
			);
			return FlushOutcome::Failed {
				attempted: ids.len(),
				dead_lettered,
				error: result.error,
			};
		}

		// The collector answered, so the link itself is healthy.
		permit.success();
		let reason = FailureReason::Rejected {
			status_code: result.status_code,
		};
		let removed = state.queue.remove(&ids);
		let count = removed.len();
		for entry in removed {
			state
				.dlq
				.add(entry.event, reason, entry.retry_count, result.error.clone());
		}
		if persist_dlq(&state).await {
			persist_queue(&state).await;
		}
		FlushOutcome::Rejected {
			count,
			status_code: result.status_code,
		}
	}

	async fn flush_all(&self) -> Vec<FlushOutcome> {
		let max_rounds = self
			.config
			.max_queue_size
			.div_ceil(self.config.max_batch_size.max(1))
			+ 1;
		let mut outcomes = Vec::new();
		for _ in 0..max_rounds {
			let outcome = self.flush().await;
			let delivered = matches!(outcome, FlushOutcome::Delivered { .. });
			outcomes.push(outcome);
			if !delivered {
				break;
			}
		}
		outcomes
	}
}

/// Moves between the two stores write the destination first, so a failed
/// or interrupted write leaves the event where it was.
async fn persist_queue(state: &PipelineState) -> bool {
	match state.queue.persist().await {
		Ok(()) => true,
		Err(e) => {
			warn!(error = %e, "failed to persist analytics queue");
			false
		}
	}
}

async fn persist_dlq(state: &PipelineState) -> bool {
	match state.dlq.persist().await {
		Ok(()) => true,
		Err(e) => {
			warn!(error = %e, "failed to persist dead-letter queue");
			false
		}
	}
}

async fn run_flush_loop(inner: Weak<ClientInner>, period: std::time::Duration) {
	let mut interval = tokio::time::interval_at(Instant::now() + period, period);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

	info!(
		flush_interval_ms = period.as_millis() as u64,
		"analytics flush loop started"
	);

	loop {
		let notified = match inner.upgrade() {
			Some(inner) => {
				tokio::select! {
					_ = interval.tick() => false,
					_ = inner.flush_notify.notified() => true,
				}
			}
			None => break,
		};

		let Some(inner) = inner.upgrade() else { break };
		if inner.closed.load(Ordering::SeqCst) {
			break;
		}

		let outcome = inner.flush().await;
		debug!(?outcome, notified, "background flush finished");
	}

	info!("analytics flush loop stopped");
}

/// Offline-tolerant analytics client.
///
/// Events are validated and persisted synchronously in [`log`](Self::log)
/// and delivered in batches by [`flush`](Self::flush), either on demand or
/// from the background loop started by [`initialize`](Self::initialize).
///
/// # Example
///
/// ```ignore
/// use tally_analytics::{AnalyticsClient, MemoryBlobStore};
/// use tally_analytics_core::{EventName, Props};
///
/// let client = AnalyticsClient::builder()
///     .config(tally_analytics_config::load_config()?)
///     .store(MemoryBlobStore::new())
///     .build()?;
/// client.initialize().await?;
///
/// client
///     .log(EventName::ScreenViewed, Props::new().insert("screen_name", "home"))
///     .await;
///
/// client.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct AnalyticsClient {
	inner: Arc<ClientInner>,
}

impl AnalyticsClient {
	pub fn builder() -> AnalyticsClientBuilder {
		AnalyticsClientBuilder::new()
	}

	/// Restores persisted state and starts the background flush loop.
	///
	/// Calling it again is a no-op. Must run inside a tokio runtime.
	pub async fn initialize(&self) -> Result<()> {
		self.check_closed()?;
		drop(self.inner.state().await);

		if self.inner.loop_started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let handle = tokio::spawn(run_flush_loop(
			Arc::downgrade(&self.inner),
			self.inner.config.flush_interval(),
		));
		*self
			.inner
			.task
			.lock()
			.unwrap_or_else(|e| e.into_inner()) = Some(handle);

		info!("analytics client initialized");
		Ok(())
	}

	/// Reacts to a host lifecycle signal.
	pub fn notify(&self, event: LifecycleEvent) {
		match event {
			LifecycleEvent::AppForeground | LifecycleEvent::NetworkRestored => {
				debug!(?event, "lifecycle signal, requesting flush");
				self.inner.flush_notify.notify_one();
			}
			LifecycleEvent::AppBackground => {
				debug!("app moved to background");
			}
		}
	}

	/// Records an event. Returns its id, or `None` if it was dropped.
	///
	/// Never fails and never waits on the network. The event is persisted
	/// before this returns unless the store itself fails, in which case it
	/// is kept in memory and the failure is logged.
	pub async fn log(&self, event_name: EventName, props: Props) -> Option<EventId> {
		if self.inner.closed.load(Ordering::SeqCst) {
			warn!(event_name = %event_name, "analytics client shut down, dropping event");
			return None;
		}
		if !self.inner.config.enabled {
			debug!(event_name = %event_name, "analytics disabled, dropping event");
			return None;
		}

		let event = match AnalyticsEvent::new(
			event_name,
			props,
			self.inner.session_id,
			&self.inner.config.app_version,
			&self.inner.config.platform,
		) {
			Ok(event) => event,
			Err(e) => {
				warn!(event_name = %event_name, error = %e, "dropping invalid analytics event");
				return None;
			}
		};

		let event = self.apply_hooks(event)?;
		let event_id = event.event_id;

		let mut state = self.inner.state().await;
		state.queue.push(QueueEntry::new(event));
		persist_queue(&state).await;
		let queued = state.queue.len();
		drop(state);

		debug!(event_id = %event_id, event_name = %event_name, queued, "analytics event queued");
		if queued >= self.inner.config.max_batch_size {
			self.inner.flush_notify.notify_one();
		}
		Some(event_id)
	}

	/// Like [`log`](Self::log) but takes the wire name of the event.
	pub async fn log_named(&self, event_name: &str, props: Props) -> Option<EventId> {
		match event_name.parse::<EventName>() {
			Ok(name) => self.log(name, props).await,
			Err(e) => {
				warn!(error = %e, "dropping analytics event with unknown name");
				None
			}
		}
	}

	fn apply_hooks(&self, mut event: AnalyticsEvent) -> Option<AnalyticsEvent> {
		for hook in &self.inner.hooks {
			let event_id = event.event_id;
			event = match hook(event) {
				Some(event) => event,
				None => {
					debug!(event_id = %event_id, "analytics event vetoed by hook");
					return None;
				}
			};
		}
		if let Err(e) = event.event_name.validate(&event.props) {
			warn!(event_id = %event.event_id, error = %e, "hook produced an invalid event, dropping");
			return None;
		}
		Some(event)
	}

	/// Attempts one batch delivery.
	pub async fn flush(&self) -> Result<FlushOutcome> {
		self.check_closed()?;
		Ok(self.inner.flush().await)
	}

	/// Flushes until the queue is empty or a flush delivers nothing.
	pub async fn flush_all(&self) -> Result<Vec<FlushOutcome>> {
		self.check_closed()?;
		Ok(self.inner.flush_all().await)
	}

	pub async fn get_queue_stats(&self) -> QueueStats {
		self.inner.state().await.queue.stats()
	}

	pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
		self.inner.state().await.dlq.get_all()
	}

	pub async fn dead_letters_by_event_name(&self, event_name: EventName) -> Vec<DeadLetterEntry> {
		self.inner.state().await.dlq.get_by_event_name(event_name)
	}

	pub async fn dead_letters_by_failure_reason(
		&self,
		reason: &FailureReason,
	) -> Vec<DeadLetterEntry> {
		self.inner.state().await.dlq.get_by_failure_reason(reason)
	}

	pub async fn dead_letter_stats(&self) -> DeadLetterStats {
		self.inner.state().await.dlq.get_stats()
	}

	/// Moves the dead letter at `index` back into the live queue with a
	/// fresh retry budget.
	pub async fn retry_dead_letter(&self, index: usize) -> Option<EventId> {
		let mut state = self.inner.state().await;
		let event = state.dlq.retry(index)?;
		let event_id = event.event_id;
		state.queue.push(QueueEntry::new(event));
		if persist_queue(&state).await {
			persist_dlq(&state).await;
		}
		Some(event_id)
	}

	/// Moves every dead letter back into the live queue with a fresh retry
	/// budget. Returns how many were moved.
	pub async fn requeue_dead_letters(&self) -> usize {
		let mut state = self.inner.state().await;
		let events = state.dlq.retry_all();
		let count = events.len();
		if count == 0 {
			return 0;
		}
		for event in events {
			state.queue.push(QueueEntry::new(event));
		}
		if persist_queue(&state).await {
			persist_dlq(&state).await;
		}
		info!(count, "dead letters requeued");
		count
	}

	pub async fn clear_dead_letters(&self) {
		let mut state = self.inner.state().await;
		state.dlq.clear();
		persist_dlq(&state).await;
	}

	pub fn circuit_state(&self) -> CircuitState {
		self.inner.breaker.state()
	}

	pub fn session_id(&self) -> SessionId {
		self.inner.session_id
	}

	pub fn config(&self) -> &AnalyticsConfig {
		&self.inner.config
	}

	/// Stops the flush loop, makes a final delivery attempt and persists.
	///
	/// An in-flight flush is allowed to finish. Later calls are no-ops.
	pub async fn shutdown(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		self.inner.flush_notify.notify_one();
		let handle = self
			.inner
			.task
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.take();
		if let Some(handle) = handle {
			if let Err(e) = handle.await {
				error!(error = %e, "analytics flush loop failed");
			}
		}

		let outcomes = self.inner.flush_all().await;
		debug!(?outcomes, "final flush on shutdown");

		let state = self.inner.state().await;
		persist_dlq(&state).await;
		persist_queue(&state).await;

		info!(
			queued = state.queue.len(),
			dead_lettered = state.dlq.len(),
			"analytics client shutdown"
		);
		Ok(())
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	fn check_closed(&self) -> Result<()> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(AnalyticsError::ClientShutdown);
		}
		Ok(())
	}
}
