//! Single-flight flush of the operation queue against the remote store.

use std::{
	slice,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError,
	},
};

use async_trait::async_trait;
use futures::{
	future::{BoxFuture, Shared},
	FutureExt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::{
	clock::Clock,
	conflict::{ConflictLog, ConflictResolver, Resolution},
	connectivity::ReconnectHook,
	operation::{Operation, OperationId},
	queue::OperationQueue,
	remote::{OutcomeResult, Rejection, RejectionReason, RemoteStore},
	replica::Replica,
	status::StatusBus,
	Error,
};

/// `{ success, synced, failed }` plus what the caller may want to show.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
	pub success: bool,
	pub synced: usize,
	pub failed: usize,
	/// Operations parked as conflicts during this flush.
	pub conflicts: usize,
	pub needs_reauth: bool,
	/// Why the flush didn't fully succeed.
	pub error: Option<String>,
	/// Set only when the failure needs the user: re-authentication or exhausted retries.
	pub attention: Option<String>,
}

impl FlushReport {
	fn failure(error: impl ToString) -> Self {
		Self {
			error: Some(error.to_string()),
			..Self::default()
		}
	}
}

type InFlight = Shared<BoxFuture<'static, FlushReport>>;

/// Outcome of classifying one flush's rejections.
#[derive(Default)]
struct Classified {
	parked: Vec<OperationId>,
	needs_reauth: bool,
	surfaced: Option<String>,
}

impl Classified {
	fn into_report(self, synced: usize, failed: usize, transport_error: Option<String>) -> FlushReport {
		let attention = if self.needs_reauth {
			Some(Error::AuthExpired.to_string())
		} else {
			self.surfaced
		};
		let error = transport_error.or_else(|| attention.clone()).or_else(|| {
			(failed > 0).then(|| format!("{failed} operations still queued"))
		});

		FlushReport {
			success: failed == 0 && error.is_none(),
			synced,
			failed,
			conflicts: self.parked.len(),
			needs_reauth: self.needs_reauth,
			error,
			attention,
		}
	}
}

pub struct SyncCoordinator {
	queue: Arc<OperationQueue>,
	remote: Arc<dyn RemoteStore>,
	replica: Arc<Replica>,
	conflicts: Arc<ConflictLog>,
	resolver: ConflictResolver,
	status: StatusBus,
	clock: Arc<dyn Clock>,
	paused: AtomicBool,
	in_flight: Mutex<Option<InFlight>>,
}

impl SyncCoordinator {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		queue: Arc<OperationQueue>,
		remote: Arc<dyn RemoteStore>,
		replica: Arc<Replica>,
		conflicts: Arc<ConflictLog>,
		resolver: ConflictResolver,
		status: StatusBus,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			queue,
			remote,
			replica,
			conflicts,
			resolver,
			status,
			clock,
			paused: AtomicBool::new(false),
			in_flight: Mutex::new(None),
		}
	}

	#[must_use]
	pub fn is_paused(&self) -> bool {
		self.paused.load(Ordering::Acquire)
	}

	/// Clears the re-authentication pause. Does not flush by itself.
	pub fn resume(&self) {
		if self.paused.swap(false, Ordering::AcqRel) {
			info!("Sync resumed after re-authentication");
		}
		self.status.update(|status| status.needs_reauth = false);
	}

	/// Drains the queue against the remote store.
	///
	/// Single-flight: while a flush runs, every other caller awaits and receives that flush's
	/// report. The flush runs on its own task, so dropping the caller doesn't abort it midway.
	pub async fn flush(self: &Arc<Self>) -> FlushReport {
		if self.is_paused() {
			debug!("Flush skipped, sync paused until re-authentication");
			return FlushReport {
				needs_reauth: true,
				..FlushReport::failure(Error::SyncPaused)
			};
		}

		let in_flight = {
			let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

			if let Some(in_flight) = slot.as_ref() {
				debug!("Flush already in flight, awaiting its result");
				in_flight.clone()
			} else {
				let this = Arc::clone(self);
				let task = tokio::spawn(async move {
					let report = this.run_flush().await;
					*this.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
					report
				});

				let in_flight = async move {
					task.await.unwrap_or_else(|e| {
						error!(?e, "Flush task failed");
						FlushReport::failure(format!("flush task failed: {e}"))
					})
				}
				.boxed()
				.shared();

				*slot = Some(in_flight.clone());
				in_flight
			}
		};

		in_flight.await
	}

	#[instrument(skip(self))]
	async fn run_flush(&self) -> FlushReport {
		self.status.update(|status| status.is_syncing = true);

		let report = if self.queue.relay().is_reachable() {
			self.flush_via_relay().await
		} else {
			self.flush_direct().await
		};

		let pending_count = self.queue.pending_count().await;
		let conflict_message = self.conflicts.summary();
		let now = self.clock.now();

		self.status.update(|status| {
			status.is_syncing = false;
			status.pending_count = pending_count;
			status.has_conflicts = conflict_message.is_some();
			status.conflict_message.clone_from(&conflict_message);
			status.needs_reauth = self.is_paused();

			if report.success {
				status.last_sync_at = Some(now);
				status.last_error = None;
			} else if report.attention.is_some() {
				status.last_error.clone_from(&report.attention);
			}
		});

		info!(
			success = report.success,
			synced = report.synced,
			failed = report.failed,
			conflicts = report.conflicts,
			pending_count,
			"Flush finished"
		);

		report
	}

	async fn flush_via_relay(&self) -> FlushReport {
		// Fallback entries first, so the relay holds everything
		if let Err(e) = self.queue.migrate_fallback_log().await {
			warn!(?e, "Fallback log not migrated, its entries stay queued for the next flush");
		}

		let relay_report = match self.queue.relay().flush().await {
			Ok(report) => report,
			Err(e) => {
				warn!(?e, "Relay flush failed");
				return FlushReport::failure(e);
			}
		};

		let rejected = relay_report
			.rejected
			.into_iter()
			.map(|rejected| (rejected.operation, rejected.rejection))
			.collect::<Vec<_>>();
		let classified = self.classify(rejected);

		if !classified.parked.is_empty() {
			if let Err(e) = self.queue.relay().remove(classified.parked.clone()).await {
				// Parked operations are retried and parked again next time
				warn!(?e, "Failed to drop parked operations from relay queue");
			}
		}

		let fallback_left = self.queue.fallback_operations().len();
		let failed = relay_report.failed.saturating_sub(classified.parked.len()) + fallback_left;

		classified.into_report(
			relay_report.synced,
			failed,
			relay_report.transport_error,
		)
	}

	/// One direct request per queued operation. The first transport failure stops the run.
	async fn flush_direct(&self) -> FlushReport {
		let operations = self.queue.fallback_operations();
		if operations.is_empty() {
			return FlushReport {
				success: true,
				..FlushReport::default()
			};
		}

		let mut synced = Vec::new();
		let mut retried = Vec::new();
		let mut rejected = Vec::new();
		let mut transport_error = None;

		for mut operation in operations {
			if transport_error.is_some() {
				break;
			}

			let result = self
				.remote
				.patch_operations(slice::from_ref(&operation))
				.await;

			let outcome = match result {
				Ok(outcomes) => outcomes
					.into_iter()
					.find(|outcome| outcome.operation_id == operation.id)
					.map(|outcome| outcome.result),
				Err(Error::AuthExpired) => Some(OutcomeResult::Rejected {
					rejection: Rejection::auth_expired(),
				}),
				Err(Error::ServerError { status, message }) => Some(OutcomeResult::Rejected {
					rejection: Rejection::server_error(status, message),
				}),
				Err(e) => {
					debug!(operation_id = %operation.id, ?e, "Direct request failed");
					transport_error = Some(e);
					None
				}
			};

			if matches!(outcome, Some(OutcomeResult::Ack)) {
				synced.push(operation.id);
				continue;
			}

			operation.attempt_count += 1;
			retried.push(operation.clone());

			if let Some(OutcomeResult::Rejected { rejection }) = outcome {
				let auth = matches!(rejection.reason, RejectionReason::AuthExpired);
				rejected.push((operation, rejection));
				if auth {
					break;
				}
			}
		}

		if let Err(e) = self.queue.remove_fallback(&synced) {
			error!(?e, "Failed to drop acknowledged operations from fallback log");
		}
		if let Err(e) = self.queue.replace_fallback(&retried) {
			error!(?e, "Failed to record attempt counts in fallback log");
		}

		let classified = self.classify(rejected);
		if let Err(e) = self.queue.remove_fallback(&classified.parked) {
			error!(?e, "Failed to drop parked operations from fallback log");
		}

		let remaining = self.queue.fallback_operations().len();

		classified.into_report(
			synced.len(),
			remaining,
			transport_error.map(|e| e.to_string()),
		)
	}

	/// Applies the conflict policy to every rejected operation.
	fn classify(&self, rejected: Vec<(Operation, Rejection)>) -> Classified {
		let mut classified = Classified::default();
		if rejected.is_empty() {
			return classified;
		}

		let now = self.clock.now();

		for (operation, rejection) in rejected {
			let resolution = self
				.resolver
				.resolve(&operation, &rejection, &self.replica.read(), now);

			match resolution {
				Resolution::ReauthRequired => classified.needs_reauth = true,

				Resolution::Retry { surface: false } => {}

				Resolution::Retry { surface: true } => {
					warn!(
						operation_id = %operation.id,
						attempts = operation.attempt_count,
						"Retries exhausted, surfacing server error"
					);
					classified.surfaced = Some(format!(
						"Sync keeps failing for {} ({} attempts): {}. Your change is still queued.",
						operation.kind.name(),
						operation.attempt_count,
						rejection.message
					));
				}

				Resolution::Reconciled { item_id, item } => {
					let ((), persisted) = self.replica.mutate(|state| match item {
						Some(item) => {
							state.tombstones.remove(&item_id);
							state.items.insert(item_id.clone(), item);
						}
						None => {
							state.items.remove(&item_id);
							state.tombstones.insert(item_id.clone());
						}
					});
					if let Err(e) = persisted {
						self.status
							.update(|status| status.last_error = Some(e.to_string()));
					}
				}

				Resolution::Conflict(record) => {
					let operation_id = record.operation.id;
					match self.conflicts.park(record) {
						Ok(()) => classified.parked.push(operation_id),
						// Left queued, so it's classified again on the next flush
						Err(e) => error!(%operation_id, ?e, "Failed to park conflict"),
					}
				}
			}
		}

		if classified.needs_reauth && !self.paused.swap(true, Ordering::AcqRel) {
			warn!("Remote rejected the credential, pausing sync until re-authentication");
		}

		classified
	}

	/// Recomputes the queue and conflict parts of the status.
	pub async fn refresh_status(&self) {
		let pending_count = self.queue.pending_count().await;
		let conflict_message = self.conflicts.summary();

		self.status.update(|status| {
			status.pending_count = pending_count;
			status.has_conflicts = conflict_message.is_some();
			status.conflict_message = conflict_message;
		});
	}
}

/// Reconnect work: migrate the fallback log, then flush.
pub struct ReconnectSync {
	queue: Arc<OperationQueue>,
	coordinator: Arc<SyncCoordinator>,
}

impl ReconnectSync {
	#[must_use]
	pub const fn new(queue: Arc<OperationQueue>, coordinator: Arc<SyncCoordinator>) -> Self {
		Self { queue, coordinator }
	}
}

#[async_trait]
impl ReconnectHook for ReconnectSync {
	async fn on_reconnect(&self) {
		match self.queue.migrate_fallback_log().await {
			Ok(outcome) => debug!(?outcome, "Reconnect migration done"),
			Err(Error::RelayUnavailable) => debug!("No relay attached, flushing directly"),
			Err(e) => warn!(?e, "Reconnect migration failed, fallback log retained"),
		}

		let report = self.coordinator.flush().await;
		debug!(?report, "Reconnect flush done");
	}
}
