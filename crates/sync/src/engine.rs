use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
	clock::Clock,
	config::SyncConfig,
	conflict::{ConflictChoice, ConflictLog, ConflictRecord, ConflictResolver},
	connectivity::ConnectivityDetector,
	coordinator::{FlushReport, ReconnectSync, SyncCoordinator},
	model::{Catalog, ItemId, ItemSeed, ItemState, TrackedItem, UserIdentity},
	operation::{Operation, OperationId, OperationKind},
	queue::{MigrationOutcome, OperationQueue},
	relay::{RelayClient, RelayLink},
	remote::RemoteStore,
	replica::Replica,
	schedule,
	status::{StatusBus, SyncStatus},
	store::{KeyValueStore, LocalStateStore, Namespace},
	Error,
};

/// Everything the host provides to build a [`SyncEngine`].
pub struct EngineParts {
	pub identity: UserIdentity,
	pub config: SyncConfig,
	pub store: Arc<dyn KeyValueStore>,
	pub remote: Arc<dyn RemoteStore>,
	pub clock: Arc<dyn Clock>,
	pub catalog: Catalog,
}

/// Owns all sync state for one user and is the only way to change tracked items.
///
/// Every intent follows the same path: validate, apply to the local replica, persist, record
/// the operation in the queue, refresh the status. Nothing reaches the network until a flush,
/// triggered by [`SyncEngine::sync_now`], a confirmed reconnect, or the relay.
pub struct SyncEngine {
	config: SyncConfig,
	namespace: Namespace,
	replica: Arc<Replica>,
	queue: Arc<OperationQueue>,
	coordinator: Arc<SyncCoordinator>,
	connectivity: ConnectivityDetector,
	conflicts: Arc<ConflictLog>,
	status: StatusBus,
	remote: Arc<dyn RemoteStore>,
	clock: Arc<dyn Clock>,
	catalog: Catalog,
	/// Held from applying an intent until its operation is queued, and by a refresh from
	/// reading the pending operations until the rebased state is in place.
	rebase_lock: Mutex<()>,
}

impl SyncEngine {
	/// Loads the user's namespace and wires the components together.
	pub fn new(parts: EngineParts) -> Self {
		let EngineParts {
			identity,
			config,
			store,
			remote,
			clock,
			catalog,
		} = parts;

		let state_store = LocalStateStore::new(Arc::clone(&store), &config.storage.key_prefix);
		let namespace = state_store.namespace(identity.kind);

		info!(user_kind = %identity.kind, "Loading sync engine");

		let replica = Arc::new(Replica::load(identity, state_store));
		let status = StatusBus::new();

		let relay = RelayClient::new(config.timeouts.clone());
		let queue = Arc::new(OperationQueue::new(Arc::clone(&store), &namespace, relay));
		let conflicts = Arc::new(ConflictLog::new(store, &namespace));

		let coordinator = Arc::new(SyncCoordinator::new(
			Arc::clone(&queue),
			Arc::clone(&remote),
			Arc::clone(&replica),
			Arc::clone(&conflicts),
			ConflictResolver::new(config.retry.max_attempts),
			status.clone(),
			Arc::clone(&clock),
		));

		let connectivity = ConnectivityDetector::new(
			Arc::clone(&remote),
			config.timeouts.probe(),
			config.connectivity.debounce(),
			status.clone(),
		);
		connectivity.set_reconnect_hook(Arc::new(ReconnectSync::new(
			Arc::clone(&queue),
			Arc::clone(&coordinator),
		)));

		let conflict_message = conflicts.summary();
		let pending_count = queue.fallback_operations().len();
		status.update(|status| {
			status.pending_count = pending_count;
			status.has_conflicts = conflict_message.is_some();
			status.conflict_message = conflict_message;
		});

		Self {
			config,
			namespace,
			replica,
			queue,
			coordinator,
			connectivity,
			conflicts,
			status,
			remote,
			clock,
			catalog,
			rebase_lock: Mutex::default(),
		}
	}

	#[must_use]
	pub const fn config(&self) -> &SyncConfig {
		&self.config
	}

	#[must_use]
	pub fn identity(&self) -> &UserIdentity {
		self.replica.identity()
	}

	#[must_use]
	pub const fn namespace(&self) -> &Namespace {
		&self.namespace
	}

	#[must_use]
	pub const fn connectivity(&self) -> &ConnectivityDetector {
		&self.connectivity
	}

	#[must_use]
	pub const fn queue(&self) -> &Arc<OperationQueue> {
		&self.queue
	}

	#[must_use]
	pub fn status(&self) -> SyncStatus {
		self.status.current()
	}

	#[must_use]
	pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
		self.status.subscribe()
	}

	#[must_use]
	pub fn items(&self) -> ItemState {
		self.replica.snapshot()
	}

	#[must_use]
	pub fn item(&self, id: &str) -> Option<TrackedItem> {
		self.replica.read().get(id).cloned()
	}

	/// See [`LocalStateStore::has_valid_data`].
	#[must_use]
	pub fn has_valid_data(&self) -> bool {
		self.replica.store().has_valid_data()
	}

	/// Creates default items for catalog entries that are neither tracked nor deleted.
	///
	/// Local-only: no operation is queued, as every replica derives the same defaults.
	pub fn seed_from_catalog(&self) -> usize {
		let (created, persisted) = self.replica.mutate(|state| {
			let mut created = 0;
			for entry in self.catalog.entries() {
				if !state.items.contains_key(&entry.id)
					&& state.insert_live(TrackedItem::from_seed(&ItemSeed::from(entry)))
				{
					created += 1;
				}
			}
			created
		});

		self.report_persist_failure(persisted);
		debug!(created, "Seeded items from catalog");

		created
	}

	pub async fn mark_solved(&self, item_id: &str) -> Result<OperationId, Error> {
		let item = self.live_item(item_id)?;
		let today = self.clock.today();

		self.record_one(OperationKind::MarkSolved {
			item_id: item.id,
			review_interval_index: item.review_interval_index,
			next_review_date: schedule::next_review_date(today, item.review_interval_index),
		})
		.await
	}

	/// Advances the review interval. An unsolved item becomes solved.
	pub async fn reviewed_again(&self, item_id: &str) -> Result<OperationId, Error> {
		let item = self.live_item(item_id)?;
		let index = schedule::advance(item.review_interval_index);
		let today = self.clock.today();

		self.record_one(OperationKind::UpdateReviewSchedule {
			item_id: item.id,
			review_interval_index: index,
			next_review_date: Some(schedule::next_review_date(today, index)),
		})
		.await
	}

	/// Returns the item to unsolved with no schedule; recreates it if it was deleted.
	pub async fn reset_item(&self, item_id: &str) -> Result<OperationId, Error> {
		let seed = self.seed_for(item_id)?;

		self.record_one(OperationKind::ResetItem { seed }).await
	}

	pub async fn set_note(&self, item_id: &str, note: impl Into<String>) -> Result<OperationId, Error> {
		let item = self.live_item(item_id)?;

		self.record_one(OperationKind::SetNote {
			item_id: item.id,
			note: note.into(),
		})
		.await
	}

	pub async fn delete_item(&self, item_id: &str) -> Result<OperationId, Error> {
		let item = self.live_item(item_id)?;

		self.record_one(OperationKind::DeleteItem { item_id: item.id })
			.await
	}

	/// Adds a user-created item with a generated id.
	pub async fn create_custom_item(
		&self,
		category: impl Into<String>,
		subcategory: impl Into<String>,
	) -> Result<ItemId, Error> {
		let seed = ItemSeed {
			id: format!("custom-{}", Uuid::new_v4()),
			category: category.into(),
			subcategory: subcategory.into(),
			is_custom: true,
		};
		let id = seed.id.clone();

		self.record_one(OperationKind::CreateCustomItem { seed })
			.await?;

		Ok(id)
	}

	/// Deletes every live item of a category, one `DeleteItem` per item, queued as one batch.
	pub async fn delete_category(&self, category: &str) -> Result<Vec<OperationId>, Error> {
		let ids = self.live_ids_in(category, |_| true);
		if ids.is_empty() {
			return Err(Error::UnknownCategory(category.to_owned()));
		}

		self.record(
			ids.into_iter()
				.map(|item_id| OperationKind::DeleteItem { item_id })
				.collect(),
		)
		.await
	}

	/// Deletes a user-created category with a single `DeleteCategory` operation.
	pub async fn delete_custom_category(&self, category: &str) -> Result<OperationId, Error> {
		let item_ids = self.live_ids_in(category, |item| item.is_custom);
		if item_ids.is_empty() {
			return Err(Error::UnknownCategory(category.to_owned()));
		}

		self.record_one(OperationKind::DeleteCategory {
			category: category.to_owned(),
			item_ids,
		})
		.await
	}

	/// Resets every catalog item of a category, deleted ones included, plus live custom items.
	pub async fn reset_category(&self, category: &str) -> Result<OperationId, Error> {
		let mut items = self
			.catalog
			.in_category(category)
			.map(ItemSeed::from)
			.collect::<Vec<_>>();

		items.extend(
			self.replica
				.read()
				.in_category(category)
				.filter(|item| item.is_custom)
				.map(TrackedItem::seed),
		);

		if items.is_empty() {
			return Err(Error::UnknownCategory(category.to_owned()));
		}

		self.record_one(OperationKind::ResetCategory {
			category: category.to_owned(),
			items,
		})
		.await
	}

	/// Verified connectivity check, then a flush.
	pub async fn sync_now(&self) -> Result<FlushReport, Error> {
		if !self.connectivity.is_online().await {
			return Err(Error::NetworkUnavailable(
				"remote store did not answer the reachability probe".to_owned(),
			));
		}

		Ok(self.coordinator.flush().await)
	}

	/// Flushes without checking connectivity first.
	pub async fn flush(&self) -> FlushReport {
		self.coordinator.flush().await
	}

	/// Adopts the remote copy as the new base and replays every pending operation on top, so
	/// local edits not yet acknowledged survive.
	#[instrument(skip(self))]
	pub async fn refresh_from_remote(&self) -> Result<(), Error> {
		let snapshot = self.remote.fetch_user().await?;

		let rebase = self.rebase_lock.lock().await;
		let pending = self.queue.all_pending().await?;

		let mut rebased = snapshot.into_state();
		for operation in &pending {
			rebased.apply(&operation.kind);
		}

		info!(
			items = rebased.items.len(),
			tombstones = rebased.tombstones.len(),
			replayed = pending.len(),
			"Rebased local state on remote copy"
		);

		self.report_persist_failure(self.replica.replace(rebased));
		self.seed_from_catalog();
		drop(rebase);

		self.coordinator.refresh_status().await;

		Ok(())
	}

	/// Connects to a background relay and hands it the fallback log.
	pub async fn attach_relay(&self, link: RelayLink) -> Result<MigrationOutcome, Error> {
		if !self.queue.relay().attach(link) {
			return Ok(MigrationOutcome::NothingToMigrate);
		}

		let outcome = self.queue.migrate_fallback_log().await;
		self.coordinator.refresh_status().await;

		outcome
	}

	pub fn detach_relay(&self) {
		self.queue.relay().detach();
	}

	#[must_use]
	pub fn conflicts(&self) -> Vec<ConflictRecord> {
		self.conflicts.list()
	}

	/// Settles a parked conflict, either re-sending the local edit or adopting the remote item.
	pub async fn resolve_conflict(
		&self,
		operation_id: OperationId,
		choice: ConflictChoice,
	) -> Result<(), Error> {
		let record = self
			.conflicts
			.take(operation_id)?
			.ok_or(Error::UnknownConflict(*operation_id.as_uuid()))?;

		info!(%operation_id, ?choice, item_id = %record.item_id, "Resolving conflict");

		match choice {
			ConflictChoice::KeepLocal => {
				self.record_one(record.operation.kind).await?;
			}
			ConflictChoice::KeepRemote => {
				let ConflictRecord {
					item_id,
					remote_item,
					..
				} = record;

				let ((), persisted) = self.replica.mutate(|state| match remote_item {
					Some(item) => {
						state.tombstones.remove(&item_id);
						state.items.insert(item_id, item);
					}
					None => {
						state.items.remove(&item_id);
						state.tombstones.insert(item_id);
					}
				});
				self.report_persist_failure(persisted);
				self.coordinator.refresh_status().await;
			}
		}

		Ok(())
	}

	/// Clears the re-authentication pause and flushes what was held back.
	pub async fn resume_after_reauth(&self) -> FlushReport {
		self.coordinator.resume();
		self.coordinator.flush().await
	}

	async fn record_one(&self, kind: OperationKind) -> Result<OperationId, Error> {
		let operation = Operation::new(kind, self.clock.as_ref());
		let id = operation.id;

		self.record_operations(vec![operation]).await?;

		Ok(id)
	}

	async fn record(&self, kinds: Vec<OperationKind>) -> Result<Vec<OperationId>, Error> {
		let operations = kinds
			.into_iter()
			.map(|kind| Operation::new(kind, self.clock.as_ref()))
			.collect();

		self.record_operations(operations).await
	}

	async fn record_operations(&self, operations: Vec<Operation>) -> Result<Vec<OperationId>, Error> {
		let rebase = self.rebase_lock.lock().await;

		let ((), persisted) = self.replica.mutate(|state| {
			for operation in &operations {
				state.apply(&operation.kind);
			}
		});
		self.report_persist_failure(persisted);

		for operation in &operations {
			debug!(operation_id = %operation.id, operation = operation.kind.name(), "Recording operation");
		}

		let result = self.queue.enqueue_batch(operations).await;
		drop(rebase);

		if let Err(e) = &result {
			warn!(?e, "Operation could not be queued durably");
			self.status
				.update(|status| status.last_error = Some(e.to_string()));
		}

		self.coordinator.refresh_status().await;

		result
	}

	fn report_persist_failure(&self, persisted: Result<(), Error>) {
		if let Err(e) = persisted {
			self.status
				.update(|status| status.last_error = Some(e.to_string()));
		}
	}

	fn live_item(&self, item_id: &str) -> Result<TrackedItem, Error> {
		self.replica
			.read()
			.get(item_id)
			.cloned()
			.ok_or_else(|| Error::UnknownItem(item_id.to_owned()))
	}

	fn seed_for(&self, item_id: &str) -> Result<ItemSeed, Error> {
		if let Some(item) = self.replica.read().get(item_id) {
			return Ok(item.seed());
		}

		self.catalog
			.get(item_id)
			.map(ItemSeed::from)
			.ok_or_else(|| Error::UnknownItem(item_id.to_owned()))
	}

	fn live_ids_in(&self, category: &str, filter: impl Fn(&TrackedItem) -> bool) -> Vec<ItemId> {
		self.replica
			.read()
			.in_category(category)
			.filter(|item| filter(item))
			.map(|item| item.id.clone())
			.collect()
	}
}
