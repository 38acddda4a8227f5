//! Durable operation queue
//!
//! Operations go to the background relay when it is reachable and to the fallback log in the
//! synchronous local store otherwise. [`OperationQueue::migrate_fallback_log`] hands the
//! fallback log over to the relay once it becomes reachable.

use std::{
	collections::HashSet,
	sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
	operation::{Operation, OperationId},
	relay::RelayClient,
	store::{load_json, save_json, KeyValueStore, Namespace},
	Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
	/// The fallback log was empty.
	NothingToMigrate,
	/// The relay acknowledged this many operations and they left the fallback log.
	Migrated { count: usize },
	/// Another migration holds the lock; this call did nothing.
	AlreadyRunning,
}

pub struct OperationQueue {
	store: Arc<dyn KeyValueStore>,
	fallback_key: String,
	relay: RelayClient,
	log_lock: Mutex<()>,
	migration: tokio::sync::Mutex<()>,
}

impl OperationQueue {
	pub fn new(store: Arc<dyn KeyValueStore>, namespace: &Namespace, relay: RelayClient) -> Self {
		Self {
			store,
			fallback_key: namespace.key(Namespace::FALLBACK_LOG),
			relay,
			log_lock: Mutex::new(()),
			migration: tokio::sync::Mutex::new(()),
		}
	}

	#[must_use]
	pub const fn relay(&self) -> &RelayClient {
		&self.relay
	}

	/// Records one operation durably and returns its id.
	pub async fn enqueue(&self, operation: Operation) -> Result<OperationId, Error> {
		let id = operation.id;
		self.enqueue_batch(vec![operation]).await?;

		Ok(id)
	}

	/// Records a set of operations as one request. Each member stays independently retryable.
	pub async fn enqueue_batch(&self, operations: Vec<Operation>) -> Result<Vec<OperationId>, Error> {
		let ids = operations.iter().map(|op| op.id).collect::<Vec<_>>();

		if operations.is_empty() {
			return Ok(ids);
		}

		if self.relay.is_reachable() {
			match self.relay.enqueue(operations.clone()).await {
				Ok(()) => {
					debug!(count = ids.len(), "Forwarded operations to relay");
					return Ok(ids);
				}
				Err(e) => {
					warn!(?e, count = ids.len(), "Relay enqueue failed, using fallback log");
				}
			}
		}

		self.append_fallback(operations)?;

		Ok(ids)
	}

	/// Operations currently parked in the fallback log, oldest first.
	///
	/// An unreadable log is logged and treated as empty.
	#[must_use]
	pub fn fallback_operations(&self) -> Vec<Operation> {
		let _guard = self.log_lock.lock().unwrap_or_else(PoisonError::into_inner);
		self.read_fallback()
	}

	/// Drops operations from the fallback log. Unknown ids are ignored.
	pub fn remove_fallback(&self, ids: &[OperationId]) -> Result<(), Error> {
		let ids = ids.iter().collect::<HashSet<_>>();

		self.update_fallback(|log| log.retain(|op| !ids.contains(&op.id)))
	}

	/// Replaces fallback entries with the given versions, matched by id.
	pub fn replace_fallback(&self, updated: &[Operation]) -> Result<(), Error> {
		self.update_fallback(|log| {
			for op in log.iter_mut() {
				if let Some(new) = updated.iter().find(|new| new.id == op.id) {
					op.clone_from(new);
				}
			}
		})
	}

	/// Every operation not yet acknowledged by the remote store, wherever it is queued.
	pub async fn all_pending(&self) -> Result<Vec<Operation>, Error> {
		let mut operations = self.fallback_operations();

		if self.relay.is_reachable() {
			let known = operations.iter().map(|op| op.id).collect::<HashSet<_>>();
			operations.extend(
				self.relay
					.pending_operations()
					.await?
					.into_iter()
					.filter(|op| !known.contains(&op.id)),
			);
		}

		operations.sort_by_key(|op| op.timestamp);

		Ok(operations)
	}

	/// Fallback log length plus whatever the relay reports as queued.
	pub async fn pending_count(&self) -> usize {
		let fallback = self.fallback_operations().len();

		if self.relay.is_reachable() {
			fallback + self.relay.status().await.pending_count
		} else {
			fallback
		}
	}

	/// Moves the fallback log into the relay in one request.
	///
	/// Entries leave the fallback log only after the relay acknowledged them; on failure or
	/// timeout the log is untouched and the error returned.
	#[instrument(skip(self))]
	pub async fn migrate_fallback_log(&self) -> Result<MigrationOutcome, Error> {
		let Ok(_migration) = self.migration.try_lock() else {
			debug!("Fallback log migration already running");
			return Ok(MigrationOutcome::AlreadyRunning);
		};

		let operations = self.fallback_operations();
		if operations.is_empty() {
			return Ok(MigrationOutcome::NothingToMigrate);
		}

		if !self.relay.is_reachable() {
			return Err(Error::RelayUnavailable);
		}

		let count = operations.len();
		let ids = operations.iter().map(|op| op.id).collect::<Vec<_>>();

		info!(count, "Migrating fallback log to relay");

		if let Err(e) = self.relay.migrate(operations).await {
			warn!(?e, count, "Fallback log migration failed, log retained");
			return Err(e);
		}

		// A failure here leaves duplicates behind, which the relay ignores on the next migration
		self.remove_fallback(&ids)?;

		info!(count, "Fallback log migrated");

		Ok(MigrationOutcome::Migrated { count })
	}

	fn append_fallback(&self, operations: Vec<Operation>) -> Result<(), Error> {
		let count = operations.len();

		self.update_fallback(|log| {
			let known = log.iter().map(|op| op.id).collect::<HashSet<_>>();
			log.extend(operations.into_iter().filter(|op| !known.contains(&op.id)));
		})
		.map_err(|e| {
			error!(?e, count, "Failed to append to fallback log");
			e
		})?;

		debug!(count, "Appended operations to fallback log");

		Ok(())
	}

	fn update_fallback(&self, f: impl FnOnce(&mut Vec<Operation>)) -> Result<(), Error> {
		let _guard = self.log_lock.lock().unwrap_or_else(PoisonError::into_inner);

		let mut log = self.read_fallback();
		f(&mut log);

		if log.is_empty() {
			self.store.remove(&self.fallback_key).map_err(Into::into)
		} else {
			save_json(self.store.as_ref(), &self.fallback_key, &log)
		}
	}

	fn read_fallback(&self) -> Vec<Operation> {
		load_json::<Vec<Operation>>(self.store.as_ref(), &self.fallback_key)
			.unwrap_or_else(|e| {
				error!(key = %self.fallback_key, ?e, "Fallback log unreadable, treating as empty");
				None
			})
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use async_channel as chan;
	use tracing_test::traced_test;

	use super::*;
	use crate::{
		clock::FakeClock,
		config::TimeoutConfig,
		operation::OperationKind,
		relay::{RelayEnvelope, RelayLink, RelayReply, RelayResponse},
		store::MemoryStore,
		UserKind,
	};

	fn queue_with_store() -> (OperationQueue, Arc<MemoryStore>) {
		let store = Arc::new(MemoryStore::new());
		let queue = OperationQueue::new(
			Arc::clone(&store) as Arc<dyn KeyValueStore>,
			&Namespace::new("tracker", UserKind::Local),
			RelayClient::new(TimeoutConfig::default()),
		);
		(queue, store)
	}

	fn note(item: &str) -> Operation {
		Operation::new(
			OperationKind::SetNote {
				item_id: item.to_owned(),
				note: "n".to_owned(),
			},
			&FakeClock::default(),
		)
	}

	/// A relay that answers every request with `response`.
	fn scripted_relay(response: RelayResponse) -> RelayLink {
		let (requests_tx, requests_rx) = chan::unbounded::<RelayEnvelope>();
		let (replies_tx, replies_rx) = chan::unbounded();

		tokio::spawn(async move {
			while let Ok(envelope) = requests_rx.recv().await {
				replies_tx
					.send(RelayReply {
						request_id: envelope.request_id,
						response: response.clone(),
					})
					.await
					.ok();
			}
		});

		RelayLink::new(requests_tx, replies_rx)
	}

	#[tokio::test]
	async fn offline_enqueue_goes_to_fallback_log() {
		let (queue, store) = queue_with_store();

		let ids = queue
			.enqueue_batch(vec![note("a"), note("b")])
			.await
			.unwrap();

		assert_eq!(ids.len(), 2);
		assert_eq!(queue.fallback_operations().len(), 2);
		assert!(store.get("tracker:local:fallback-log").unwrap().is_some());
		assert_eq!(queue.pending_count().await, 2);
	}

	#[tokio::test]
	async fn failed_migration_keeps_log() {
		let (queue, _store) = queue_with_store();
		queue.enqueue(note("a")).await.unwrap();

		let link = scripted_relay(RelayResponse::failed("disk full"));
		queue.relay().attach(link);

		let err = queue.migrate_fallback_log().await.unwrap_err();
		assert!(matches!(err, Error::RelayRejected(_)));
		assert_eq!(queue.fallback_operations().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn migration_timeout_keeps_log() {
		let (queue, _store) = queue_with_store();
		queue.enqueue(note("a")).await.unwrap();

		let (requests_tx, _requests_rx) = chan::unbounded();
		let (_replies_tx, replies_rx) = chan::unbounded::<RelayReply>();
		queue
			.relay()
			.attach(RelayLink::new(requests_tx, replies_rx));

		let err = queue.migrate_fallback_log().await.unwrap_err();
		assert!(matches!(err, Error::RelayTimeout(_)));
		assert_eq!(queue.fallback_operations().len(), 1);
	}

	#[tokio::test]
	async fn acknowledged_migration_clears_log() {
		let (queue, store) = queue_with_store();
		queue.enqueue(note("a")).await.unwrap();
		queue.enqueue(note("b")).await.unwrap();

		let link = scripted_relay(RelayResponse::ok());
		queue.relay().attach(link);

		assert_eq!(
			queue.migrate_fallback_log().await.unwrap(),
			MigrationOutcome::Migrated { count: 2 }
		);
		assert!(queue.fallback_operations().is_empty());
		assert_eq!(store.get("tracker:local:fallback-log").unwrap(), None);

		assert_eq!(
			queue.migrate_fallback_log().await.unwrap(),
			MigrationOutcome::NothingToMigrate
		);
	}

	#[tokio::test]
	async fn concurrent_migration_is_a_no_op() {
		let (queue, _store) = queue_with_store();
		queue.enqueue(note("a")).await.unwrap();

		let link = scripted_relay(RelayResponse::ok());
		queue.relay().attach(link);

		let (first, second) = tokio::join!(queue.migrate_fallback_log(), queue.migrate_fallback_log());

		let outcomes = [first.unwrap(), second.unwrap()];
		assert!(outcomes.contains(&MigrationOutcome::Migrated { count: 1 }));
		assert!(outcomes.contains(&MigrationOutcome::AlreadyRunning));
	}

	#[tokio::test]
	#[traced_test]
	async fn refused_enqueue_falls_back_to_log() {
		let (queue, store) = queue_with_store();
		queue
			.relay()
			.attach(scripted_relay(RelayResponse::failed("quota exceeded")));

		let operation = note("a");
		queue.enqueue_batch(vec![operation.clone()]).await.unwrap();

		assert_eq!(queue.fallback_operations(), vec![operation]);
		assert!(store.get("tracker:local:fallback-log").unwrap().is_some());
		assert!(logs_contain("Relay enqueue failed, using fallback log"));
	}
}
