use std::{
	collections::{HashMap, HashSet, VecDeque},
	pin::pin,
	sync::Arc,
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures_concurrency::future::Race;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
	clock::Clock,
	operation::{Operation, OperationId},
	remote::{OperationOutcome, OutcomeResult, Rejection, RemoteStore},
	store::{load_json, save_json, KeyValueStore, Namespace},
	Error,
};

use super::{
	protocol::{
		RejectedOperation, RelayEnvelope, RelayFlush, RelayReply, RelayRequest, RelayResponse,
		RelayStatus,
	},
	RelayLink,
};

const CHANNEL_SIZE: usize = 128;

/// Background relay: owns its own durable queue and drains it against the remote store.
///
/// Runs as an independent tokio task reachable only through [`RelayLink`] messages, so it keeps
/// retrying when the engine that enqueued the operations is gone.
pub struct RelayWorker {
	queue: Vec<Operation>,
	store: Arc<dyn KeyValueStore>,
	queue_key: String,
	remote: Arc<dyn RemoteStore>,
	clock: Arc<dyn Clock>,
	is_syncing: bool,
	last_sync_at: Option<DateTime<Utc>>,
}

/// Owner side of a running [`RelayWorker`]. Dropping it stops the worker.
pub struct RelayHandle {
	stop_tx: chan::Sender<oneshot::Sender<()>>,
	requests_tx: chan::Sender<RelayEnvelope>,
	replies_rx: chan::Receiver<RelayReply>,
	handle: JoinHandle<()>,
}

struct Channels {
	requests_rx: chan::Receiver<RelayEnvelope>,
	replies_tx: chan::Sender<RelayReply>,
	stop_rx: chan::Receiver<oneshot::Sender<()>>,
}

impl RelayWorker {
	/// Loads the persisted relay queue and starts the worker task.
	pub fn spawn(
		store: Arc<dyn KeyValueStore>,
		namespace: &Namespace,
		remote: Arc<dyn RemoteStore>,
		clock: Arc<dyn Clock>,
	) -> RelayHandle {
		let queue_key = namespace.key(Namespace::RELAY_QUEUE);

		let mut queue = load_json::<Vec<Operation>>(store.as_ref(), &queue_key)
			.unwrap_or_else(|e| {
				error!(key = %queue_key, ?e, "Relay queue unreadable, starting empty");
				None
			})
			.unwrap_or_default();
		queue.sort_by_key(|op| op.timestamp);

		info!(pending = queue.len(), "Starting background relay");

		let (requests_tx, requests_rx) = chan::bounded(CHANNEL_SIZE);
		let (replies_tx, replies_rx) = chan::bounded(CHANNEL_SIZE);
		let (stop_tx, stop_rx) = chan::bounded(1);

		let worker = Self {
			queue,
			store,
			queue_key,
			remote,
			clock,
			is_syncing: false,
			last_sync_at: None,
		};

		let handle = tokio::spawn(worker.run(Channels {
			requests_rx,
			replies_tx,
			stop_rx,
		}));

		RelayHandle {
			stop_tx,
			requests_tx,
			replies_rx,
			handle,
		}
	}

	async fn run(mut self, channels: Channels) {
		enum RaceOutput {
			Request(RelayEnvelope),
			Stop(Option<oneshot::Sender<()>>),
		}

		let mut backlog = VecDeque::new();

		loop {
			let envelope = if let Some(envelope) = backlog.pop_front() {
				envelope
			} else {
				match (
					channels
						.requests_rx
						.recv()
						.map(|res| res.map_or(RaceOutput::Stop(None), RaceOutput::Request)),
					channels.stop_rx.recv().map(|res| RaceOutput::Stop(res.ok())),
				)
					.race()
					.await
				{
					RaceOutput::Request(envelope) => envelope,
					RaceOutput::Stop(ack) => {
						info!(pending = self.queue.len(), "Background relay stopping");
						if let Some(ack) = ack {
							ack.send(()).ok();
						}
						break;
					}
				}
			};

			let RelayEnvelope {
				request_id,
				request,
			} = envelope;

			trace!(%request_id, request = request.name(), "Relay received request");

			let response = match request {
				RelayRequest::Flush => {
					RelayResponse::Flushed(self.flush(&channels, &mut backlog).await)
				}
				other => self.handle(other),
			};

			if channels
				.replies_tx
				.send(RelayReply {
					request_id,
					response,
				})
				.await
				.is_err()
			{
				debug!(%request_id, "Relay client went away before reply");
			}
		}
	}

	fn handle(&mut self, request: RelayRequest) -> RelayResponse {
		match request {
			RelayRequest::Enqueue { operations } | RelayRequest::Migrate { operations } => {
				let count = operations.len();
				let mut merged = self.queue.clone();
				merge_by_id(&mut merged, operations);

				match self.commit(merged) {
					Ok(()) => {
						debug!(count, pending = self.queue.len(), "Relay accepted operations");
						RelayResponse::ok()
					}
					Err(e) => RelayResponse::failed(e),
				}
			}

			RelayRequest::Remove { operation_ids } => {
				let ids = operation_ids.into_iter().collect::<HashSet<_>>();
				let mut kept = self.queue.clone();
				kept.retain(|op| !ids.contains(&op.id));

				match self.commit(kept) {
					Ok(()) => RelayResponse::ok(),
					Err(e) => RelayResponse::failed(e),
				}
			}

			RelayRequest::Status => RelayResponse::Status(self.status()),

			RelayRequest::PendingOperations => RelayResponse::Pending {
				operations: self.queue.clone(),
			},

			RelayRequest::Flush => RelayResponse::failed("flush must be handled by the run loop"),
		}
	}

	const fn status(&self) -> RelayStatus {
		RelayStatus {
			pending_count: self.queue.len(),
			is_syncing: self.is_syncing,
			last_sync_at: self.last_sync_at,
		}
	}

	/// Persists `queue` and only then makes it the in-memory queue.
	fn commit(&mut self, queue: Vec<Operation>) -> Result<(), Error> {
		save_json(self.store.as_ref(), &self.queue_key, &queue).map_err(|e| {
			error!(key = %self.queue_key, ?e, "Failed to persist relay queue");
			e
		})?;
		self.queue = queue;

		Ok(())
	}

	/// Sends the whole queue as one batch. Status queries keep being answered while the batch is
	/// in flight; every other request waits in `backlog`.
	#[instrument(skip_all, fields(pending = self.queue.len()))]
	async fn flush(
		&mut self,
		channels: &Channels,
		backlog: &mut VecDeque<RelayEnvelope>,
	) -> RelayFlush {
		enum FlushRace {
			Done(Result<Vec<OperationOutcome>, Error>),
			Request(RelayEnvelope),
			Closed,
		}

		if self.queue.is_empty() {
			self.last_sync_at = Some(self.clock.now());
			return RelayFlush::default();
		}

		self.is_syncing = true;

		let batch = self.queue.clone();
		let remote = Arc::clone(&self.remote);
		let mut patch = pin!(async move { remote.patch_operations(&batch).await });

		let result = loop {
			match (
				patch.as_mut().map(FlushRace::Done),
				channels
					.requests_rx
					.recv()
					.map(|res| res.map_or(FlushRace::Closed, FlushRace::Request)),
			)
				.race()
				.await
			{
				FlushRace::Done(result) => break result,
				FlushRace::Request(RelayEnvelope {
					request_id,
					request: RelayRequest::Status,
				}) => {
					let response = RelayResponse::Status(self.status());
					if channels
						.replies_tx
						.send(RelayReply {
							request_id,
							response,
						})
						.await
						.is_err()
					{
						debug!(%request_id, "Relay client went away before reply");
					}
				}
				FlushRace::Request(envelope) => backlog.push_back(envelope),
				FlushRace::Closed => break patch.as_mut().await,
			}
		};

		self.is_syncing = false;

		let outcomes = match result {
			Ok(outcomes) => outcomes,
			Err(Error::AuthExpired) => self
				.queue
				.iter()
				.map(|op| OperationOutcome::rejected(op.id, Rejection::auth_expired()))
				.collect(),
			// A failed batch counts against every operation in it
			Err(Error::ServerError { status, message }) => {
				warn!(status, %message, "Remote store failed the relay batch");
				self.queue
					.iter()
					.map(|op| {
						OperationOutcome::rejected(
							op.id,
							Rejection::server_error(status, message.clone()),
						)
					})
					.collect()
			}
			Err(e) => {
				warn!(?e, "Relay flush could not reach the remote store");
				let mut retried = self.queue.clone();
				for op in &mut retried {
					op.attempt_count += 1;
				}
				let failed = retried.len();
				let transport_error = match self.commit(retried) {
					Ok(()) => e.to_string(),
					Err(persist) => format!("{e}; relay queue not persisted: {persist}"),
				};

				return RelayFlush {
					synced: 0,
					failed,
					rejected: Vec::new(),
					transport_error: Some(transport_error),
					remaining: self.queue.len(),
				};
			}
		};

		let mut acked = HashSet::new();
		let mut rejections = HashMap::new();
		for outcome in outcomes {
			match outcome.result {
				OutcomeResult::Ack => {
					acked.insert(outcome.operation_id);
				}
				OutcomeResult::Rejected { rejection } => {
					rejections.insert(outcome.operation_id, rejection);
				}
			}
		}

		let mut remaining = self.queue.clone();
		remaining.retain(|op| !acked.contains(&op.id));

		let mut rejected = Vec::with_capacity(rejections.len());
		for op in &mut remaining {
			// Operations without any outcome count as failed attempts too
			op.attempt_count += 1;
			if let Some(rejection) = rejections.remove(&op.id) {
				rejected.push(RejectedOperation {
					operation: op.clone(),
					rejection,
				});
			}
		}

		let synced = self.queue.len() - remaining.len();
		let failed = remaining.len();

		// Acked operations stay queued in memory too, so the next flush resends them
		let transport_error = match self.commit(remaining) {
			Ok(()) => None,
			Err(e) => Some(format!("relay queue not persisted: {e}")),
		};

		if failed == 0 && transport_error.is_none() {
			self.last_sync_at = Some(self.clock.now());
		}

		info!(synced, failed, persisted = transport_error.is_none(), "Relay flush finished");

		RelayFlush {
			synced,
			failed,
			rejected,
			transport_error,
			remaining: self.queue.len(),
		}
	}
}

/// Appends operations not already queued and restores `createdAt` order.
fn merge_by_id(queue: &mut Vec<Operation>, operations: Vec<Operation>) {
	let known = queue.iter().map(|op| op.id).collect::<HashSet<OperationId>>();

	queue.extend(
		operations
			.into_iter()
			.filter(|op| !known.contains(&op.id)),
	);
	queue.sort_by_key(|op| op.timestamp);
}

impl RelayHandle {
	/// A new link to this worker. Only one client should be attached at a time, as replies
	/// are consumed by whichever link receives them first.
	#[must_use]
	pub fn link(&self) -> RelayLink {
		RelayLink::new(self.requests_tx.clone(), self.replies_rx.clone())
	}

	/// Stops the worker after its current request and waits for it to exit.
	pub async fn shutdown(self) {
		let (tx, rx) = oneshot::channel();

		if self.stop_tx.send(tx).await.is_ok() {
			rx.await.ok();
		}

		if let Err(e) = self.handle.await {
			error!(?e, "Background relay task panicked");
		}
	}
}
