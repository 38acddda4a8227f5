use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use async_channel as chan;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
	config::TimeoutConfig,
	operation::{Operation, OperationId},
	Error,
};

use super::{
	protocol::{RelayEnvelope, RelayFlush, RelayReply, RelayRequest, RelayResponse, RelayStatus},
	RelayLink,
};

type PendingTable = Arc<Mutex<HashMap<Uuid, oneshot::Sender<RelayResponse>>>>;

/// Caller side of the relay protocol.
///
/// Each request gets a fresh correlation id and an entry in the pending table; a dispatcher
/// task completes the entry when the matching reply arrives. A timeout removes the entry, so a
/// late reply is dropped instead of completing someone else's request.
#[derive(Clone)]
pub struct RelayClient {
	inner: Arc<Inner>,
}

struct Inner {
	attached: Mutex<Option<Attached>>,
	pending: PendingTable,
	timeouts: TimeoutConfig,
}

struct Attached {
	requests: chan::Sender<RelayEnvelope>,
	dispatcher: JoinHandle<()>,
}

impl Drop for Attached {
	fn drop(&mut self) {
		self.dispatcher.abort();
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayClient {
	#[must_use]
	pub fn new(timeouts: TimeoutConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				attached: Mutex::new(None),
				pending: Arc::default(),
				timeouts,
			}),
		}
	}

	/// Connects to a relay. Must be called from within a tokio runtime.
	///
	/// Returns `true` when this is a transition from unreachable to reachable, which is the
	/// caller's cue to migrate the fallback log.
	pub fn attach(&self, link: RelayLink) -> bool {
		let was_reachable = self.is_reachable();

		let RelayLink { requests, replies } = link;
		let dispatcher = tokio::spawn(dispatch(replies, Arc::clone(&self.inner.pending)));

		let previous = lock(&self.inner.attached).replace(Attached {
			requests,
			dispatcher,
		});
		drop(previous);

		debug!(was_reachable, "Relay attached");

		!was_reachable
	}

	/// Forgets the current relay. In-flight requests fail with [`Error::RelayUnavailable`].
	pub fn detach(&self) {
		if lock(&self.inner.attached).take().is_some() {
			lock(&self.inner.pending).clear();
			debug!("Relay detached");
		}
	}

	#[must_use]
	pub fn is_reachable(&self) -> bool {
		lock(&self.inner.attached)
			.as_ref()
			.is_some_and(|attached| !attached.requests.is_closed() && !attached.dispatcher.is_finished())
	}

	#[instrument(skip_all, fields(request = request.name(), timeout = ?timeout), err(Debug))]
	async fn request(
		&self,
		request: RelayRequest,
		timeout: Duration,
	) -> Result<RelayResponse, Error> {
		let requests = lock(&self.inner.attached)
			.as_ref()
			.map(|attached| attached.requests.clone())
			.ok_or(Error::RelayUnavailable)?;

		let request_id = Uuid::new_v4();
		let (tx, rx) = oneshot::channel();
		lock(&self.inner.pending).insert(request_id, tx);

		let exchange = async {
			requests
				.send(RelayEnvelope {
					request_id,
					request,
				})
				.await
				.map_err(|_| Error::RelayUnavailable)?;

			rx.await.map_err(|_| Error::RelayUnavailable)
		};

		let result = match tokio::time::timeout(timeout, exchange).await {
			Ok(result) => result,
			Err(_) => Err(Error::RelayTimeout(timeout)),
		};

		if result.is_err() {
			lock(&self.inner.pending).remove(&request_id);
		}

		result
	}

	/// Never fails: an unreachable or unresponsive relay yields the empty default.
	pub async fn status(&self) -> RelayStatus {
		match self
			.request(RelayRequest::Status, self.inner.timeouts.status_query())
			.await
		{
			Ok(RelayResponse::Status(status)) => status,
			Ok(other) => {
				warn!(?other, "Unexpected relay reply to status query");
				RelayStatus::default()
			}
			Err(e) => {
				debug!(?e, "Relay status unavailable, assuming empty");
				RelayStatus::default()
			}
		}
	}

	pub async fn enqueue(&self, operations: Vec<Operation>) -> Result<(), Error> {
		let response = self
			.request(
				RelayRequest::Enqueue { operations },
				self.inner.timeouts.status_query(),
			)
			.await?;

		expect_ack(response, "enqueue")
	}

	/// Timeout or a negative ack is a failure; the caller keeps its copy.
	pub async fn migrate(&self, operations: Vec<Operation>) -> Result<(), Error> {
		let response = self
			.request(
				RelayRequest::Migrate { operations },
				self.inner.timeouts.migration(),
			)
			.await?;

		expect_ack(response, "migrate")
	}

	pub async fn flush(&self) -> Result<RelayFlush, Error> {
		match self
			.request(RelayRequest::Flush, self.inner.timeouts.bulk())
			.await?
		{
			RelayResponse::Flushed(report) => Ok(report),
			RelayResponse::Ack {
				success: false,
				error,
			} => Err(Error::RelayRejected(error.unwrap_or_default())),
			_ => Err(Error::UnexpectedRelayResponse("flush")),
		}
	}

	pub async fn pending_operations(&self) -> Result<Vec<Operation>, Error> {
		match self
			.request(
				RelayRequest::PendingOperations,
				self.inner.timeouts.status_query(),
			)
			.await?
		{
			RelayResponse::Pending { operations } => Ok(operations),
			_ => Err(Error::UnexpectedRelayResponse("pending_operations")),
		}
	}

	pub async fn remove(&self, operation_ids: Vec<OperationId>) -> Result<(), Error> {
		let response = self
			.request(
				RelayRequest::Remove { operation_ids },
				self.inner.timeouts.status_query(),
			)
			.await?;

		expect_ack(response, "remove")
	}
}

fn expect_ack(response: RelayResponse, request: &'static str) -> Result<(), Error> {
	match response {
		RelayResponse::Ack { success: true, .. } => Ok(()),
		RelayResponse::Ack {
			success: false,
			error,
		} => Err(Error::RelayRejected(error.unwrap_or_default())),
		_ => Err(Error::UnexpectedRelayResponse(request)),
	}
}

async fn dispatch(replies: chan::Receiver<RelayReply>, pending: PendingTable) {
	while let Ok(RelayReply {
		request_id,
		response,
	}) = replies.recv().await
	{
		let waiter = lock(&pending).remove(&request_id);

		match waiter {
			Some(tx) => {
				if tx.send(response).is_err() {
					trace!(%request_id, "Relay requester went away");
				}
			}
			None => debug!(%request_id, "Dropping reply to unknown or timed out request"),
		}
	}

	debug!("Relay reply channel closed");
	lock(&pending).clear();
}
