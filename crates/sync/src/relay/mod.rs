//! Background relay
//!
//! The relay is an execution context independent of the caller: a tokio task that owns its
//! own durable queue and keeps retrying against the remote store. Nothing is shared with it;
//! every exchange is a [`RelayEnvelope`] answered by a [`RelayReply`] with the same id.

use async_channel as chan;

mod client;
mod protocol;
mod worker;

pub use client::RelayClient;
pub use protocol::{
	RejectedOperation, RelayEnvelope, RelayFlush, RelayReply, RelayRequest, RelayResponse,
	RelayStatus,
};
pub use worker::{RelayHandle, RelayWorker};

/// Both channel ends a client needs to talk to one relay.
#[derive(Debug, Clone)]
pub struct RelayLink {
	pub(crate) requests: chan::Sender<RelayEnvelope>,
	pub(crate) replies: chan::Receiver<RelayReply>,
}

impl RelayLink {
	#[must_use]
	pub const fn new(
		requests: chan::Sender<RelayEnvelope>,
		replies: chan::Receiver<RelayReply>,
	) -> Self {
		Self { requests, replies }
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.requests.is_closed()
	}
}
