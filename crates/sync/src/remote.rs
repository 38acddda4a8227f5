//! The authoritative remote copy, as seen by the engine.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
	model::{ItemId, ItemState, TrackedItem},
	operation::{ItemField, Operation, OperationId},
	Error,
};

/// `GET /user` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
	#[serde(default)]
	pub items: Vec<TrackedItem>,
	#[serde(default)]
	pub tombstone_ids: BTreeSet<ItemId>,
}

impl RemoteSnapshot {
	#[must_use]
	pub fn into_state(self) -> ItemState {
		let mut state = ItemState {
			items: Default::default(),
			tombstones: self.tombstone_ids,
		};

		for item in self.items {
			state.insert_live(item);
		}

		state
	}
}

/// Per-operation result of a `PATCH /user` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
	pub operation_id: OperationId,
	#[serde(flatten)]
	pub result: OutcomeResult,
}

impl OperationOutcome {
	#[must_use]
	pub const fn ack(operation_id: OperationId) -> Self {
		Self {
			operation_id,
			result: OutcomeResult::Ack,
		}
	}

	#[must_use]
	pub const fn rejected(operation_id: OperationId, rejection: Rejection) -> Self {
		Self {
			operation_id,
			result: OutcomeResult::Rejected { rejection },
		}
	}

	#[must_use]
	pub const fn is_ack(&self) -> bool {
		matches!(self.result, OutcomeResult::Ack)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum OutcomeResult {
	Ack,
	Rejected { rejection: Rejection },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
	pub reason: RejectionReason,
	#[serde(default)]
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RejectionReason {
	/// Credential invalid or expired. Not a data conflict.
	AuthExpired,
	/// The remote item changed since the local replica last saw it.
	StaleWrite {
		/// The remote's current version; absent when the remote deleted it.
		remote_item: Option<TrackedItem>,
		changed_fields: Vec<ItemField>,
	},
	ServerError { status: u16 },
}

impl Rejection {
	#[must_use]
	pub fn server_error(status: u16, message: impl Into<String>) -> Self {
		Self {
			reason: RejectionReason::ServerError { status },
			message: message.into(),
		}
	}

	#[must_use]
	pub fn auth_expired() -> Self {
		Self {
			reason: RejectionReason::AuthExpired,
			message: "credential expired".to_owned(),
		}
	}
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
	/// `GET /user`
	async fn fetch_user(&self) -> Result<RemoteSnapshot, Error>;

	/// `PATCH /user` with a batch, one outcome per operation.
	///
	/// Transport failures are returned as `Err` and mean no outcome is known; the caller keeps
	/// the whole batch queued.
	async fn patch_operations(&self, operations: &[Operation])
		-> Result<Vec<OperationOutcome>, Error>;

	/// Cheap reachability probe used for verified connectivity.
	async fn probe(&self) -> Result<(), Error>;
}
