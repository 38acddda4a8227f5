use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
	operation::{Operation, OperationId},
	remote::Rejection,
};

/// Request sent to the relay, tagged with a caller-generated correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
	pub request_id: Uuid,
	pub request: RelayRequest,
}

/// Reply to the envelope carrying the same `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReply {
	pub request_id: Uuid,
	pub response: RelayResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayRequest {
	Enqueue { operations: Vec<Operation> },
	/// Hands over the fallback log. Operations already known to the relay are ignored.
	Migrate { operations: Vec<Operation> },
	Status,
	Flush,
	PendingOperations,
	/// Drops operations the caller took ownership of (parked conflicts).
	Remove { operation_ids: Vec<OperationId> },
}

impl RelayRequest {
	#[must_use]
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Enqueue { .. } => "enqueue",
			Self::Migrate { .. } => "migrate",
			Self::Status => "status",
			Self::Flush => "flush",
			Self::PendingOperations => "pending_operations",
			Self::Remove { .. } => "remove",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayResponse {
	Ack {
		success: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<String>,
	},
	Status(RelayStatus),
	Flushed(RelayFlush),
	Pending { operations: Vec<Operation> },
}

impl RelayResponse {
	#[must_use]
	pub const fn ok() -> Self {
		Self::Ack {
			success: true,
			error: None,
		}
	}

	#[must_use]
	pub fn failed(error: impl ToString) -> Self {
		Self::Ack {
			success: false,
			error: Some(error.to_string()),
		}
	}
}

/// `{ pendingCount, isSyncing, lastSyncAt }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
	pub pending_count: usize,
	pub is_syncing: bool,
	pub last_sync_at: Option<DateTime<Utc>>,
}

/// Result of draining the relay queue against the remote store in one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayFlush {
	pub synced: usize,
	pub failed: usize,
	/// Rejected operations as they are now queued (attempt count already bumped).
	pub rejected: Vec<RejectedOperation>,
	/// Set when the batch never reached the remote store; nothing was acknowledged.
	pub transport_error: Option<String>,
	pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOperation {
	pub operation: Operation,
	pub rejection: Rejection,
}
