//! Classification of remote rejections and the durable log of unresolved conflicts.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
	model::{ItemId, ItemState, TrackedItem},
	operation::{ItemField, Operation, OperationId, OperationKind},
	remote::{Rejection, RejectionReason},
	store::{load_json, save_json, KeyValueStore, Namespace},
	Error,
};

/// What to do with one rejected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
	/// Keep the operation queued. `surface` is set once retries are exhausted.
	Retry { surface: bool },
	/// Credential problem, not a data conflict: pause sync, keep the operation.
	ReauthRequired,
	/// The remote changed fields disjoint from the local edit. `item` is the remote item with
	/// the local edit applied on top (`None` if the result is a deletion); the operation stays
	/// queued and is retried.
	Reconciled {
		item_id: ItemId,
		item: Option<TrackedItem>,
	},
	/// Overlapping edits. Parked for an explicit user decision.
	Conflict(ConflictRecord),
}

/// Both sides of a conflict, kept until the user picks one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
	pub operation: Operation,
	pub item_id: ItemId,
	pub local_item: Option<TrackedItem>,
	pub remote_item: Option<TrackedItem>,
	pub changed_fields: Vec<ItemField>,
	pub message: String,
	pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictChoice {
	/// Re-send the local edit as a new operation.
	KeepLocal,
	/// Adopt the remote item and drop the local edit.
	KeepRemote,
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
	max_attempts: u32,
}

impl ConflictResolver {
	#[must_use]
	pub const fn new(max_attempts: u32) -> Self {
		Self { max_attempts }
	}

	/// Classifies a rejection. `operation.attempt_count` must already include the failed attempt.
	#[must_use]
	pub fn resolve(
		&self,
		operation: &Operation,
		rejection: &Rejection,
		local: &ItemState,
		now: DateTime<Utc>,
	) -> Resolution {
		let resolution = match &rejection.reason {
			RejectionReason::AuthExpired => Resolution::ReauthRequired,

			RejectionReason::ServerError { .. } => Resolution::Retry {
				surface: operation.attempt_count >= self.max_attempts,
			},

			RejectionReason::StaleWrite {
				remote_item,
				changed_fields,
			} => Self::resolve_stale_write(operation, remote_item.as_ref(), changed_fields, local, now),
		};

		debug!(
			operation_id = %operation.id,
			operation = operation.kind.name(),
			?resolution,
			"Classified remote rejection"
		);

		resolution
	}

	fn resolve_stale_write(
		operation: &Operation,
		remote_item: Option<&TrackedItem>,
		changed_fields: &[ItemField],
		local: &ItemState,
		now: DateTime<Utc>,
	) -> Resolution {
		let item_id = remote_item.map_or_else(
			|| {
				operation
					.kind
					.item_ids()
					.first()
					.map(|id| (*id).to_owned())
					.unwrap_or_default()
			},
			|item| item.id.clone(),
		);

		let is_deletion = matches!(
			operation.kind,
			OperationKind::DeleteItem { .. } | OperationKind::DeleteCategory { .. }
		);

		// Both sides deleted it
		if remote_item.is_none() && is_deletion {
			return Resolution::Reconciled {
				item_id,
				item: None,
			};
		}

		let disjoint = operation
			.kind
			.touched_fields()
			.iter()
			.all(|field| !changed_fields.contains(field));

		if let (true, Some(remote)) = (disjoint, remote_item) {
			let mut merged = ItemState::default();
			merged.insert_live(remote.clone());
			merged.apply(&operation.kind);

			return Resolution::Reconciled {
				item: merged.items.remove(&item_id),
				item_id,
			};
		}

		let message = format!(
			"Your {} on '{item_id}' conflicts with a change to {} made elsewhere",
			operation.kind.name(),
			describe_fields(changed_fields, remote_item.is_none()),
		);

		Resolution::Conflict(ConflictRecord {
			operation: operation.clone(),
			local_item: local.get(&item_id).cloned(),
			item_id,
			remote_item: remote_item.cloned(),
			changed_fields: changed_fields.to_vec(),
			message,
			detected_at: now,
		})
	}
}

fn describe_fields(fields: &[ItemField], remote_deleted: bool) -> String {
	if remote_deleted {
		return "its existence (it was deleted)".to_owned();
	}

	let names = fields
		.iter()
		.map(|field| match field {
			ItemField::Status => "status",
			ItemField::ReviewSchedule => "review schedule",
			ItemField::Note => "note",
			ItemField::Existence => "existence",
		})
		.collect::<Vec<_>>();

	if names.is_empty() {
		"the item".to_owned()
	} else {
		names.join(", ")
	}
}

/// Durable list of conflicts awaiting a user decision, under `{ns}:conflicts`.
pub struct ConflictLog {
	store: Arc<dyn KeyValueStore>,
	key: String,
	lock: Mutex<()>,
}

impl ConflictLog {
	pub fn new(store: Arc<dyn KeyValueStore>, namespace: &Namespace) -> Self {
		Self {
			store,
			key: namespace.key(Namespace::CONFLICTS),
			lock: Mutex::new(()),
		}
	}

	#[must_use]
	pub fn list(&self) -> Vec<ConflictRecord> {
		let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
		self.read()
	}

	/// Stores a conflict. Parking the same operation again replaces the earlier record.
	pub fn park(&self, record: ConflictRecord) -> Result<(), Error> {
		let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

		let mut records = self.read();
		records.retain(|existing| existing.operation.id != record.operation.id);

		warn!(
			operation_id = %record.operation.id,
			item_id = %record.item_id,
			"Parking sync conflict for user resolution"
		);
		records.push(record);

		save_json(self.store.as_ref(), &self.key, &records)
	}

	/// Removes and returns the conflict for `operation_id`.
	pub fn take(&self, operation_id: OperationId) -> Result<Option<ConflictRecord>, Error> {
		let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

		let mut records = self.read();
		let Some(position) = records
			.iter()
			.position(|record| record.operation.id == operation_id)
		else {
			return Ok(None);
		};

		let record = records.remove(position);
		if records.is_empty() {
			self.store.remove(&self.key)?;
		} else {
			save_json(self.store.as_ref(), &self.key, &records)?;
		}

		info!(%operation_id, "Conflict resolved");

		Ok(Some(record))
	}

	/// The `conflict_message` shown to the user, if any conflict is open.
	#[must_use]
	pub fn summary(&self) -> Option<String> {
		let records = self.list();

		match records.as_slice() {
			[] => None,
			[only] => Some(only.message.clone()),
			[first, rest @ ..] => Some(format!(
				"{} (and {} more conflicts)",
				first.message,
				rest.len()
			)),
		}
	}

	fn read(&self) -> Vec<ConflictRecord> {
		load_json::<Vec<ConflictRecord>>(self.store.as_ref(), &self.key)
			.unwrap_or_else(|e| {
				error!(key = %self.key, ?e, "Conflict log unreadable, treating as empty");
				None
			})
			.unwrap_or_default()
	}
}
