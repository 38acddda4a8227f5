//! Queued mutation intents.
//!
//! Operations are the only way a [`TrackedItem`](crate::TrackedItem) changes. They are persisted
//! and replayed, so every payload carries absolute values (see [`ItemState::apply`]).
//!
//! Wire shape: `{ "id", "type", "data", "timestamp", "attemptCount" }`.
//!
//! [`ItemState::apply`]: crate::ItemState::apply

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
	clock::Clock,
	model::{ItemId, ItemSeed},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	#[must_use]
	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for OperationId {
	fn default() -> Self {
		Self::new()
	}
}

impl From<Uuid> for OperationId {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl fmt::Display for OperationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
	pub id: OperationId,
	#[serde(flatten)]
	pub kind: OperationKind,
	/// Creation time, epoch milliseconds.
	pub timestamp: i64,
	#[serde(default)]
	pub attempt_count: u32,
}

impl Operation {
	pub fn new(kind: OperationKind, clock: &dyn Clock) -> Self {
		Self {
			id: OperationId::new(),
			kind,
			timestamp: clock.now().timestamp_millis(),
			attempt_count: 0,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum OperationKind {
	/// Writes absolute status, index and date; replay rewrites the same values.
	MarkSolved {
		item_id: ItemId,
		review_interval_index: usize,
		next_review_date: NaiveDate,
	},
	/// Clears the tombstone (if any) and returns the item to its default progress. Carries the
	/// seed, so replay after a delete still recreates the same item.
	ResetItem { seed: ItemSeed },
	/// Replaces the whole note.
	SetNote { item_id: ItemId, note: String },
	/// Absolute index and date, like `MarkSolved`.
	UpdateReviewSchedule {
		item_id: ItemId,
		review_interval_index: usize,
		next_review_date: Option<NaiveDate>,
	},
	/// Unconditional, so it converges whether it lands before or after edits to the same id.
	DeleteItem { item_id: ItemId },
	/// No-op when the id already exists or was deleted.
	CreateCustomItem { seed: ItemSeed },
	/// Removes a whole user-created category in one operation.
	DeleteCategory {
		category: String,
		item_ids: Vec<ItemId>,
	},
	ResetCategory {
		category: String,
		items: Vec<ItemSeed>,
	},
}

/// Coarse field groups an operation writes, compared against the fields a remote
/// rejection reports as changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemField {
	Status,
	ReviewSchedule,
	Note,
	/// Creation, deletion and tombstone membership.
	Existence,
}

impl OperationKind {
	#[must_use]
	pub const fn name(&self) -> &'static str {
		match self {
			Self::MarkSolved { .. } => "MarkSolved",
			Self::ResetItem { .. } => "ResetItem",
			Self::SetNote { .. } => "SetNote",
			Self::UpdateReviewSchedule { .. } => "UpdateReviewSchedule",
			Self::DeleteItem { .. } => "DeleteItem",
			Self::CreateCustomItem { .. } => "CreateCustomItem",
			Self::DeleteCategory { .. } => "DeleteCategory",
			Self::ResetCategory { .. } => "ResetCategory",
		}
	}

	#[must_use]
	pub fn touched_fields(&self) -> &'static [ItemField] {
		use ItemField::{Existence, Note, ReviewSchedule, Status};

		match self {
			Self::MarkSolved { .. } | Self::UpdateReviewSchedule { .. } => &[Status, ReviewSchedule],
			Self::SetNote { .. } => &[Note],
			Self::ResetItem { .. } | Self::ResetCategory { .. } => {
				&[Status, ReviewSchedule, Existence]
			}
			Self::DeleteItem { .. } | Self::CreateCustomItem { .. } | Self::DeleteCategory { .. } => {
				&[Existence]
			}
		}
	}

	#[must_use]
	pub fn item_ids(&self) -> Vec<&str> {
		match self {
			Self::MarkSolved { item_id, .. }
			| Self::SetNote { item_id, .. }
			| Self::UpdateReviewSchedule { item_id, .. }
			| Self::DeleteItem { item_id } => vec![item_id.as_str()],
			Self::ResetItem { seed } | Self::CreateCustomItem { seed } => vec![seed.id.as_str()],
			Self::DeleteCategory { item_ids, .. } => item_ids.iter().map(String::as_str).collect(),
			Self::ResetCategory { items, .. } => items.iter().map(|seed| seed.id.as_str()).collect(),
		}
	}
}
