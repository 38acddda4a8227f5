use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::operation::OperationKind;

/// Stable catalog key, or a generated id for user-created items.
pub type ItemId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
	#[default]
	Unsolved,
	Solved,
}

/// Presentation state owned by the UI. Never serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UiFlags {
	pub expanded: bool,
	pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedItem {
	pub id: ItemId,
	pub status: ItemStatus,
	pub category: String,
	#[serde(default)]
	pub subcategory: String,
	#[serde(default)]
	pub review_interval_index: usize,
	#[serde(default)]
	pub next_review_date: Option<NaiveDate>,
	#[serde(default)]
	pub note: String,
	#[serde(default)]
	pub is_custom: bool,
	#[serde(skip)]
	pub ui: UiFlags,
}

impl TrackedItem {
	/// Fresh unsolved item, as created by a catalog sync or a reset of a deleted item.
	#[must_use]
	pub fn from_seed(seed: &ItemSeed) -> Self {
		Self {
			id: seed.id.clone(),
			status: ItemStatus::Unsolved,
			category: seed.category.clone(),
			subcategory: seed.subcategory.clone(),
			review_interval_index: 0,
			next_review_date: None,
			note: String::new(),
			is_custom: seed.is_custom,
			ui: UiFlags::default(),
		}
	}

	#[must_use]
	pub fn seed(&self) -> ItemSeed {
		ItemSeed {
			id: self.id.clone(),
			category: self.category.clone(),
			subcategory: self.subcategory.clone(),
			is_custom: self.is_custom,
		}
	}

	/// Same persisted content, ignoring UI flags.
	#[must_use]
	pub fn same_content(&self, other: &Self) -> bool {
		Self {
			ui: UiFlags::default(),
			..self.clone()
		} == Self {
			ui: UiFlags::default(),
			..other.clone()
		}
	}

	fn reset_progress(&mut self) {
		self.status = ItemStatus::Unsolved;
		self.review_interval_index = 0;
		self.next_review_date = None;
	}
}

/// Everything needed to (re)create an item in its default state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSeed {
	pub id: ItemId,
	pub category: String,
	#[serde(default)]
	pub subcategory: String,
	#[serde(default)]
	pub is_custom: bool,
}

/// Live items plus the ids the user deliberately removed.
///
/// An id is never both live and tombstoned: every mutation goes through [`ItemState::apply`],
/// which keeps the two sets disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
	#[serde(default)]
	pub items: BTreeMap<ItemId, TrackedItem>,
	#[serde(default)]
	pub tombstones: BTreeSet<ItemId>,
}

impl ItemState {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty() && self.tombstones.is_empty()
	}

	#[must_use]
	pub fn get(&self, id: &str) -> Option<&TrackedItem> {
		self.items.get(id)
	}

	#[must_use]
	pub fn is_tombstoned(&self, id: &str) -> bool {
		self.tombstones.contains(id)
	}

	pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a TrackedItem> {
		self.items
			.values()
			.filter(move |item| item.category == category)
	}

	/// Inserts an item unless its id is tombstoned. Returns whether it was inserted.
	pub fn insert_live(&mut self, item: TrackedItem) -> bool {
		if self.tombstones.contains(&item.id) {
			return false;
		}

		self.items.insert(item.id.clone(), item);
		true
	}

	/// Applies one operation.
	///
	/// Every payload carries absolute values, so applying the same operation twice leaves the
	/// same state as applying it once. Deletion is unconditional and edits addressed to a
	/// missing or tombstoned item are dropped, so a delete converges whether it arrives before
	/// or after edits to the same id.
	pub fn apply(&mut self, kind: &OperationKind) {
		match kind {
			OperationKind::MarkSolved {
				item_id,
				review_interval_index,
				next_review_date,
			} => {
				if let Some(item) = self.items.get_mut(item_id) {
					item.status = ItemStatus::Solved;
					item.review_interval_index = *review_interval_index;
					item.next_review_date = Some(*next_review_date);
				}
			}

			OperationKind::UpdateReviewSchedule {
				item_id,
				review_interval_index,
				next_review_date,
			} => {
				if let Some(item) = self.items.get_mut(item_id) {
					item.review_interval_index = *review_interval_index;
					item.next_review_date = *next_review_date;
					item.status = if next_review_date.is_some() {
						ItemStatus::Solved
					} else {
						ItemStatus::Unsolved
					};
				}
			}

			OperationKind::SetNote { item_id, note } => {
				if let Some(item) = self.items.get_mut(item_id) {
					item.note.clone_from(note);
				}
			}

			OperationKind::ResetItem { seed } => self.reset(seed),

			OperationKind::ResetCategory { items, .. } => {
				for seed in items {
					self.reset(seed);
				}
			}

			OperationKind::DeleteItem { item_id } => self.tombstone(item_id),

			OperationKind::DeleteCategory { item_ids, .. } => {
				for item_id in item_ids {
					self.tombstone(item_id);
				}
			}

			OperationKind::CreateCustomItem { seed } => {
				if !self.items.contains_key(&seed.id) {
					self.insert_live(TrackedItem::from_seed(seed));
				}
			}
		}
	}

	fn tombstone(&mut self, id: &str) {
		self.items.remove(id);
		self.tombstones.insert(id.to_owned());
	}

	fn reset(&mut self, seed: &ItemSeed) {
		self.tombstones.remove(&seed.id);

		self.items
			.entry(seed.id.clone())
			.and_modify(TrackedItem::reset_progress)
			.or_insert_with(|| TrackedItem::from_seed(seed));
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserKind {
	/// Anonymous user whose data lives only on this device.
	Local,
	/// User signed in to the remote store.
	Linked,
}

impl UserKind {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Local => "local",
			Self::Linked => "linked",
		}
	}
}

impl fmt::Display for UserKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
	pub kind: UserKind,
	pub id: String,
	pub display_name: String,
}

impl UserIdentity {
	#[must_use]
	pub fn local(display_name: impl Into<String>) -> Self {
		Self {
			kind: UserKind::Local,
			id: "local".to_owned(),
			display_name: display_name.into(),
		}
	}

	#[must_use]
	pub fn linked(id: impl Into<String>, display_name: impl Into<String>) -> Self {
		Self {
			kind: UserKind::Linked,
			id: id.into(),
			display_name: display_name.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
	pub id: ItemId,
	pub category: String,
	#[serde(default)]
	pub subcategory: String,
}

impl From<&CatalogEntry> for ItemSeed {
	fn from(entry: &CatalogEntry) -> Self {
		Self {
			id: entry.id.clone(),
			category: entry.category.clone(),
			subcategory: entry.subcategory.clone(),
			is_custom: false,
		}
	}
}

/// The canonical, curated list of problems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
	entries: Vec<CatalogEntry>,
}

impl Catalog {
	#[must_use]
	pub const fn new(entries: Vec<CatalogEntry>) -> Self {
		Self { entries }
	}

	#[must_use]
	pub fn entries(&self) -> &[CatalogEntry] {
		&self.entries
	}

	#[must_use]
	pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
		self.entries.iter().find(|entry| entry.id == id)
	}

	pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a CatalogEntry> {
		self.entries
			.iter()
			.filter(move |entry| entry.category == category)
	}

	#[must_use]
	pub fn has_category(&self, category: &str) -> bool {
		self.in_category(category).next().is_some()
	}
}
