use std::{
	borrow::Cow,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
	model::{ItemState, UserIdentity, UserKind},
	Error,
};

use super::{load_json, save_json, KeyValueStore, Namespace};

const STATE_VERSION: u32 = 1;

/// Serialized form of a user's tracked items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState<'a> {
	#[serde(default)]
	pub version: u32,
	#[serde(default)]
	pub display_name: Cow<'a, str>,
	pub user_kind: UserKind,
	#[serde(flatten)]
	pub state: Cow<'a, ItemState>,
	#[serde(default)]
	pub saved_at: Option<DateTime<Utc>>,
}

/// Loads and persists [`ItemState`] under the namespace of the user's kind.
#[derive(Clone)]
pub struct LocalStateStore {
	store: Arc<dyn KeyValueStore>,
	prefix: String,
	has_valid_data: Arc<AtomicBool>,
}

impl LocalStateStore {
	pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
		Self {
			store,
			prefix: prefix.into(),
			has_valid_data: Arc::new(AtomicBool::new(false)),
		}
	}

	#[must_use]
	pub fn namespace(&self, kind: UserKind) -> Namespace {
		Namespace::new(self.prefix.clone(), kind)
	}

	#[must_use]
	pub fn backend(&self) -> Arc<dyn KeyValueStore> {
		Arc::clone(&self.store)
	}

	/// Reads the user's items and tombstones.
	///
	/// Never fails: unreadable or malformed contents are logged and yield an empty state.
	pub fn load(&self, identity: &UserIdentity) -> ItemState {
		let key = self.namespace(identity.kind).key(Namespace::STATE);

		let mut state = match load_json::<PersistedState<'static>>(self.store.as_ref(), &key) {
			Ok(Some(persisted)) => persisted.state.into_owned(),
			Ok(None) => {
				debug!(%key, "No persisted state, starting empty");
				ItemState::default()
			}
			Err(e) => {
				error!(%key, ?e, "Persisted state unreadable, resetting to empty state");
				ItemState::default()
			}
		};

		// An id can't be both live and deleted; the tombstone wins.
		let ItemState { items, tombstones } = &mut state;
		items.retain(|id, _| {
			let keep = !tombstones.contains(id);
			if !keep {
				warn!(item_id = %id, "Dropping live item that is also tombstoned");
			}
			keep
		});

		self.has_valid_data
			.store(!state.is_empty(), Ordering::Release);

		state
	}

	/// Writes the state synchronously. UI flags are never part of the serialized form.
	pub fn persist(
		&self,
		state: &ItemState,
		display_name: &str,
		user_kind: UserKind,
	) -> Result<(), Error> {
		let key = self.namespace(user_kind).key(Namespace::STATE);

		let persisted = PersistedState {
			version: STATE_VERSION,
			display_name: Cow::Borrowed(display_name),
			user_kind,
			state: Cow::Borrowed(state),
			saved_at: Some(Utc::now()),
		};

		save_json(self.store.as_ref(), &key, &persisted).map_err(|e| {
			error!(%key, ?e, "Failed to persist local state");
			e
		})?;

		self.has_valid_data
			.store(!state.is_empty(), Ordering::Release);

		Ok(())
	}

	/// Whether the last load or persist saw at least one item or tombstone.
	///
	/// Tells "empty because new" apart from "empty because the stored data was corrupt" only in
	/// combination with the store still holding a value.
	#[must_use]
	pub fn has_valid_data(&self) -> bool {
		self.has_valid_data.load(Ordering::Acquire)
	}
}
