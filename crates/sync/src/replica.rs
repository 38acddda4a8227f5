use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use tracing::error;

use crate::{
	model::{ItemState, UserIdentity},
	store::LocalStateStore,
	Error,
};

/// The device's in-memory copy of one user's items, persisted after every change.
///
/// The lock is synchronous and never held across an await point.
pub struct Replica {
	identity: UserIdentity,
	state: RwLock<ItemState>,
	store: LocalStateStore,
}

impl Replica {
	/// Loads the user's namespace. Corrupted contents yield an empty replica.
	pub fn load(identity: UserIdentity, store: LocalStateStore) -> Self {
		let state = store.load(&identity);

		Self {
			identity,
			state: RwLock::new(state),
			store,
		}
	}

	#[must_use]
	pub const fn identity(&self) -> &UserIdentity {
		&self.identity
	}

	#[must_use]
	pub const fn store(&self) -> &LocalStateStore {
		&self.store
	}

	pub fn read(&self) -> RwLockReadGuard<'_, ItemState> {
		self.state.read().unwrap_or_else(PoisonError::into_inner)
	}

	#[must_use]
	pub fn snapshot(&self) -> ItemState {
		self.read().clone()
	}

	/// Applies `f` and persists the result.
	///
	/// The in-memory change stands even when persisting fails; the error is returned for the
	/// caller to report.
	pub fn mutate<R>(&self, f: impl FnOnce(&mut ItemState) -> R) -> (R, Result<(), Error>) {
		let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
		let output = f(&mut state);

		let persisted = self
			.store
			.persist(&state, &self.identity.display_name, self.identity.kind)
			.map_err(|e| {
				error!(user_kind = %self.identity.kind, ?e, "Local change kept in memory only");
				e
			});

		(output, persisted)
	}

	/// Replaces the whole state, e.g. with a rebased copy of the remote.
	pub fn replace(&self, new_state: ItemState) -> Result<(), Error> {
		self.mutate(|state| *state = new_state).1
	}
}
