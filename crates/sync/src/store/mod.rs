//! Synchronous durable key-value storage and the namespaced state store built on it.

use std::{
	collections::HashMap,
	sync::{Mutex, MutexGuard},
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

use crate::{error::StoreError, model::UserKind, Error};

mod file;
mod state;

pub use file::FileStore;
pub use state::{LocalStateStore, PersistedState};

/// Durable local storage, accessed synchronously.
pub trait KeyValueStore: Send + Sync {
	fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

	fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

	fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Key scheme `{prefix}:{local|linked}:{name}`.
///
/// Local and linked users never share a key, so switching user kind can't merge their data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
	prefix: String,
	kind: UserKind,
}

impl Namespace {
	pub const STATE: &'static str = "state";
	pub const FALLBACK_LOG: &'static str = "fallback-log";
	pub const RELAY_QUEUE: &'static str = "relay-queue";
	pub const CONFLICTS: &'static str = "conflicts";

	#[must_use]
	pub fn new(prefix: impl Into<String>, kind: UserKind) -> Self {
		Self {
			prefix: prefix.into(),
			kind,
		}
	}

	#[must_use]
	pub fn key(&self, name: &str) -> String {
		format!("{}:{}:{name}", self.prefix, self.kind)
	}

	#[must_use]
	pub const fn kind(&self) -> UserKind {
		self.kind
	}

	#[must_use]
	pub fn prefix(&self) -> &str {
		&self.prefix
	}
}

/// Reads and decodes a JSON value. Malformed contents map to [`Error::CorruptedLocalData`].
pub(crate) fn load_json<T: DeserializeOwned>(
	store: &dyn KeyValueStore,
	key: &str,
) -> Result<Option<T>, Error> {
	store
		.get(key)?
		.map(|raw| {
			serde_json::from_str(&raw).map_err(|source| Error::CorruptedLocalData {
				key: key.to_owned(),
				source,
			})
		})
		.transpose()
}

pub(crate) fn save_json<T: Serialize + ?Sized>(
	store: &dyn KeyValueStore,
	key: &str,
	value: &T,
) -> Result<(), Error> {
	let raw = serde_json::to_string(value)?;
	trace!(%key, bytes = raw.len(), "Writing durable key");

	store.set(key, &raw).map_err(Into::into)
}

/// In-process store with an optional byte quota over all keys and values.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, String>>,
	quota_bytes: Option<usize>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_quota(quota_bytes: usize) -> Self {
		Self {
			entries: Mutex::default(),
			quota_bytes: Some(quota_bytes),
		}
	}

	fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, StoreError> {
		self.entries.lock().map_err(|_| StoreError::Poisoned)
	}
}

impl KeyValueStore for MemoryStore {
	fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		Ok(self.entries()?.get(key).cloned())
	}

	fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let mut entries = self.entries()?;

		if let Some(limit) = self.quota_bytes {
			let others = entries
				.iter()
				.filter(|(existing, _)| existing.as_str() != key)
				.map(|(k, v)| k.len() + v.len())
				.sum::<usize>();
			let needed = others + key.len() + value.len();

			if needed > limit {
				return Err(StoreError::QuotaExceeded {
					key: key.to_owned(),
					needed,
					limit,
				});
			}
		}

		entries.insert(key.to_owned(), value.to_owned());

		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), StoreError> {
		self.entries()?.remove(key);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn namespaces_do_not_collide() {
		let local = Namespace::new("tracker", UserKind::Local);
		let linked = Namespace::new("tracker", UserKind::Linked);

		assert_eq!(local.key(Namespace::STATE), "tracker:local:state");
		assert_ne!(local.key(Namespace::STATE), linked.key(Namespace::STATE));
	}

	#[test]
	fn quota_rejects_oversized_writes_and_keeps_old_value() {
		let store = MemoryStore::with_quota(32);
		store.set("k", "small").unwrap();

		let err = store.set("k", &"x".repeat(64)).unwrap_err();
		assert!(matches!(err, StoreError::QuotaExceeded { limit: 32, .. }));
		assert_eq!(store.get("k").unwrap().as_deref(), Some("small"));
	}

	#[test]
	fn malformed_json_is_reported_as_corruption() {
		let store = MemoryStore::new();
		store.set("k", "{not json").unwrap();

		let err = load_json::<Vec<u32>>(&store, "k").unwrap_err();
		assert_eq!(err.kind(), crate::ErrorKind::CorruptedLocalData);
	}
}
