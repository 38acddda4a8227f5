//! Observable sync status
//!
//! A single [`SyncStatus`] value published on a `watch` channel: subscribers always see the
//! latest state and never lag behind a burst of intermediate updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
	pub is_online: bool,
	/// True for at most one in-flight flush.
	pub is_syncing: bool,
	/// Operations durably recorded but not yet acknowledged by the remote store.
	pub pending_count: usize,
	pub last_sync_at: Option<DateTime<Utc>>,
	pub has_conflicts: bool,
	pub conflict_message: Option<String>,
	/// The remote rejected the credential; sync is paused until re-authentication.
	pub needs_reauth: bool,
	/// Set once a failure needs the user's attention.
	pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusBus {
	sender: watch::Sender<SyncStatus>,
}

impl Default for StatusBus {
	fn default() -> Self {
		Self::new()
	}
}

impl StatusBus {
	#[must_use]
	pub fn new() -> Self {
		let (sender, _) = watch::channel(SyncStatus::default());
		Self { sender }
	}

	#[must_use]
	pub fn current(&self) -> SyncStatus {
		self.sender.borrow().clone()
	}

	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
		self.sender.subscribe()
	}

	/// Applies `f` and notifies subscribers only when the status actually changed.
	pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
		self.sender.send_if_modified(|status| {
			let before = status.clone();
			f(status);

			let changed = *status != before;
			if changed {
				trace!(?status, "Sync status changed");
			}
			changed
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscribers_see_latest_value_only_on_change() {
		let bus = StatusBus::new();
		let mut rx = bus.subscribe();

		bus.update(|status| status.pending_count = 3);
		rx.changed().await.unwrap();
		assert_eq!(rx.borrow_and_update().pending_count, 3);

		bus.update(|status| status.pending_count = 3);
		assert!(!rx.has_changed().unwrap());

		bus.update(|status| status.is_online = true);
		assert!(rx.has_changed().unwrap());
		assert!(bus.current().is_online);
	}
}
