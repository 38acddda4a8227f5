//! Verified, debounced connectivity
//!
//! Platform online/offline reports are only hints. A report opens a debounce window; when it
//! closes without a newer report, reachability is verified by probing the remote store. Only
//! verified transitions are published.

use std::{
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, PoisonError, RwLock,
	},
	time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::{remote::RemoteStore, status::StatusBus};

const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityEvent {
	Online,
	Offline,
}

/// Work to run once per confirmed offline to online transition.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
	async fn on_reconnect(&self);
}

#[derive(Clone)]
pub struct ConnectivityDetector {
	inner: Arc<Inner>,
}

struct Inner {
	remote: Arc<dyn RemoteStore>,
	probe_timeout: Duration,
	debounce: Duration,
	generation: AtomicU64,
	online: AtomicBool,
	events: broadcast::Sender<ConnectivityEvent>,
	hook: RwLock<Option<Arc<dyn ReconnectHook>>>,
	reconnecting: AtomicBool,
	status: StatusBus,
}

/// Clears the re-entrancy flag even if the hook panics.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl ConnectivityDetector {
	pub fn new(
		remote: Arc<dyn RemoteStore>,
		probe_timeout: Duration,
		debounce: Duration,
		status: StatusBus,
	) -> Self {
		let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

		Self {
			inner: Arc::new(Inner {
				remote,
				probe_timeout,
				debounce,
				generation: AtomicU64::new(0),
				online: AtomicBool::new(false),
				events,
				hook: RwLock::new(None),
				reconnecting: AtomicBool::new(false),
				status,
			}),
		}
	}

	pub fn set_reconnect_hook(&self, hook: Arc<dyn ReconnectHook>) {
		*self
			.inner
			.hook
			.write()
			.unwrap_or_else(PoisonError::into_inner) = Some(hook);
	}

	/// Verified check: probes the remote store, bounded by the probe timeout.
	pub async fn is_online(&self) -> bool {
		match tokio::time::timeout(self.inner.probe_timeout, self.inner.remote.probe()).await {
			Ok(Ok(())) => true,
			Ok(Err(e)) => {
				debug!(?e, "Connectivity probe failed");
				false
			}
			Err(_) => {
				debug!(timeout = ?self.inner.probe_timeout, "Connectivity probe timed out");
				false
			}
		}
	}

	/// Last verified state, without probing.
	#[must_use]
	pub fn last_known(&self) -> bool {
		self.inner.online.load(Ordering::Acquire)
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
		self.inner.events.subscribe()
	}

	/// Calls `callback` for every debounced, verified transition until the handle is aborted.
	pub fn on_change(
		&self,
		callback: impl Fn(ConnectivityEvent) + Send + Sync + 'static,
	) -> JoinHandle<()> {
		let mut events = self.subscribe();

		tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(event) => callback(event),
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, "Connectivity listener lagged behind");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		})
	}

	/// Feeds an unreliable platform report. Reports closer together than the debounce window
	/// collapse into one verification of the latest report.
	pub fn report_platform_status(&self, online: bool) {
		let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
		trace!(online, generation, "Platform connectivity report");

		let this = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(this.inner.debounce).await;

			if this.inner.generation.load(Ordering::Acquire) != generation {
				trace!(generation, "Connectivity report superseded");
				return;
			}

			// An offline report is believed as is; an online one must be verified
			let verified = online && this.is_online().await;

			// A newer report arrived while verifying
			if this.inner.generation.load(Ordering::Acquire) != generation {
				trace!(generation, "Connectivity verification superseded");
				return;
			}

			this.apply(verified).await;
		});
	}

	/// Probes immediately and applies the result, skipping the debounce window.
	pub async fn check_now(&self) -> bool {
		let online = self.is_online().await;
		self.apply(online).await;
		online
	}

	async fn apply(&self, online: bool) {
		let was_online = self.inner.online.swap(online, Ordering::AcqRel);
		self.inner.status.update(|status| status.is_online = online);

		if was_online == online {
			return;
		}

		let event = if online {
			ConnectivityEvent::Online
		} else {
			ConnectivityEvent::Offline
		};
		info!(?event, "Connectivity changed");

		// No subscribers is fine
		self.inner.events.send(event).ok();

		if online {
			self.trigger_reconnect().await;
		}
	}

	/// Runs the reconnect hook unless a previous run is still in progress.
	///
	/// Returns whether the hook ran.
	pub async fn trigger_reconnect(&self) -> bool {
		if self
			.inner
			.reconnecting
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			debug!("Reconnect sync already running, ignoring trigger");
			return false;
		}

		let _guard = ReconnectGuard(&self.inner.reconnecting);

		let hook = self
			.inner
			.hook
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();

		if let Some(hook) = hook {
			hook.on_reconnect().await;
		}

		true
	}
}
