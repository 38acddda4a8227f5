
use pt_sync::{
	relay::{RelayEnvelope, RelayReply, RelayRequest},
	*,
};

use std::{
	sync::{atomic::Ordering, Arc},
	time::Duration,
};

use mock_remote::{seeded_state, Device, MockRemote};
use tracing_test::traced_test;

fn assert_converged(local: &ItemState, remote: &ItemState) {
	assert_eq!(local.tombstones, remote.tombstones);
	assert_eq!(
		local.items.keys().collect::<Vec<_>>(),
		remote.items.keys().collect::<Vec<_>>()
	);
	for (id, item) in &local.items {
		assert!(item.same_content(&remote.items[id]), "{id} diverged");
	}
}

#[tokio::test]
async fn offline_operations_converge_after_reconnect() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.unreachable.store(true, Ordering::SeqCst);
	let device = Device::new(Arc::clone(&remote));

	device.engine.mark_solved("two-sum").await?;
	device.engine.set_note("bfs", "queue, not stack").await?;
	device.engine.delete_item("three-sum").await?;
	device.engine.create_custom_item("trees", "traversal").await?;
	device.engine.reviewed_again("two-sum").await?;

	assert_eq!(device.engine.status().pending_count, 5);
	assert_eq!(remote.patched_operations.load(Ordering::SeqCst), 0);

	remote.unreachable.store(false, Ordering::SeqCst);
	assert!(device.engine.connectivity().check_now().await);

	let status = device.engine.status();
	assert!(status.is_online);
	assert_eq!(status.pending_count, 0);
	assert!(status.last_sync_at.is_some());
	assert_eq!(status.last_error, None);

	assert_converged(&device.engine.items(), &remote.state());

	Ok(())
}

#[tokio::test]
async fn concurrent_flushes_share_one_run() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));
	device.engine.delete_item("dijkstra").await?;

	let gate = remote.hold_patches();

	let (first, second) = tokio::join!(device.engine.flush(), async {
		remote.patch_entered().await;
		let second = device.engine.flush();
		remote.release(&gate);
		second.await
	});

	assert_eq!(remote.patch_calls.load(Ordering::SeqCst), 1);
	assert_eq!(first, second);
	assert!(first.success);
	assert_eq!(first.synced, 1);

	Ok(())
}

#[tokio::test]
async fn deleted_category_stays_deleted_until_reset() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	device.engine.mark_solved("bfs").await?;
	device.engine.delete_category("graphs").await?;

	let items = device.engine.items();
	assert!(items.in_category("graphs").next().is_none());
	assert!(items.is_tombstoned("bfs") && items.is_tombstoned("dijkstra"));
	assert_eq!(items.in_category("arrays").count(), 3);

	// Neither reseeding nor a restart brings them back
	assert_eq!(device.engine.seed_from_catalog(), 0);
	let device = device.restart();
	assert!(device.engine.item("bfs").is_none());

	device.engine.reset_category("graphs").await?;

	let items = device.engine.items();
	assert!(items.tombstones.is_empty());
	let bfs = items.get("bfs").expect("bfs restored");
	assert_eq!(bfs.status, ItemStatus::Unsolved);
	assert_eq!(bfs.next_review_date, None);

	device.engine.flush().await;
	assert_converged(&device.engine.items(), &remote.state());

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn corrupted_state_loads_as_empty() {
	let store = Arc::new(MemoryStore::new());
	let namespace = Namespace::new(SyncConfig::default().storage.key_prefix, UserKind::Local);
	store
		.set(&namespace.key(Namespace::STATE), "{\"items\": [tru")
		.unwrap();

	let engine = SyncEngine::new(EngineParts {
		identity: UserIdentity::local("alex"),
		config: SyncConfig::default(),
		store: Arc::clone(&store) as Arc<dyn KeyValueStore>,
		remote: MockRemote::new(),
		clock: Arc::new(mock_remote::clock()),
		catalog: mock_remote::catalog(),
	});

	assert!(engine.items().is_empty());
	assert!(!engine.has_valid_data());
	assert!(logs_contain("Persisted state unreadable"));

	assert_eq!(engine.seed_from_catalog(), 5);
	assert!(engine.has_valid_data());
}

#[tokio::test]
async fn local_and_linked_users_never_share_data() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.unreachable.store(true, Ordering::SeqCst);
	let store = Arc::new(MemoryStore::new());

	let local = Device::with_store(
		Arc::clone(&remote),
		Arc::clone(&store),
		UserIdentity::local("alex"),
	);
	local.engine.mark_solved("two-sum").await?;
	local.engine.delete_item("bfs").await?;

	let linked = Device::with_store(remote, store, UserIdentity::linked("u-42", "Alex"));

	assert_eq!(
		linked.engine.item("two-sum").map(|item| item.status),
		Some(ItemStatus::Unsolved)
	);
	assert!(linked.engine.item("bfs").is_some());
	assert_eq!(linked.engine.status().pending_count, 0);

	Ok(())
}

#[tokio::test]
async fn state_and_queue_survive_restart() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.unreachable.store(true, Ordering::SeqCst);
	let device = Device::new(Arc::clone(&remote));

	device.engine.mark_solved("rotate-array").await?;
	device.engine.set_note("rotate-array", "reverse thrice").await?;

	let device = device.restart();

	let item = device.engine.item("rotate-array").expect("item kept");
	assert_eq!(item.status, ItemStatus::Solved);
	assert_eq!(item.note, "reverse thrice");
	assert_eq!(device.engine.status().pending_count, 2);

	remote.unreachable.store(false, Ordering::SeqCst);
	let report = device.engine.sync_now().await?;
	assert!(report.success);
	assert_eq!(report.synced, 2);
	assert_converged(&device.engine.items(), &remote.state());

	Ok(())
}

fn spawn_relay(device: &Device) -> RelayHandle {
	RelayWorker::spawn(
		Arc::clone(&device.store) as Arc<dyn KeyValueStore>,
		device.engine.namespace(),
		Arc::clone(&device.remote) as Arc<dyn RemoteStore>,
		Arc::new(device.clock.clone()),
	)
}

#[tokio::test]
async fn relay_drains_queue_and_outlives_engine() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	let relay = spawn_relay(&device);

	// Recorded before the relay is reachable, so they land in the fallback log
	device.engine.mark_solved("three-sum").await?;
	device.engine.set_note("three-sum", "two pointers").await?;
	device.engine.delete_item("dijkstra").await?;

	assert_eq!(
		device.engine.attach_relay(relay.link()).await?,
		MigrationOutcome::Migrated { count: 3 }
	);
	assert!(device.engine.queue().fallback_operations().is_empty());
	assert_eq!(device.engine.status().pending_count, 3);

	// A fresh engine instance picks up the same relay
	let device = device.restart();
	device.engine.attach_relay(relay.link()).await?;
	assert_eq!(device.engine.status().pending_count, 3);

	remote.reverse.store(true, Ordering::SeqCst);
	let report = device.engine.flush().await;

	assert!(report.success, "{report:?}");
	assert_eq!(report.synced, 3);
	assert_eq!(remote.patch_calls.load(Ordering::SeqCst), 1);
	assert_eq!(device.engine.status().pending_count, 0);
	assert_converged(&device.engine.items(), &remote.state());

	relay.shutdown().await;

	Ok(())
}

#[tokio::test]
async fn expired_credential_pauses_until_reauth() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.auth_expired.store(true, Ordering::SeqCst);
	let device = Device::new(Arc::clone(&remote));

	device.engine.set_note("two-sum", "hash map").await?;

	let report = device.engine.flush().await;
	assert!(!report.success);
	assert!(report.needs_reauth);

	let status = device.engine.status();
	assert!(status.needs_reauth);
	assert_eq!(status.pending_count, 1);
	assert!(status.last_error.is_some());

	// Paused: nothing is sent until the user signs in again
	let calls = remote.patch_calls.load(Ordering::SeqCst);
	let report = device.engine.flush().await;
	assert!(report.needs_reauth);
	assert_eq!(remote.patch_calls.load(Ordering::SeqCst), calls);

	remote.auth_expired.store(false, Ordering::SeqCst);
	let report = device.engine.resume_after_reauth().await;

	assert!(report.success, "{report:?}");
	let status = device.engine.status();
	assert!(!status.needs_reauth);
	assert_eq!(status.pending_count, 0);
	assert_eq!(remote.state().get("two-sum").map(|item| item.note.as_str()), Some("hash map"));

	Ok(())
}

#[tokio::test]
async fn server_errors_surface_only_after_retries() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.failing.store(true, Ordering::SeqCst);
	let device = Device::new(Arc::clone(&remote));
	let max_attempts = device.engine.config().retry.max_attempts;

	device.engine.delete_item("bfs").await?;

	for _ in 1..max_attempts {
		let report = device.engine.flush().await;
		assert!(!report.success);
		assert_eq!(report.attention, None);
		assert_eq!(device.engine.status().last_error, None);
	}

	let report = device.engine.flush().await;
	assert!(report.attention.is_some());
	assert!(device.engine.status().last_error.is_some());
	assert_eq!(device.engine.status().pending_count, 1);

	remote.failing.store(false, Ordering::SeqCst);
	assert!(device.engine.flush().await.success);
	assert_eq!(device.engine.status().last_error, None);

	Ok(())
}

#[tokio::test]
async fn failed_requests_surface_only_after_retries() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.server_down.store(true, Ordering::SeqCst);
	let device = Device::new(Arc::clone(&remote));
	let max_attempts = device.engine.config().retry.max_attempts;

	device.engine.delete_item("bfs").await?;
	device.engine.set_note("two-sum", "hash map").await?;

	for _ in 1..max_attempts {
		let report = device.engine.flush().await;
		assert!(!report.success);
		assert_eq!(report.attention, None);
		assert_eq!(device.engine.status().last_error, None);
	}

	let report = device.engine.flush().await;
	assert!(!report.success);
	assert!(report.attention.is_some());
	assert!(device.engine.status().last_error.is_some());
	assert_eq!(device.engine.status().pending_count, 2);

	remote.server_down.store(false, Ordering::SeqCst);
	assert!(device.engine.flush().await.success);
	assert_eq!(device.engine.status().last_error, None);
	assert_converged(&device.engine.items(), &remote.state());

	Ok(())
}

#[tokio::test]
async fn relay_failed_batches_surface_only_after_retries(
) -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	remote.server_down.store(true, Ordering::SeqCst);
	let device = Device::new(Arc::clone(&remote));
	let max_attempts = device.engine.config().retry.max_attempts;

	let relay = spawn_relay(&device);
	device.engine.attach_relay(relay.link()).await?;
	device.engine.delete_item("bfs").await?;

	for _ in 1..max_attempts {
		let report = device.engine.flush().await;
		assert!(!report.success);
		assert_eq!(report.attention, None);
		assert_eq!(device.engine.status().last_error, None);
	}

	let report = device.engine.flush().await;
	assert!(report.attention.is_some());
	assert!(device.engine.status().last_error.is_some());
	assert_eq!(device.engine.status().pending_count, 1);

	remote.server_down.store(false, Ordering::SeqCst);
	assert!(device.engine.flush().await.success);
	assert_eq!(device.engine.status().pending_count, 0);

	relay.shutdown().await;

	Ok(())
}

#[tokio::test]
async fn intents_go_straight_to_attached_relay() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	let relay = spawn_relay(&device);
	assert_eq!(
		device.engine.attach_relay(relay.link()).await?,
		MigrationOutcome::NothingToMigrate
	);

	device.engine.mark_solved("rotate-array").await?;
	device.engine.set_note("bfs", "level by level").await?;

	assert!(device.engine.queue().fallback_operations().is_empty());
	assert_eq!(device.engine.queue().relay().pending_operations().await?.len(), 2);
	assert_eq!(device.engine.status().pending_count, 2);

	let report = device.engine.flush().await;
	assert!(report.success, "{report:?}");
	assert_eq!(report.synced, 2);
	assert_converged(&device.engine.items(), &remote.state());

	relay.shutdown().await;

	Ok(())
}

#[tokio::test]
async fn relay_parks_overlapping_edit() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	let relay = spawn_relay(&device);
	device.engine.attach_relay(relay.link()).await?;

	remote.edit(|state| {
		if let Some(item) = state.items.get_mut("bfs") {
			item.note = "from the laptop".to_owned();
		}
	});
	remote.reject_stale("bfs", vec![ItemField::Note]);

	let operation_id = device.engine.set_note("bfs", "from the phone").await?;

	let report = device.engine.flush().await;
	assert_eq!(report.conflicts, 1);

	assert!(device.engine.status().has_conflicts);
	assert_eq!(device.engine.status().pending_count, 0);
	assert!(device.engine.queue().relay().pending_operations().await?.is_empty());
	assert_eq!(device.engine.conflicts()[0].operation.id, operation_id);

	relay.shutdown().await;

	Ok(())
}

#[tokio::test]
async fn overlapping_edit_is_parked_and_resolved() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	remote.edit(|state| {
		if let Some(item) = state.items.get_mut("bfs") {
			item.note = "from the laptop".to_owned();
		}
	});
	remote.reject_stale("bfs", vec![ItemField::Note]);

	let operation_id = device.engine.set_note("bfs", "from the phone").await?;

	let report = device.engine.flush().await;
	assert_eq!(report.conflicts, 1);

	let status = device.engine.status();
	assert!(status.has_conflicts);
	assert!(status.conflict_message.is_some());
	assert_eq!(status.pending_count, 0);

	let conflicts = device.engine.conflicts();
	assert_eq!(conflicts.len(), 1);
	assert_eq!(conflicts[0].operation.id, operation_id);
	assert_eq!(
		conflicts[0].remote_item.as_ref().map(|item| item.note.as_str()),
		Some("from the laptop")
	);

	device
		.engine
		.resolve_conflict(operation_id, ConflictChoice::KeepRemote)
		.await?;

	assert_eq!(device.engine.item("bfs").map(|item| item.note), Some("from the laptop".to_owned()));
	assert!(device.engine.conflicts().is_empty());
	assert!(!device.engine.status().has_conflicts);

	assert!(matches!(
		device
			.engine
			.resolve_conflict(operation_id, ConflictChoice::KeepLocal)
			.await,
		Err(Error::UnknownConflict(_))
	));

	Ok(())
}

#[tokio::test]
async fn keeping_local_side_resends_the_edit() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	remote.reject_stale("two-sum", vec![ItemField::Status, ItemField::ReviewSchedule]);
	let operation_id = device.engine.mark_solved("two-sum").await?;
	device.engine.flush().await;

	device
		.engine
		.resolve_conflict(operation_id, ConflictChoice::KeepLocal)
		.await?;
	assert_eq!(device.engine.status().pending_count, 1);

	assert!(device.engine.flush().await.success);
	assert_eq!(
		remote.state().get("two-sum").map(|item| item.status),
		Some(ItemStatus::Solved)
	);

	Ok(())
}

#[tokio::test]
async fn disjoint_stale_write_is_merged() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	remote.edit(|state| {
		if let Some(item) = state.items.get_mut("dijkstra") {
			item.note = "use a heap".to_owned();
		}
	});
	remote.reject_stale("dijkstra", vec![ItemField::Note]);

	device.engine.mark_solved("dijkstra").await?;
	let report = device.engine.flush().await;
	assert_eq!(report.conflicts, 0);

	// Both edits kept locally; the operation is still queued for retry
	let item = device.engine.item("dijkstra").expect("item kept");
	assert_eq!(item.status, ItemStatus::Solved);
	assert_eq!(item.note, "use a heap");
	assert_eq!(device.engine.status().pending_count, 1);

	assert!(device.engine.flush().await.success);
	assert_converged(&device.engine.items(), &remote.state());

	Ok(())
}

#[tokio::test]
async fn refresh_keeps_unacknowledged_edits() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	remote.edit(|state| {
		if let Some(item) = state.items.get_mut("bfs") {
			item.status = ItemStatus::Solved;
		}
		state.items.remove("three-sum");
		state.tombstones.insert("three-sum".to_owned());
	});

	device.engine.set_note("two-sum", "not synced yet").await?;
	device.engine.refresh_from_remote().await?;

	let items = device.engine.items();
	assert_eq!(items.get("bfs").map(|item| item.status), Some(ItemStatus::Solved));
	assert!(items.is_tombstoned("three-sum"));
	assert_eq!(items.get("two-sum").map(|item| item.note.as_str()), Some("not synced yet"));
	assert_eq!(device.engine.status().pending_count, 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn platform_online_report_triggers_sync() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	device.engine.mark_solved("bfs").await?;
	device.engine.delete_item("two-sum").await?;

	device.engine.connectivity().report_platform_status(false);
	device.engine.connectivity().report_platform_status(true);
	tokio::time::sleep(Duration::from_secs(3)).await;

	assert_eq!(remote.probe_calls.load(Ordering::SeqCst), 1);
	let status = device.engine.status();
	assert!(status.is_online);
	assert_eq!(status.pending_count, 0);
	assert_converged(&device.engine.items(), &remote.state());

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn refresh_waits_for_intent_being_queued() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::with_state(seeded_state());
	let device = Device::new(Arc::clone(&remote));

	// A relay that takes requests but never answers them
	let (requests_tx, requests_rx) = async_channel::unbounded::<RelayEnvelope>();
	let (_replies_tx, replies_rx) = async_channel::unbounded::<RelayReply>();
	device
		.engine
		.attach_relay(RelayLink::new(requests_tx, replies_rx))
		.await?;

	let (noted, refreshed) = tokio::join!(device.engine.set_note("bfs", "mine"), async {
		while let Ok(envelope) = requests_rx.recv().await {
			if matches!(envelope.request, RelayRequest::Enqueue { .. }) {
				break;
			}
		}
		// The relay goes away; the intent falls back to the log once its request times out
		drop(requests_rx);
		device.engine.refresh_from_remote().await
	});
	noted?;
	refreshed?;

	assert_eq!(device.engine.queue().fallback_operations().len(), 1);
	assert_eq!(
		device.engine.item("bfs").map(|item| item.note),
		Some("mine".to_owned())
	);
	assert_eq!(device.engine.status().pending_count, 1);

	Ok(())
}
