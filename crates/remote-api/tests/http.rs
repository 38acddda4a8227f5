use pt_remote_api::{AuthToken, HttpRemoteStore, RemoteConfig};
use pt_sync::{
	ErrorKind, FakeClock, ItemSeed, Operation, OperationKind, OperationOutcome, Rejection,
	RemoteSnapshot, RemoteStore, TrackedItem,
};

use serde_json::json;
use tracing_test::traced_test;
use wiremock::{
	matchers::{header, method, path},
	Mock, MockServer, ResponseTemplate,
};

async fn store_for(server: &MockServer) -> HttpRemoteStore {
	let store = HttpRemoteStore::new(RemoteConfig {
		api_url: server.uri(),
		probe_path: "/health".to_owned(),
		request_timeout_secs: 5,
	})
	.unwrap();
	store.set_credential(Some(AuthToken::bearer("t0k3n"))).await;
	store
}

fn delete(item_id: &str) -> Operation {
	Operation::new(
		OperationKind::DeleteItem {
			item_id: item_id.to_owned(),
		},
		&FakeClock::default(),
	)
}

#[tokio::test]
async fn fetches_user_snapshot_with_credential() {
	let server = MockServer::start().await;

	let snapshot = RemoteSnapshot {
		items: vec![TrackedItem::from_seed(&ItemSeed {
			id: "two-sum".to_owned(),
			category: "arrays".to_owned(),
			subcategory: "hashing".to_owned(),
			is_custom: false,
		})],
		tombstone_ids: ["bfs".to_owned()].into(),
	};

	Mock::given(method("GET"))
		.and(path("/user"))
		.and(header("authorization", "Bearer t0k3n"))
		.respond_with(ResponseTemplate::new(200).set_body_json(&snapshot))
		.expect(1)
		.mount(&server)
		.await;

	let fetched = store_for(&server).await.fetch_user().await.unwrap();

	assert_eq!(fetched, snapshot);
}

#[tokio::test]
async fn anti_forgery_token_is_fetched_once_per_session() {
	let server = MockServer::start().await;
	let first = delete("bfs");
	let second = delete("dijkstra");

	Mock::given(method("GET"))
		.and(path("/csrf-token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "xsrf-1" })))
		.expect(1)
		.mount(&server)
		.await;

	Mock::given(method("PATCH"))
		.and(path("/user"))
		.and(header("x-csrf-token", "xsrf-1"))
		.and(header("authorization", "Bearer t0k3n"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"outcomes": [
				OperationOutcome::ack(first.id),
				OperationOutcome::rejected(second.id, Rejection::server_error(503, "busy")),
			]
		})))
		.expect(2)
		.mount(&server)
		.await;

	let store = store_for(&server).await;

	let outcomes = store
		.patch_operations(&[first.clone(), second.clone()])
		.await
		.unwrap();
	assert_eq!(outcomes.len(), 2);
	assert!(outcomes[0].is_ack());
	assert!(!outcomes[1].is_ack());

	store.patch_operations(&[second]).await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn rejected_credential_maps_to_auth_expired() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/user"))
		.respond_with(ResponseTemplate::new(401))
		.mount(&server)
		.await;

	let err = store_for(&server).await.fetch_user().await.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::AuthExpired);
	assert!(logs_contain("Remote store request failed"));
}

#[tokio::test]
async fn missing_credential_is_auth_expired_without_a_request() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&server)
		.await;

	let store = store_for(&server).await;
	store.set_credential(None).await;

	let err = store.patch_operations(&[delete("bfs")]).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::AuthExpired);
}

#[tokio::test]
async fn server_failure_keeps_status() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/user"))
		.respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
		.mount(&server)
		.await;

	let err = store_for(&server).await.fetch_user().await.unwrap_err();

	assert!(matches!(
		err,
		pt_sync::Error::ServerError { status: 503, ref message } if message == "maintenance"
	));
}

#[tokio::test]
async fn malformed_body_is_a_server_error() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/user"))
		.respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
		.mount(&server)
		.await;

	let err = store_for(&server).await.fetch_user().await.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::ServerError);
}

#[tokio::test]
async fn unreachable_host_is_network_unavailable() {
	let store = HttpRemoteStore::new(RemoteConfig {
		api_url: "http://127.0.0.1:9".to_owned(),
		probe_path: "/health".to_owned(),
		request_timeout_secs: 2,
	})
	.unwrap();
	store.set_credential(Some(AuthToken::bearer("t0k3n"))).await;

	assert_eq!(
		store.probe().await.unwrap_err().kind(),
		ErrorKind::NetworkUnavailable
	);
	assert_eq!(
		store.fetch_user().await.unwrap_err().kind(),
		ErrorKind::NetworkUnavailable
	);
}

#[tokio::test]
async fn probe_needs_only_a_non_server_error_answer() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/health"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&server)
		.await;

	store_for(&server).await.probe().await.unwrap();
}
