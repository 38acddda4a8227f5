use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use pt_sync::{Operation, OperationOutcome, RemoteSnapshot, RemoteStore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
	auth::{AuthToken, WithAuth},
	config::RemoteConfig,
	error::Error,
};

const USER_PATH: &str = "/user";
const ANTI_FORGERY_PATH: &str = "/csrf-token";

#[derive(Serialize)]
struct PatchRequest<'a> {
	operations: &'a [Operation],
}

#[derive(Deserialize)]
struct PatchResponse {
	outcomes: Vec<OperationOutcome>,
}

#[derive(Deserialize)]
struct AntiForgeryResponse {
	token: String,
}

/// [`RemoteStore`] over HTTP.
pub struct HttpRemoteStore {
	client: reqwest::Client,
	config: RemoteConfig,
	credential: RwLock<Option<AuthToken>>,
	anti_forgery: Mutex<Option<String>>,
}

impl HttpRemoteStore {
	pub fn new(config: RemoteConfig) -> Result<Self, Error> {
		let client = reqwest::Client::builder()
			.timeout(config.request_timeout())
			.build()
			.map_err(Error::Client)?;

		Ok(Self {
			client,
			config,
			credential: RwLock::new(None),
			anti_forgery: Mutex::new(None),
		})
	}

	#[must_use]
	pub const fn config(&self) -> &RemoteConfig {
		&self.config
	}

	/// Starts a new session. The anti-forgery token is fetched again on the next mutation.
	pub async fn set_credential(&self, token: Option<AuthToken>) {
		*self
			.credential
			.write()
			.unwrap_or_else(PoisonError::into_inner) = token;
		self.anti_forgery.lock().await.take();
	}

	fn credential(&self) -> Result<AuthToken, Error> {
		self.credential
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
			.ok_or(Error::MissingCredential)
	}

	async fn anti_forgery_token(&self, credential: &AuthToken) -> Result<String, Error> {
		let mut slot = self.anti_forgery.lock().await;
		if let Some(token) = slot.as_ref() {
			return Ok(token.clone());
		}

		debug!("Fetching anti-forgery token");
		let response = self
			.client
			.get(self.config.url(ANTI_FORGERY_PATH))
			.with_auth(credential)
			.send()
			.await
			.map_err(Error::Transport)?;
		let AntiForgeryResponse { token } = decode(response).await?;

		*slot = Some(token.clone());

		Ok(token)
	}

	async fn fetch(&self) -> Result<RemoteSnapshot, Error> {
		let credential = self.credential()?;

		let response = self
			.client
			.get(self.config.url(USER_PATH))
			.with_auth(&credential)
			.send()
			.await
			.map_err(Error::Transport)?;

		decode(response).await
	}

	async fn patch(&self, operations: &[Operation]) -> Result<Vec<OperationOutcome>, Error> {
		let credential = self.credential()?;
		let anti_forgery = self.anti_forgery_token(&credential).await?;

		let response = self
			.client
			.patch(self.config.url(USER_PATH))
			.with_auth(&credential)
			.with_anti_forgery(&anti_forgery)
			.json(&PatchRequest { operations })
			.send()
			.await
			.map_err(Error::Transport)?;

		match decode::<PatchResponse>(response).await {
			Ok(PatchResponse { outcomes }) => Ok(outcomes),
			Err(e @ Error::Unauthorized(_)) => {
				// The token may belong to an older session
				self.anti_forgery.lock().await.take();
				Err(e)
			}
			Err(e) => Err(e),
		}
	}

	async fn ping(&self) -> Result<(), Error> {
		let response = self
			.client
			.get(self.config.url(&self.config.probe_path))
			.send()
			.await
			.map_err(Error::Transport)?;

		let status = response.status();
		if status.is_server_error() {
			return Err(Error::from_status(status, String::new()));
		}

		Ok(())
	}
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
	let status = response.status();
	let body = response.text().await.map_err(Error::Transport)?;

	if !status.is_success() {
		warn!(%status, "Remote store request failed");
		return Err(Error::from_status(status, body));
	}

	serde_json::from_str(&body).map_err(|source| Error::Decode {
		status: status.as_u16(),
		source,
	})
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
	async fn fetch_user(&self) -> Result<RemoteSnapshot, pt_sync::Error> {
		Ok(self.fetch().await?)
	}

	async fn patch_operations(
		&self,
		operations: &[Operation],
	) -> Result<Vec<OperationOutcome>, pt_sync::Error> {
		debug!(count = operations.len(), "Patching remote store");

		Ok(self.patch(operations).await?)
	}

	async fn probe(&self) -> Result<(), pt_sync::Error> {
		Ok(self.ping().await?)
	}
}
