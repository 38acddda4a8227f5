use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
	/// Base URL, without trailing slash, e.g. `https://tracker.example.com/api`
	pub api_url: String,
	/// Unauthenticated endpoint used as the reachability probe.
	pub probe_path: String,
	pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
	fn default() -> Self {
		Self {
			api_url: "http://localhost:8080/api".to_owned(),
			probe_path: "/health".to_owned(),
			request_timeout_secs: 30,
		}
	}
}

impl RemoteConfig {
	#[must_use]
	pub const fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	pub(crate) fn url(&self, path: &str) -> String {
		format!("{}{path}", self.api_url.trim_end_matches('/'))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn url_joins_without_double_slash() {
		let config = RemoteConfig {
			api_url: "https://tracker.example.com/api/".to_owned(),
			..Default::default()
		};

		assert_eq!(config.url("/user"), "https://tracker.example.com/api/user");
	}

	#[test]
	fn partial_config_falls_back_to_defaults() {
		let config: RemoteConfig =
			serde_json::from_str(r#"{ "api_url": "https://tracker.example.com" }"#).unwrap();

		assert_eq!(config.probe_path, "/health");
		assert_eq!(config.request_timeout(), Duration::from_secs(30));
	}
}
