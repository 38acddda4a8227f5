use serde::{Deserialize, Serialize};

/// Short-lived credential issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
	pub access_token: String,
	pub token_type: String,
}

impl AuthToken {
	#[must_use]
	pub fn bearer(access_token: impl Into<String>) -> Self {
		Self {
			access_token: access_token.into(),
			token_type: "Bearer".to_owned(),
		}
	}
}

pub(crate) const ANTI_FORGERY_HEADER: &str = "x-csrf-token";

pub(crate) trait WithAuth {
	fn with_auth(self, token: &AuthToken) -> Self;

	fn with_anti_forgery(self, token: &str) -> Self;
}

impl WithAuth for reqwest::RequestBuilder {
	fn with_auth(self, token: &AuthToken) -> Self {
		self.header(
			reqwest::header::AUTHORIZATION,
			format!("{} {}", token.token_type, token.access_token),
		)
	}

	fn with_anti_forgery(self, token: &str) -> Self {
		self.header(ANTI_FORGERY_HEADER, token)
	}
}
