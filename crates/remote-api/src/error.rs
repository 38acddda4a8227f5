use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("no credential set")]
	MissingCredential,
	#[error("credential rejected <status={0}>")]
	Unauthorized(u16),
	#[error("remote store failure <status={status}>: {message}")]
	Status { status: u16, message: String },
	#[error("remote store unreachable: {0}")]
	Transport(#[source] reqwest::Error),
	#[error("malformed response <status={status}>: {source}")]
	Decode {
		status: u16,
		#[source]
		source: serde_json::Error,
	},
	#[error("failed to build http client: {0}")]
	Client(#[source] reqwest::Error),
}

impl Error {
	pub(crate) fn from_status(status: StatusCode, message: String) -> Self {
		if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
			Self::Unauthorized(status.as_u16())
		} else {
			Self::Status {
				status: status.as_u16(),
				message,
			}
		}
	}
}

impl From<Error> for pt_sync::Error {
	fn from(e: Error) -> Self {
		match e {
			Error::MissingCredential | Error::Unauthorized(_) => Self::AuthExpired,
			Error::Status { status, message } => Self::ServerError { status, message },
			Error::Transport(e) => Self::NetworkUnavailable(e.to_string()),
			Error::Decode { status, source } => Self::ServerError {
				status,
				message: source.to_string(),
			},
			Error::Client(e) => Self::Config(e.to_string()),
		}
	}
}
