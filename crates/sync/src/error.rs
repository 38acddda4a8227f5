use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::ItemId;

/// How an error must be handled: recovered locally or surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Credential invalid or expired. Queued operations are kept, sync pauses.
	AuthExpired,
	/// Relay or remote unreachable. Queue locally, retry on the next connectivity signal.
	NetworkUnavailable,
	/// Remote 5xx-class failure. The operation stays queued.
	ServerError,
	/// Malformed durable-store contents. Reset to empty, never crash.
	CorruptedLocalData,
	/// Remote and local diverged incompatibly. Needs an explicit user decision.
	ConflictDetected,
	/// Anything that is a programming or local I/O failure rather than a sync outcome.
	Internal,
}

impl ErrorKind {
	/// Transient errors are fully recovered locally by retrying or requeueing.
	#[must_use]
	pub const fn is_transient(self) -> bool {
		matches!(self, Self::NetworkUnavailable | Self::ServerError)
	}

	/// Errors that only the user can resolve.
	#[must_use]
	pub const fn requires_user(self) -> bool {
		matches!(self, Self::AuthExpired | Self::ConflictDetected)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("remote rejected the credential as invalid or expired")]
	AuthExpired,
	#[error("remote store unreachable: {0}")]
	NetworkUnavailable(String),
	#[error("remote store failure <status={status}>: {message}")]
	ServerError { status: u16, message: String },
	#[error("corrupted local data <key='{key}'>: {source}")]
	CorruptedLocalData {
		key: String,
		#[source]
		source: serde_json::Error,
	},
	#[error("conflict detected: {0}")]
	ConflictDetected(String),

	#[error("background relay unavailable")]
	RelayUnavailable,
	#[error("background relay did not answer within {0:?}")]
	RelayTimeout(Duration),
	#[error("background relay refused the request: {0}")]
	RelayRejected(String),
	#[error("unexpected relay response to <request='{0}'>")]
	UnexpectedRelayResponse(&'static str),
	#[error("sync is paused until the user re-authenticates")]
	SyncPaused,
	#[error("unknown item: <id='{0}'>")]
	UnknownItem(ItemId),
	#[error("unknown category: <category='{0}'>")]
	UnknownCategory(String),
	#[error("unknown conflict: <operation_id='{0}'>")]
	UnknownConflict(uuid::Uuid),
	#[error("invalid configuration: {0}")]
	Config(String),

	#[error(transparent)]
	Storage(#[from] StoreError),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl Error {
	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::AuthExpired | Self::SyncPaused => ErrorKind::AuthExpired,
			Self::NetworkUnavailable(_)
			| Self::RelayUnavailable
			| Self::RelayTimeout(_)
			| Self::RelayRejected(_) => ErrorKind::NetworkUnavailable,
			Self::ServerError { .. } => ErrorKind::ServerError,
			Self::CorruptedLocalData { .. } => ErrorKind::CorruptedLocalData,
			Self::ConflictDetected(_) => ErrorKind::ConflictDetected,
			Self::UnexpectedRelayResponse(_)
			| Self::UnknownItem(_)
			| Self::UnknownCategory(_)
			| Self::UnknownConflict(_)
			| Self::Config(_)
			| Self::Storage(_)
			| Self::Serialization(_) => ErrorKind::Internal,
		}
	}
}

/// Failures of the synchronous durable local store.
#[derive(Error, Debug)]
pub enum StoreError {
	#[error("durable store quota exceeded <key='{key}', needed={needed}, limit={limit}>")]
	QuotaExceeded {
		key: String,
		needed: usize,
		limit: usize,
	},
	#[error(transparent)]
	File(#[from] StoreFileError),
	#[error("durable store lock poisoned")]
	Poisoned,
}

/// Which filesystem step of a durable store call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
	OpenDirectory,
	Read,
	WriteTemp,
	Replace,
	Remove,
}

impl FileAction {
	const fn as_str(self) -> &'static str {
		match self {
			Self::OpenDirectory => "opening the store directory",
			Self::Read => "reading",
			Self::WriteTemp => "writing the temp file",
			Self::Replace => "replacing the value",
			Self::Remove => "removing",
		}
	}
}

/// A failed file operation behind a durable store key.
#[derive(Error, Debug)]
#[error(
	"file I/O error while {} <key={}, path='{}'>: {source}",
	.action.as_str(),
	.key.as_deref().unwrap_or("-"),
	.path.display()
)]
pub struct StoreFileError {
	pub action: FileAction,
	/// Absent for failures not tied to one key, like opening the directory.
	pub key: Option<String>,
	pub path: PathBuf,
	#[source]
	pub source: io::Error,
}

impl StoreFileError {
	pub fn for_key(
		action: FileAction,
		key: &str,
		path: impl Into<PathBuf>,
		source: io::Error,
	) -> Self {
		Self {
			action,
			key: Some(key.to_owned()),
			path: path.into(),
			source,
		}
	}

	pub fn for_directory(path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self {
			action: FileAction::OpenDirectory,
			key: None,
			path: path.into(),
			source,
		}
	}
}
