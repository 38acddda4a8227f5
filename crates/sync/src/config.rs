//! Engine configuration

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Error;

/// Tunables for the sync engine, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,
	pub timeouts: TimeoutConfig,
	pub connectivity: ConnectivityConfig,
	pub retry: RetryConfig,
	pub storage: StorageConfig,
}

/// Relay and probe round-trip bounds, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
	pub status_query_secs: u64,
	pub migration_secs: u64,
	pub bulk_secs: u64,
	pub probe_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
	/// Platform signals closer together than this collapse into one verification.
	pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	/// Attempts after which a server failure is surfaced to the user. Operations are kept.
	pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	pub key_prefix: String,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			version: Self::TARGET_VERSION,
			timeouts: TimeoutConfig::default(),
			connectivity: ConnectivityConfig::default(),
			retry: RetryConfig::default(),
			storage: StorageConfig::default(),
		}
	}
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		Self {
			status_query_secs: 5,
			migration_secs: 10,
			bulk_secs: 60,
			probe_secs: 5,
		}
	}
}

impl Default for ConnectivityConfig {
	fn default() -> Self {
		Self { debounce_ms: 1500 }
	}
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self { max_attempts: 5 }
	}
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			key_prefix: "tracker".to_owned(),
		}
	}
}

impl TimeoutConfig {
	#[must_use]
	pub const fn status_query(&self) -> Duration {
		Duration::from_secs(self.status_query_secs)
	}

	#[must_use]
	pub const fn migration(&self) -> Duration {
		Duration::from_secs(self.migration_secs)
	}

	#[must_use]
	pub const fn bulk(&self) -> Duration {
		Duration::from_secs(self.bulk_secs)
	}

	#[must_use]
	pub const fn probe(&self) -> Duration {
		Duration::from_secs(self.probe_secs)
	}
}

impl ConnectivityConfig {
	#[must_use]
	pub const fn debounce(&self) -> Duration {
		Duration::from_millis(self.debounce_ms)
	}
}

impl SyncConfig {
	pub const TARGET_VERSION: u32 = 1;

	/// Loads the config at `path`, writing defaults there when it doesn't exist yet.
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();

		match fs::read_to_string(path) {
			Ok(json) => {
				let mut config: Self = serde_json::from_str(&json).map_err(|e| {
					Error::Config(format!("malformed config at '{}': {e}", path.display()))
				})?;

				if config.version < Self::TARGET_VERSION {
					info!(
						from = config.version,
						to = Self::TARGET_VERSION,
						"Migrating sync config"
					);
					config.migrate()?;
					config.save(path)?;
				}

				Ok(config)
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				warn!(path = %path.display(), "No sync config found, creating default");
				let config = Self::default();
				config.save(path)?;
				Ok(config)
			}
			Err(e) => Err(Error::Config(format!(
				"failed to read config at '{}': {e}",
				path.display()
			))),
		}
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
		let path = path.as_ref();

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|e| {
				Error::Config(format!(
					"failed to create config directory '{}': {e}",
					parent.display()
				))
			})?;
		}

		fs::write(path, serde_json::to_string_pretty(self)?).map_err(|e| {
			Error::Config(format!("failed to write config at '{}': {e}", path.display()))
		})
	}

	pub fn migrate(&mut self) -> Result<(), Error> {
		match self.version {
			0 => {
				// v0 allowed zero-valued timeouts and an empty key prefix
				let defaults = TimeoutConfig::default();
				for (value, default) in [
					(&mut self.timeouts.status_query_secs, defaults.status_query_secs),
					(&mut self.timeouts.migration_secs, defaults.migration_secs),
					(&mut self.timeouts.bulk_secs, defaults.bulk_secs),
					(&mut self.timeouts.probe_secs, defaults.probe_secs),
				] {
					if *value == 0 {
						*value = default;
					}
				}

				if self.storage.key_prefix.is_empty() {
					self.storage = StorageConfig::default();
				}

				self.version = 1;
				Ok(())
			}
			1 => Ok(()),
			v => Err(Error::Config(format!("unknown config version: {v}"))),
		}
	}
}
