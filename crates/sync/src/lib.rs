//!
//! # Offline-first sync engine
//!
//! Tracks progress on a catalog of practice problems (solved state, notes and a
//! spaced-repetition review schedule) while fully offline, and converges with the
//! authoritative remote copy once connectivity returns.
//!
//! The moving parts, leaves first:
//! - [`LocalStateStore`]: namespaced load/persist of items and tombstones;
//! - [`schedule`]: the fixed review interval table;
//! - [`OperationQueue`]: durable, replayable log of intended mutations, forwarded to the
//!   background relay when it is reachable and to a fallback log otherwise;
//! - [`ConnectivityDetector`]: probed, debounced online/offline signal;
//! - [`SyncCoordinator`]: single-flight flush of the queue against the [`RemoteStore`];
//! - [`ConflictResolver`]: classifies remote rejections;
//! - [`StatusBus`]: the observable [`SyncStatus`] aggregate.
//!
//! [`SyncEngine`] owns all of them and is the only way to mutate tracked items.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod coordinator;
mod engine;
mod error;
pub mod model;
pub mod operation;
pub mod queue;
pub mod relay;
pub mod remote;
pub mod replica;
pub mod schedule;
pub mod status;
pub mod store;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::SyncConfig;
pub use conflict::{ConflictChoice, ConflictLog, ConflictRecord, ConflictResolver, Resolution};
pub use connectivity::{ConnectivityDetector, ConnectivityEvent, ReconnectHook};
pub use coordinator::{FlushReport, ReconnectSync, SyncCoordinator};
pub use engine::{EngineParts, SyncEngine};
pub use error::{Error, ErrorKind, FileAction, StoreError, StoreFileError};
pub use model::{
	Catalog, CatalogEntry, ItemId, ItemSeed, ItemState, ItemStatus, TrackedItem, UserIdentity,
	UserKind,
};
pub use operation::{ItemField, Operation, OperationId, OperationKind};
pub use queue::{MigrationOutcome, OperationQueue};
pub use relay::{RelayClient, RelayHandle, RelayLink, RelayStatus, RelayWorker};
pub use remote::{
	OperationOutcome, OutcomeResult, Rejection, RejectionReason, RemoteSnapshot, RemoteStore,
};
pub use replica::Replica;
pub use status::{StatusBus, SyncStatus};
pub use store::{FileStore, KeyValueStore, LocalStateStore, MemoryStore, Namespace};
