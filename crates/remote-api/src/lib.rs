//! HTTP implementation of the practice tracker's remote store.
//!
//! `GET /user` returns the authoritative copy, `PATCH /user` applies an operation batch and
//! answers with one outcome per operation. Mutating requests carry an anti-forgery token that
//! is fetched once per session.

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

pub mod auth;
mod client;
mod config;
mod error;

pub use auth::AuthToken;
pub use client::HttpRemoteStore;
pub use config::RemoteConfig;
pub use error::Error;
