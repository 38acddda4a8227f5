//! Time source seam
//!
//! Review scheduling and operation timestamps read the time through [`Clock`] so tests can
//! pin "today" instead of depending on the wall clock.

use std::sync::{
	atomic::{AtomicI64, Ordering},
	Arc,
};

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};

pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;

	/// The user's calendar day, used for review dates.
	fn today(&self) -> NaiveDate;
}

/// Wall clock; "today" follows the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}

	fn today(&self) -> NaiveDate {
		Local::now().date_naive()
	}
}

/// Manually driven clock, shared between clones.
#[derive(Debug, Clone)]
pub struct FakeClock {
	millis: Arc<AtomicI64>,
}

impl FakeClock {
	#[must_use]
	pub fn at(instant: DateTime<Utc>) -> Self {
		Self {
			millis: Arc::new(AtomicI64::new(instant.timestamp_millis())),
		}
	}

	pub fn advance(&self, by: Duration) {
		self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
	}

	pub fn set(&self, instant: DateTime<Utc>) {
		self.millis
			.store(instant.timestamp_millis(), Ordering::SeqCst);
	}
}

impl Default for FakeClock {
	fn default() -> Self {
		Self::at(DateTime::<Utc>::UNIX_EPOCH)
	}
}

impl Clock for FakeClock {
	fn now(&self) -> DateTime<Utc> {
		DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
	}

	fn today(&self) -> NaiveDate {
		self.now().date_naive()
	}
}
