//! Spaced-repetition review schedule.
//!
//! A pure lookup: no state, no concurrency. Only called while building the payload of
//! `MarkSolved` and `UpdateReviewSchedule` operations.

use chrono::{Days, NaiveDate};

/// Days until the next review, indexed by how many times the item was reviewed again.
pub const REVIEW_INTERVALS: [u64; 7] = [1, 3, 7, 14, 30, 60, 120];

/// Highest valid interval index.
pub const MAX_INTERVAL_INDEX: usize = REVIEW_INTERVALS.len() - 1;

/// `today + table[index]`, with out-of-range indices clamped to the last interval.
#[must_use]
pub fn next_review_date(today: NaiveDate, interval_index: usize) -> NaiveDate {
	let days = REVIEW_INTERVALS[interval_index.min(MAX_INTERVAL_INDEX)];

	today.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX)
}

/// Index after a "reviewed again" action. Never exceeds [`MAX_INTERVAL_INDEX`].
#[must_use]
pub const fn advance(interval_index: usize) -> usize {
	if interval_index >= MAX_INTERVAL_INDEX {
		MAX_INTERVAL_INDEX
	} else {
		interval_index + 1
	}
}
