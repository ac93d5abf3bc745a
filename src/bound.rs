//! Range bounds.
//!
//! Each end of an rget range comes with a mode: `closed` keeps the boundary key, `open`
//! drops it and `none` leaves that side unbounded. [`KeyRange::resolve`] turns the two
//! (mode, key) pairs into [`std::ops::Bound`]s the scanner compares against.

use log::warn;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

use crate::node::StoreKey;

/// How one end of a range treats its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RgetBoundMode {
	/// The key itself is excluded.
	Open,
	/// The key itself is included.
	Closed,
	/// No bound on this side; the key is ignored.
	None,
}

impl RgetBoundMode {
	pub fn to_bound(self, key: &StoreKey) -> Bound<StoreKey> {
		match self {
			RgetBoundMode::Open => Bound::Excluded(key.clone()),
			RgetBoundMode::Closed => Bound::Included(key.clone()),
			RgetBoundMode::None => Bound::Unbounded,
		}
	}
}

/// A resolved key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
	start: Bound<StoreKey>,
	end: Bound<StoreKey>,
}

impl KeyRange {
	pub fn new(start: Bound<StoreKey>, end: Bound<StoreKey>) -> KeyRange {
		KeyRange {
			start,
			end,
		}
	}

	/// The whole key space.
	pub fn full() -> KeyRange {
		KeyRange::new(Bound::Unbounded, Bound::Unbounded)
	}

	pub fn resolve(left_mode: RgetBoundMode, left_key: &StoreKey, right_mode: RgetBoundMode, right_key: &StoreKey) -> KeyRange {
		KeyRange::new(left_mode.to_bound(left_key), right_mode.to_bound(right_key))
	}

	pub fn start(&self) -> Bound<&[u8]> {
		as_slice_bound(&self.start)
	}

	pub fn end(&self) -> Bound<&[u8]> {
		as_slice_bound(&self.end)
	}

	/// Returns `true` if `key` is not cut off by the start bound.
	#[inline]
	pub fn after_start(&self, key: &[u8]) -> bool {
		match &self.start {
			Bound::Unbounded => true,
			Bound::Included(start) => key >= start.as_bytes(),
			Bound::Excluded(start) => key > start.as_bytes(),
		}
	}

	/// Returns `true` if `key` is not cut off by the end bound.
	#[inline]
	pub fn before_end(&self, key: &[u8]) -> bool {
		match &self.end {
			Bound::Unbounded => true,
			Bound::Included(end) => key <= end.as_bytes(),
			Bound::Excluded(end) => key < end.as_bytes(),
		}
	}

	pub fn contains(&self, key: &[u8]) -> bool {
		self.after_start(key) && self.before_end(key)
	}

	/// Returns `true` if no key can fall inside the range.
	pub fn is_empty(&self) -> bool {
		let (start, start_inclusive) = match &self.start {
			Bound::Unbounded => return false,
			Bound::Included(k) => (k, true),
			Bound::Excluded(k) => (k, false),
		};
		let (end, end_inclusive) = match &self.end {
			Bound::Unbounded => return false,
			Bound::Included(k) => (k, true),
			Bound::Excluded(k) => (k, false),
		};

		if start > end {
			warn!("range starts at {} after it ends at {}; returning nothing", start, end);
			return true;
		}
		start == end && !(start_inclusive && end_inclusive)
	}
}

fn as_slice_bound(bound: &Bound<StoreKey>) -> Bound<&[u8]> {
	match bound {
		Bound::Included(k) => Bound::Included(k.as_bytes()),
		Bound::Excluded(k) => Bound::Excluded(k.as_bytes()),
		Bound::Unbounded => Bound::Unbounded,
	}
}
