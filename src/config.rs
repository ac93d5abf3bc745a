//! Run-time settings for range scans.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

/// How the scanner walks the internal levels of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraversalPolicy {
	/// Lock-coupled descent, one child at a time. Holds at most the current leaf and one
	/// node on its way down.
	#[default]
	DepthFirst,
	/// Expands level by level from the root, locking every in-range child, until more than
	/// `frontier_limit` nodes are locked; from then on continues depth-first.
	Hybrid {
		frontier_limit: NonZeroUsize,
	},
}

/// Settings attached to a [`crate::BtreeSlice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
	pub policy: TraversalPolicy,
}

impl ScanConfig {
	pub fn depth_first() -> ScanConfig {
		ScanConfig {
			policy: TraversalPolicy::DepthFirst,
		}
	}

	pub fn hybrid(frontier_limit: NonZeroUsize) -> ScanConfig {
		ScanConfig {
			policy: TraversalPolicy::Hybrid {
				frontier_limit,
			},
		}
	}
}
