//! # rget: Bounded Range Queries over a Snapshot B+ Tree
//!
//! This crate implements the range-query ("rget") path of a transactional key-value store: given
//! a key range, an expiration time and a read transaction, it produces the live entries of the
//! range in ascending key order, one pull at a time.
//!
//! ## Design Overview
//!
//! A query is a chain of lazy stages built by [`rget_slice`]. Building it performs no I/O; each
//! pull on the returned [`RgetResult`] runs to completion on the caller's thread.
//!
//! ```text
//!   caller ──next()──► TransactionScoped ──► Transform ──► Filter ──► BoundedLeafScanner
//!                        owns Transaction    materialize   expired?     lock-coupled walk
//!                              │                  │                            │
//!                              │         hop to home context           acquire / release
//!                              ▼                  ▼                            ▼
//!                         home Context ◄──── blob reads                  BlockSource
//! ```
//!
//! ### Key Concepts
//!
//! **Snapshots**: A [`Transaction`] pins one published version of the tree. Published blocks
//! are immutable, so the scanner may remember child ids after it unlocks their parent.
//!
//! **Lock coupling**: A child is locked before its parent is released. Under the default
//! [`TraversalPolicy::DepthFirst`] the scanner holds the current leaf plus at most one node on
//! the way down. [`TraversalPolicy::Hybrid`] starts breadth-first and switches to depth-first
//! once its frontier holds too many locks.
//!
//! **Home contexts**: A transaction belongs to the [`Context`] it was begun on. Payloads are
//! built there and the transaction is released there, whichever thread drops the result.
//!
//! ## Basic Usage
//!
//! ```
//! use std::sync::Arc;
//! use rget::{rget_slice, BtreeSlice, Context, ExpTime, Item, MemStore, RgetBoundMode, StoreKey, Transaction};
//!
//! let store = Arc::new(MemStore::default());
//! store.builder().load(vec![
//!     (StoreKey::from("a"), Item::new("1")),
//!     (StoreKey::from("b"), Item::new("2").expiring_at(ExpTime(100))),
//!     (StoreKey::from("c"), Item::new("3")),
//! ]);
//!
//! let home = Context::spawn("home")?;
//! let slice = BtreeSlice::new(Arc::clone(&store));
//! let txn = Transaction::begin(Arc::clone(&store), &home)?;
//! let superblock = txn.superblock();
//!
//! let keys: Vec<String> = rget_slice(
//!     &slice,
//!     RgetBoundMode::Closed,
//!     &StoreKey::from("a"),
//!     RgetBoundMode::None,
//!     &StoreKey::default(),
//!     ExpTime(100),
//!     txn,
//!     &superblock,
//! )
//! .map(|entry| entry.map(|e| e.key.to_string()))
//! .collect::<Result<_, _>>()?;
//!
//! assert_eq!(keys, ["a", "c"]);
//! assert_eq!(store.active_snapshots(), 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use log::debug;
use std::fmt;
use std::sync::Arc;

pub mod bound;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod iter;
pub mod latch;
pub mod node;
pub mod scan;
pub mod store;
pub mod txn;
pub mod value;

pub use bound::{KeyRange, RgetBoundMode};
pub use config::{ScanConfig, TraversalPolicy};
pub use context::{Context, ContextId};
pub use error::{Error, Result, StorageError};
pub use iter::{KeyWithData, RgetResult};
pub use node::{BlockId, StoreKey, MAX_KEY_SIZE};
pub use store::{BlockSize, BlockSource, MemStore, Superblock};
pub use txn::Transaction;
pub use value::{ExpTime, Item};

use iter::{ExpirationFilter, Filter, Transform, ValueMaterializer};
use scan::BoundedLeafScanner;
use value::CacheValueSizer;

/// A tree in a [`BlockSource`], together with the settings its scans use.
pub struct BtreeSlice<S: BlockSource> {
	store: Arc<S>,
	config: ScanConfig,
}

impl<S: BlockSource> BtreeSlice<S> {
	pub fn new(store: Arc<S>) -> Self {
		BtreeSlice {
			store,
			config: ScanConfig::default(),
		}
	}

	pub fn with_config(mut self, config: ScanConfig) -> Self {
		self.config = config;
		self
	}

	pub fn store(&self) -> &Arc<S> {
		&self.store
	}

	pub fn config(&self) -> &ScanConfig {
		&self.config
	}
}

impl<S: BlockSource> Clone for BtreeSlice<S> {
	fn clone(&self) -> Self {
		BtreeSlice {
			store: Arc::clone(&self.store),
			config: self.config,
		}
	}
}

impl<S: BlockSource> fmt::Debug for BtreeSlice<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BtreeSlice").field("block_size", &self.store.block_size()).field("config", &self.config).finish()
	}
}

/// Starts a range query over the version of `slice` rooted at `superblock`.
///
/// Entries whose key lies between the two bounds and that are still alive at
/// `effective_time` are returned in ascending key order. The query takes ownership of `txn`
/// and releases it on its home context once the result is exhausted, fails, or is dropped.
///
/// Nothing is read until the first pull. An empty tree or a range whose start lies after its
/// end yields no entries.
#[allow(clippy::too_many_arguments)]
pub fn rget_slice<S: BlockSource>(
	slice: &BtreeSlice<S>,
	left_mode: RgetBoundMode,
	left_key: &StoreKey,
	right_mode: RgetBoundMode,
	right_key: &StoreKey,
	effective_time: ExpTime,
	txn: Transaction<S>,
	superblock: &Superblock,
) -> RgetResult<S> {
	let sizer = CacheValueSizer::new(slice.store.block_size());
	let range = KeyRange::resolve(left_mode, left_key, right_mode, right_key);
	debug!("rget {:?} at {:?} for a transaction homed on {} ({:?})", range, effective_time, txn.home().id(), slice.config.policy);

	let scanner = BoundedLeafScanner::new(Arc::clone(&slice.store), Box::new(sizer), superblock, range, slice.config.policy);
	let live = Filter::new(scanner, ExpirationFilter::new(effective_time));
	let materialized = Transform::new(live, ValueMaterializer::new(&txn));

	RgetResult::new(materialized, txn)
}
