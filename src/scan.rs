//! Bounded, lock-coupled leaf scan.
//!
//! [`BoundedLeafScanner`] walks the part of one tree version that intersects a [`KeyRange`]
//! and yields its entries in ascending key order, one per pull.
//!
//! ## Frontier
//!
//! Pending nodes live in a stack of per-level FIFO queues. Every queue holds nodes of one
//! tree level in key order, and a deeper queue only ever holds nodes to the left of
//! everything still queued above it. Popping the front of the deepest queue therefore always
//! yields the leftmost pending node.
//!
//! ```text
//!  level 0   [            ]            root already expanded
//!  level 1   [ C  D       ]            right siblings, unlocked ids
//!  level 2   [ b2 b3      ]  ◄── pop   children of B, leftmost first
//! ```
//!
//! An entry is either a locked node or just a block id. Ids stay valid after the parent that
//! held them is unlocked because published blocks are never rewritten while a snapshot is
//! pinned.
//!
//! ## Policies
//!
//! - [`TraversalPolicy::DepthFirst`]: expanding a node pushes a new level of child ids and
//!   locks the first child before the parent is released. The cursor holds the current leaf
//!   plus at most one node in transit.
//! - [`TraversalPolicy::Hybrid`]: starts breadth-first, popping the shallowest level and
//!   locking every in-range child before the parent is released. Once more than
//!   `frontier_limit` nodes are locked it switches, for good, to the depth-first order above.
//!
//! Nothing is read before the first pull.

use log::{debug, trace};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::bound::KeyRange;
use crate::config::TraversalPolicy;
use crate::error::{Error, Result, StorageError};
use crate::iter::OneWay;
use crate::node::{BlockId, EntrySpan, Node, StoreKey};
use crate::store::{Access, BlockSource, NodeLock, Superblock};
use crate::value::{CacheValue, DecodeError, ValueSizer};

/// Counters for one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStats {
	/// Nodes locked, internal and leaf.
	pub nodes_locked: usize,
	pub leaves_visited: usize,
	/// Most node locks the scanner held at once.
	pub peak_locks: usize,
}

/// A reference to a stored value. Valid as long as it is alive: it keeps its leaf locked.
#[derive(Clone)]
pub struct ValueRef {
	leaf: Arc<NodeLock>,
	span: EntrySpan,
}

impl ValueRef {
	/// The encoded value.
	pub fn bytes(&self) -> &[u8] {
		match &**self.leaf {
			Node::Leaf(leaf) => leaf.value_of(&self.span),
			// Only leaves are ever referenced
			Node::Internal(_) => &[],
		}
	}

	pub fn decode(&self) -> std::result::Result<CacheValue<'_>, DecodeError> {
		CacheValue::decode(self.bytes())
	}

	/// The leaf this value lives in.
	pub fn block(&self) -> BlockId {
		self.leaf.id()
	}
}

impl fmt::Debug for ValueRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ValueRef").field("block", &self.leaf.id()).field("span", &self.span).finish()
	}
}

/// A key and a reference to its stored value, as read from a leaf.
#[derive(Debug, Clone)]
pub struct StoredEntry {
	pub key: StoreKey,
	pub value: ValueRef,
}

enum Pending {
	Locked(NodeLock),
	Unlocked(BlockId),
}

impl Pending {
	fn id(&self) -> BlockId {
		match self {
			Pending::Locked(lock) => lock.id(),
			Pending::Unlocked(id) => *id,
		}
	}
}

type Level = VecDeque<Pending>;

enum Step {
	Emit(StoredEntry),
	/// Passed the end bound; nothing further right can match.
	PastEnd,
	/// Leaf used up.
	Drained,
}

struct LeafCursor {
	leaf: Arc<NodeLock>,
	spans: Vec<EntrySpan>,
	pos: usize,
}

impl LeafCursor {
	fn open(lock: NodeLock, sizer: &dyn ValueSizer, range: &KeyRange) -> Result<LeafCursor> {
		let Node::Leaf(leaf) = &*lock else {
			return Err(Error::Storage(StorageError::Corrupt {
				block: lock.id(),
				reason: "expected a leaf".into(),
			}));
		};
		let spans = leaf.parse(sizer, lock.id())?;
		let pos = spans.partition_point(|span| !range.after_start(leaf.key_of(span)));

		Ok(LeafCursor {
			leaf: Arc::new(lock),
			spans,
			pos,
		})
	}

	fn step(&mut self, range: &KeyRange) -> Result<Step> {
		let Node::Leaf(leaf) = &**self.leaf else {
			return Ok(Step::Drained);
		};
		let Some(span) = self.spans.get(self.pos).copied() else {
			return Ok(Step::Drained);
		};

		let key = leaf.key_of(&span);
		if !range.before_end(key) {
			return Ok(Step::PastEnd);
		}
		self.pos += 1;

		let key = StoreKey::new(key).ok_or_else(|| StorageError::Corrupt {
			block: self.leaf.id(),
			reason: format!("key of {} bytes", key.len()),
		})?;
		Ok(Step::Emit(StoredEntry {
			key,
			value: ValueRef {
				leaf: Arc::clone(&self.leaf),
				span,
			},
		}))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
	BreadthFirst {
		frontier_limit: usize,
	},
	DepthFirst,
}

/// Yields the entries of one tree version that fall inside a key range, in key order.
pub struct BoundedLeafScanner<S: BlockSource> {
	store: Arc<S>,
	sizer: Box<dyn ValueSizer>,
	range: KeyRange,
	root: Option<BlockId>,
	mode: Mode,
	levels: SmallVec<[Level; 8]>,
	/// `Pending::Locked` entries in `levels`.
	locked: usize,
	leaf: Option<LeafCursor>,
	started: bool,
	finished: bool,
	stats: ScanStats,
}

impl<S: BlockSource> BoundedLeafScanner<S> {
	/// Prepares a scan of the version rooted at `superblock`. Performs no I/O.
	pub fn new(store: Arc<S>, sizer: Box<dyn ValueSizer>, superblock: &Superblock, range: KeyRange, policy: TraversalPolicy) -> Self {
		let mode = match policy {
			TraversalPolicy::DepthFirst => Mode::DepthFirst,
			TraversalPolicy::Hybrid {
				frontier_limit,
			} => Mode::BreadthFirst {
				frontier_limit: frontier_limit.get(),
			},
		};

		BoundedLeafScanner {
			store,
			sizer,
			range,
			root: superblock.root,
			mode,
			levels: SmallVec::new(),
			locked: 0,
			leaf: None,
			started: false,
			finished: false,
			stats: ScanStats::default(),
		}
	}

	pub fn range(&self) -> &KeyRange {
		&self.range
	}

	pub fn stats(&self) -> ScanStats {
		self.stats
	}

	pub fn is_finished(&self) -> bool {
		self.finished
	}

	/// Node locks the scanner holds right now.
	pub fn locks_held(&self) -> usize {
		self.locked + usize::from(self.leaf.is_some())
	}

	fn start(&mut self) {
		self.started = true;
		match self.root {
			Some(root) if !self.range.is_empty() => {
				debug!("scan of {:?} starting at root {} ({:?})", self.range, root, self.mode);
				self.levels.push(VecDeque::from([Pending::Unlocked(root)]));
			}
			_ => {
				debug!("scan of {:?} has nothing to visit", self.range);
				self.finished = true;
			}
		}
	}

	/// Drops every lock and marks the scan done.
	fn finish(&mut self) {
		self.leaf = None;
		self.levels.clear();
		self.locked = 0;
		self.finished = true;
		trace!("scan finished: {:?}", self.stats);
	}

	/// `in_transit` counts the locks held outside the frontier and leaf, the new one included.
	fn note_lock(&mut self, in_transit: usize) {
		self.stats.nodes_locked += 1;
		self.stats.peak_locks = self.stats.peak_locks.max(self.locks_held() + in_transit);
	}

	fn acquire(&mut self, id: BlockId, in_transit: usize) -> Result<NodeLock> {
		let lock = self.store.acquire(id, Access::Read)?;
		self.note_lock(in_transit);
		Ok(lock)
	}

	/// Index of the level the next node is taken from.
	fn next_level(&self) -> Option<usize> {
		match self.mode {
			Mode::BreadthFirst {
				..
			} => self.levels.iter().position(|level| !level.is_empty()),
			Mode::DepthFirst => self.levels.iter().rposition(|level| !level.is_empty()),
		}
	}

	fn pop_pending(&mut self) -> Option<(usize, Pending)> {
		let depth = self.next_level()?;
		let pending = self.levels[depth].pop_front()?;
		if matches!(pending, Pending::Locked(_)) {
			self.locked -= 1;
		}
		if let Mode::DepthFirst = self.mode {
			while self.levels.last().is_some_and(VecDeque::is_empty) {
				self.levels.pop();
			}
		}
		Some((depth, pending))
	}

	/// Pushes `children` of a node at `depth`. The parent is still locked by the caller.
	fn push_children(&mut self, depth: usize, children: SmallVec<[BlockId; 32]>) -> Result<()> {
		match self.mode {
			Mode::BreadthFirst {
				frontier_limit,
			} => {
				if self.levels.len() == depth + 1 {
					self.levels.push(VecDeque::new());
				}
				for id in children {
					let lock = self.acquire(id, 2)?;
					self.levels[depth + 1].push_back(Pending::Locked(lock));
					self.locked += 1;
				}
				if self.locked > frontier_limit {
					debug!("frontier holds {} locked nodes, above {}; continuing depth-first", self.locked, frontier_limit);
					self.mode = Mode::DepthFirst;
				}
			}
			Mode::DepthFirst => {
				let mut level = Level::with_capacity(children.len());
				let mut children = children.into_iter();
				// Lock coupling: the first child is locked while the parent still is
				if let Some(first) = children.next() {
					let lock = self.acquire(first, 2)?;
					level.push_back(Pending::Locked(lock));
					self.locked += 1;
				}
				level.extend(children.map(Pending::Unlocked));
				self.levels.push(level);
			}
		}
		Ok(())
	}

	/// Takes the next pending node and either expands it or opens it as the current leaf.
	fn advance(&mut self) -> Result<bool> {
		let Some((depth, pending)) = self.pop_pending() else {
			return Ok(false);
		};

		let node = match pending {
			Pending::Locked(lock) => lock,
			Pending::Unlocked(id) => self.acquire(id, 1)?,
		};

		let children: Option<SmallVec<[BlockId; 32]>> = match &*node {
			Node::Leaf(_) => None,
			Node::Internal(internal) => {
				let within = internal.children_within(self.range.start(), self.range.end());
				Some(within.filter_map(|pos| internal.edge_at(pos)).collect())
			}
		};

		match children {
			None => {
				trace!("entering leaf {}", node.id());
				self.stats.leaves_visited += 1;
				self.leaf = Some(LeafCursor::open(node, self.sizer.as_ref(), &self.range)?);
			}
			Some(children) => {
				trace!("expanding {} at depth {} into {} children", node.id(), depth, children.len());
				self.push_children(depth, children)?;
				drop(node);
			}
		}
		Ok(true)
	}

	/// Pulls the next entry from the current leaf, moving through the tree as needed.
	fn next_entry(&mut self) -> Result<Option<StoredEntry>> {
		loop {
			if let Some(cursor) = self.leaf.as_mut() {
				match cursor.step(&self.range)? {
					Step::Emit(entry) => return Ok(Some(entry)),
					Step::PastEnd => return Ok(None),
					Step::Drained => self.leaf = None,
				}
			}

			if !self.advance()? {
				return Ok(None);
			}
		}
	}
}

impl<S: BlockSource> OneWay for BoundedLeafScanner<S> {
	type Item = StoredEntry;

	fn next(&mut self) -> Result<Option<StoredEntry>> {
		if !self.started {
			self.start();
		}
		if self.finished {
			return Ok(None);
		}

		match self.next_entry() {
			Ok(Some(entry)) => Ok(Some(entry)),
			Ok(None) => {
				self.finish();
				Ok(None)
			}
			Err(e) => {
				debug!("scan of {:?} failed: {}", self.range, e);
				self.finish();
				Err(e)
			}
		}
	}

	fn prefetch(&mut self) {
		if self.finished {
			return;
		}
		if !self.started {
			if let Some(root) = self.root {
				self.store.prefetch(root);
			}
			return;
		}

		let next = self.next_level().and_then(|depth| self.levels[depth].front());
		if let Some(Pending::Unlocked(id)) = next {
			self.store.prefetch(*id);
		}
	}
}

impl<S: BlockSource> fmt::Debug for BoundedLeafScanner<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let frontier: Vec<Vec<BlockId>> = self.levels.iter().map(|level| level.iter().map(Pending::id).collect()).collect();
		f.debug_struct("BoundedLeafScanner")
			.field("range", &self.range)
			.field("mode", &self.mode)
			.field("frontier", &frontier)
			.field("leaf", &self.leaf.as_ref().map(|cursor| cursor.leaf.id()))
			.field("stats", &self.stats)
			.finish()
	}
}
