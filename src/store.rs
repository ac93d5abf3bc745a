//! The block layer a range query reads from.
//!
//! [`BlockSource`] is the seam: it hands out owned node locks, out-of-line payloads and
//! snapshot pins. [`MemStore`] is the in-memory implementation used by hosts that keep the
//! whole tree resident, and by the tests.
//!
//! ## Versions and snapshots
//!
//! [`TreeBuilder`] writes a complete new version of the tree into fresh blocks and then
//! publishes its root in the store's [`Superblock`]. Published blocks are never modified, so
//! a reader holding a [`SnapshotPin`] can follow child ids it copied earlier without keeping
//! the parent locked. Writers that need a block to themselves (cache eviction, flushing) take
//! an [`Access::Write`] lock, which waits only for the readers currently inside that block.

use bytes::Bytes;
use log::trace;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::StorageError;
use crate::latch::{ExclusiveGuard, HybridLatch, SharedGuard};
use crate::node::{BlobId, BlockId, InternalNode, LeafNode, Node, StoreKey};
use crate::value::{CacheValueSizer, EncodedValue, Item, ValueSizer};

/// Default capacity for bulk-loaded leaves, in entries.
const DEFAULT_LEAF_CAPACITY: usize = 64;

/// Default number of children per bulk-loaded internal node.
const DEFAULT_FANOUT: usize = 64;

/// Size of a block, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize(u32);

impl BlockSize {
	pub const DEFAULT: BlockSize = BlockSize(4096);

	pub const fn new(bytes: u32) -> BlockSize {
		BlockSize(bytes)
	}

	#[inline]
	pub fn value(self) -> usize {
		self.0 as usize
	}
}

/// How a node is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
	/// Shared with other readers.
	Read,
	/// Exclusive; waits for every other holder to leave.
	Write,
}

/// Root of one published version of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Superblock {
	/// `None` for an empty tree.
	pub root: Option<BlockId>,
	/// Number of levels; `0` for an empty tree, `1` when the root is a leaf.
	pub height: usize,
}

/// Keeps one version of the tree readable. Not `Clone`: it is released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SnapshotPin {
	id: u64,
	superblock: Superblock,
}

impl SnapshotPin {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn superblock(&self) -> Superblock {
		self.superblock
	}
}

/// Counts node locks currently held against a store.
#[derive(Debug, Default)]
pub struct LockGauge {
	held: AtomicUsize,
	peak: AtomicUsize,
	acquired: AtomicUsize,
}

impl LockGauge {
	fn ticket(self: &Arc<Self>) -> GaugeTicket {
		let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
		self.peak.fetch_max(held, Ordering::AcqRel);
		self.acquired.fetch_add(1, Ordering::Relaxed);
		GaugeTicket(Arc::clone(self))
	}

	/// Locks held right now.
	pub fn held(&self) -> usize {
		self.held.load(Ordering::Acquire)
	}

	/// Most locks held at once since the last [`LockGauge::reset_peak`].
	pub fn peak(&self) -> usize {
		self.peak.load(Ordering::Acquire)
	}

	/// Locks ever taken.
	pub fn acquired(&self) -> usize {
		self.acquired.load(Ordering::Relaxed)
	}

	pub fn reset_peak(&self) {
		self.peak.store(self.held(), Ordering::Release);
	}
}

struct GaugeTicket(Arc<LockGauge>);

impl Drop for GaugeTicket {
	fn drop(&mut self) {
		self.0.held.fetch_sub(1, Ordering::AcqRel);
	}
}

enum Guard {
	Shared(SharedGuard<Node>),
	Exclusive(ExclusiveGuard<Node>),
}

/// An owned lock on one node. The lock is released when this value is dropped, on
/// whichever thread that happens.
pub struct NodeLock {
	id: BlockId,
	guard: Guard,
	_ticket: GaugeTicket,
}

impl NodeLock {
	pub fn id(&self) -> BlockId {
		self.id
	}

	pub fn access(&self) -> Access {
		match self.guard {
			Guard::Shared(_) => Access::Read,
			Guard::Exclusive(_) => Access::Write,
		}
	}
}

impl std::ops::Deref for NodeLock {
	type Target = Node;

	fn deref(&self) -> &Node {
		match &self.guard {
			Guard::Shared(g) => g,
			Guard::Exclusive(g) => g,
		}
	}
}

impl std::fmt::Debug for NodeLock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NodeLock").field("id", &self.id).field("access", &self.access()).finish()
	}
}

/// Block/node reader the range query depends on.
pub trait BlockSource: Send + Sync + 'static {
	fn block_size(&self) -> BlockSize;

	/// Locks a node and returns access to its contents.
	fn acquire(&self, id: BlockId, access: Access) -> Result<NodeLock, StorageError>;

	/// Hint that `id` will be acquired soon. Best-effort, must not block.
	fn prefetch(&self, _id: BlockId) {}

	/// Reads an out-of-line payload.
	fn read_blob(&self, id: BlobId) -> Result<Bytes, StorageError>;

	/// Keeps the current version readable until the pin is released.
	fn pin_snapshot(&self) -> SnapshotPin;

	fn release_snapshot(&self, pin: SnapshotPin);
}

/// In-memory [`BlockSource`].
pub struct MemStore {
	block_size: BlockSize,
	blocks: RwLock<Vec<Arc<HybridLatch<Node>>>>,
	blobs: RwLock<Vec<Bytes>>,
	superblock: RwLock<Superblock>,
	pins: Mutex<BTreeMap<u64, Superblock>>,
	next_pin: AtomicU64,
	gauge: Arc<LockGauge>,
	failing: RwLock<HashSet<BlockId>>,
	prefetched: AtomicUsize,
}

impl Default for MemStore {
	fn default() -> Self {
		Self::new(BlockSize::DEFAULT)
	}
}

impl MemStore {
	/// Creates an empty store.
	pub fn new(block_size: BlockSize) -> MemStore {
		MemStore {
			block_size,
			blocks: RwLock::new(Vec::new()),
			blobs: RwLock::new(Vec::new()),
			superblock: RwLock::new(Superblock::default()),
			pins: Mutex::new(BTreeMap::new()),
			next_pin: AtomicU64::new(1),
			gauge: Arc::new(LockGauge::default()),
			failing: RwLock::new(HashSet::new()),
			prefetched: AtomicUsize::new(0),
		}
	}

	/// Starts writing a new version of the tree.
	pub fn builder(&self) -> TreeBuilder<'_> {
		TreeBuilder {
			store: self,
			leaf_capacity: DEFAULT_LEAF_CAPACITY,
			fanout: DEFAULT_FANOUT,
		}
	}

	/// The most recently published version.
	pub fn superblock(&self) -> Superblock {
		*self.superblock.read()
	}

	/// Node locks held against this store.
	pub fn locks(&self) -> &LockGauge {
		&self.gauge
	}

	/// Number of snapshots pinned and not yet released.
	pub fn active_snapshots(&self) -> usize {
		self.pins.lock().len()
	}

	/// Number of prefetch hints that found their block.
	pub fn prefetched(&self) -> usize {
		self.prefetched.load(Ordering::Relaxed)
	}

	/// Makes every later `acquire` of `id` fail with [`StorageError::Unavailable`].
	pub fn fail_block(&self, id: BlockId) {
		self.failing.write().insert(id);
	}

	pub fn heal_block(&self, id: BlockId) {
		self.failing.write().remove(&id);
	}

	fn latch(&self, id: BlockId) -> Result<Arc<HybridLatch<Node>>, StorageError> {
		self.blocks.read().get(id.0 as usize).cloned().ok_or(StorageError::MissingBlock(id))
	}

	pub(crate) fn add_block(&self, node: Node) -> BlockId {
		let mut blocks = self.blocks.write();
		let id = BlockId(blocks.len() as u32);
		blocks.push(Arc::new(HybridLatch::new(node)));
		id
	}

	fn add_blob(&self, data: Bytes) -> BlobId {
		let mut blobs = self.blobs.write();
		let id = BlobId(blobs.len() as u64);
		blobs.push(data);
		id
	}

	pub(crate) fn publish(&self, superblock: Superblock) {
		*self.superblock.write() = superblock;
	}
}

impl BlockSource for MemStore {
	fn block_size(&self) -> BlockSize {
		self.block_size
	}

	fn acquire(&self, id: BlockId, access: Access) -> Result<NodeLock, StorageError> {
		if self.failing.read().contains(&id) {
			return Err(StorageError::Unavailable(id));
		}

		let latch = self.latch(id)?;
		let guard = match access {
			Access::Read => Guard::Shared(HybridLatch::shared(&latch)),
			Access::Write => Guard::Exclusive(HybridLatch::exclusive(&latch)),
		};
		trace!("acquired {:?} lock on {}", access, id);

		Ok(NodeLock {
			id,
			guard,
			_ticket: self.gauge.ticket(),
		})
	}

	fn prefetch(&self, id: BlockId) {
		let Ok(latch) = self.latch(id) else {
			return;
		};
		let Some(guard) = latch.optimistic() else {
			return;
		};
		let is_leaf = guard.is_leaf();
		if guard.recheck() {
			trace!("prefetched {} (leaf: {})", id, is_leaf);
			self.prefetched.fetch_add(1, Ordering::Relaxed);
		}
	}

	fn read_blob(&self, id: BlobId) -> Result<Bytes, StorageError> {
		self.blobs.read().get(id.0 as usize).cloned().ok_or(StorageError::MissingBlob(id))
	}

	fn pin_snapshot(&self) -> SnapshotPin {
		let id = self.next_pin.fetch_add(1, Ordering::Relaxed);
		let superblock = self.superblock();
		self.pins.lock().insert(id, superblock);
		SnapshotPin {
			id,
			superblock,
		}
	}

	fn release_snapshot(&self, pin: SnapshotPin) {
		let removed = self.pins.lock().remove(&pin.id);
		debug_assert!(removed.is_some(), "snapshot {} released twice", pin.id);
	}
}

/// Bulk loader that writes a balanced version of the tree and publishes it.
pub struct TreeBuilder<'s> {
	store: &'s MemStore,
	leaf_capacity: usize,
	fanout: usize,
}

impl<'s> TreeBuilder<'s> {
	/// Maximum entries per leaf (at least 1). Leaves also never exceed the block size.
	pub fn leaf_capacity(mut self, entries: usize) -> Self {
		self.leaf_capacity = entries.max(1);
		self
	}

	/// Maximum children per internal node (at least 2).
	pub fn fanout(mut self, children: usize) -> Self {
		self.fanout = children.max(2);
		self
	}

	/// Writes `items` as the new version of the tree and publishes it. When a key appears
	/// more than once the last item wins.
	pub fn load<I>(self, items: I) -> Superblock
	where
		I: IntoIterator<Item = (StoreKey, Item)>,
	{
		let items: BTreeMap<StoreKey, Item> = items.into_iter().collect();
		let sizer = CacheValueSizer::new(self.store.block_size);

		let mut level = self.write_leaves(items, &sizer);
		let mut height = usize::from(!level.is_empty());

		while level.len() > 1 {
			level = self.write_internal_level(level);
			height += 1;
		}

		let superblock = Superblock {
			root: level.first().map(|(id, _)| *id),
			height,
		};
		self.store.publish(superblock);
		superblock
	}

	fn write_leaves(&self, items: BTreeMap<StoreKey, Item>, sizer: &dyn ValueSizer) -> Vec<(BlockId, StoreKey)> {
		let block_size = self.store.block_size.value();
		let mut written = Vec::new();
		let mut leaf = LeafNode::default();
		let mut last_key = StoreKey::default();

		for (key, item) in items {
			let encoded = if item.data.len() > sizer.max_inline() {
				let len = item.data.len() as u32;
				let blob = self.store.add_blob(item.data.clone());
				EncodedValue::blob(blob, len)
			} else {
				EncodedValue::inline(&item.data)
			}
			.flags(item.flags)
			.cas(item.cas)
			.exptime(item.exptime)
			.build();

			let entry_len = 1 + key.len() + encoded.len();
			if !leaf.is_empty() && (leaf.len() >= self.leaf_capacity || leaf.data.len() + entry_len > block_size) {
				written.push((self.store.add_block(Node::Leaf(leaf)), last_key.clone()));
				leaf = LeafNode::default();
			}

			leaf.push(&key, &encoded);
			last_key = key;
		}

		if !leaf.is_empty() {
			written.push((self.store.add_block(Node::Leaf(leaf)), last_key));
		}

		written
	}

	fn write_internal_level(&self, children: Vec<(BlockId, StoreKey)>) -> Vec<(BlockId, StoreKey)> {
		// Spread children evenly so the last node is not left with a single child
		let groups = children.len().div_ceil(self.fanout);
		let per_group = children.len() / groups;
		let mut extra = children.len() % groups;

		let mut written = Vec::with_capacity(groups);
		let mut children = children.into_iter();

		for _ in 0..groups {
			let take = per_group + usize::from(extra > 0);
			extra = extra.saturating_sub(1);

			let mut node = InternalNode::default();
			let mut group: Vec<_> = children.by_ref().take(take).collect();
			let Some((upper, max_key)) = group.pop() else {
				break;
			};
			for (id, key) in group {
				node.keys.push(key);
				node.edges.push(id);
			}
			node.upper_edge = Some(upper);

			written.push((self.store.add_block(Node::Internal(node)), max_key));
		}

		written
	}
}
