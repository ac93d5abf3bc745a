//! Block identifiers, keys and the node layout read by the scanner.
//!
//! The tree consists of two kinds of blocks:
//!
//! - **Internal nodes** hold separator keys and child block ids. Child `i` covers the keys in
//!   `(keys[i - 1], keys[i]]`; `upper_edge` covers everything above the last separator.
//! - **Leaf nodes** hold an encoded run of entries, `[key_len u8][key][value]...`, sorted by
//!   key. A value's length is not stored next to it: it is recovered from the value's own
//!   header through a [`ValueSizer`], so a leaf cannot be parsed without one.
//!
//! Blocks are immutable once a version of the tree is published. A child id copied out of a
//! parent therefore stays valid after the parent's lock is released, for as long as the
//! snapshot that reached it is pinned.

use smallvec::SmallVec;
use std::borrow::Borrow;
use std::fmt;
use std::ops::{Bound, Range};

use crate::error::StorageError;
use crate::value::ValueSizer;

/// Longest key a store accepts, in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Identifies a block in a [`crate::store::BlockSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Identifies an out-of-line payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "blob#{}", self.0)
	}
}

/// A key as stored in the tree, compared bytewise.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
	/// Returns `None` if `bytes` is longer than [`MAX_KEY_SIZE`].
	pub fn new(bytes: impl AsRef<[u8]>) -> Option<StoreKey> {
		let bytes = bytes.as_ref();
		(bytes.len() <= MAX_KEY_SIZE).then(|| StoreKey(bytes.to_vec()))
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// # Panics
///
/// Panics if the string is longer than [`MAX_KEY_SIZE`].
impl From<&str> for StoreKey {
	fn from(s: &str) -> StoreKey {
		StoreKey::new(s).expect("key longer than MAX_KEY_SIZE")
	}
}

impl Borrow<[u8]> for StoreKey {
	fn borrow(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for StoreKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", String::from_utf8_lossy(&self.0))
	}
}

impl fmt::Display for StoreKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&String::from_utf8_lossy(&self.0))
	}
}

/// A block of the tree.
#[derive(Debug)]
pub enum Node {
	Internal(InternalNode),
	Leaf(LeafNode),
}

impl Node {
	#[inline]
	pub fn is_leaf(&self) -> bool {
		matches!(self, Node::Leaf(_))
	}
}

/// An index node: separator keys and child pointers.
#[derive(Debug, Default)]
pub struct InternalNode {
	/// Separator keys, sorted in ascending order.
	pub(crate) keys: Vec<StoreKey>,
	/// `edges[i]` points to the subtree with keys `<= keys[i]`.
	pub(crate) edges: SmallVec<[BlockId; 32]>,
	/// Rightmost child, for keys `> keys[len - 1]`.
	pub(crate) upper_edge: Option<BlockId>,
}

impl InternalNode {
	/// Number of separator keys; the node has `len() + 1` children.
	#[inline]
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Binary search for the child edge to follow for a given key.
	///
	/// Returns `(position, exact_match)` where `exact_match` is true if `key == keys[position]`.
	/// Position `len()` designates the upper edge.
	pub fn lower_bound(&self, key: &[u8]) -> (usize, bool) {
		let mut lower = 0;
		let mut upper = self.keys.len();

		while lower < upper {
			let mid = ((upper - lower) / 2) + lower;
			let mid_key: &[u8] = self.keys[mid].borrow();

			if key < mid_key {
				upper = mid;
			} else if key > mid_key {
				lower = mid + 1;
			} else {
				return (mid, true);
			}
		}

		(lower, false)
	}

	/// Returns the child pointer at the given position; `len()` is the upper edge.
	pub fn edge_at(&self, pos: usize) -> Option<BlockId> {
		if pos == self.keys.len() {
			self.upper_edge
		} else {
			self.edges.get(pos).copied()
		}
	}

	/// Returns the positions of the children whose key span intersects the range, in
	/// ascending key order. May include a child that holds no key of the range, never
	/// leaves one out.
	pub fn children_within(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Range<usize> {
		let first = match start {
			Bound::Unbounded => 0,
			// Child `pos` holds keys up to and including `keys[pos]`, so an exclusive start
			// on a separator begins in the next child.
			Bound::Excluded(key) => match self.lower_bound(key) {
				(pos, true) => pos + 1,
				(pos, false) => pos,
			},
			Bound::Included(key) => self.lower_bound(key).0,
		};
		let last = match end {
			Bound::Unbounded => self.keys.len(),
			Bound::Included(key) | Bound::Excluded(key) => self.lower_bound(key).0,
		};

		if first > last {
			first..first
		} else {
			first..last + 1
		}
	}
}

/// Location of one entry inside a leaf's encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpan {
	pub key: (u32, u32),
	pub value: (u32, u32),
}

impl EntrySpan {
	#[inline]
	pub fn key_range(&self) -> Range<usize> {
		self.key.0 as usize..self.key.1 as usize
	}

	#[inline]
	pub fn value_range(&self) -> Range<usize> {
		self.value.0 as usize..self.value.1 as usize
	}
}

/// A data node: an encoded, sorted run of entries.
#[derive(Debug, Default)]
pub struct LeafNode {
	pub(crate) count: u16,
	pub(crate) data: Vec<u8>,
}

impl LeafNode {
	/// Number of entries in this leaf.
	#[inline]
	pub fn len(&self) -> usize {
		self.count as usize
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.count == 0
	}

	/// Appends an entry. Keys must arrive in ascending order.
	pub(crate) fn push(&mut self, key: &StoreKey, value: &[u8]) {
		debug_assert!(key.len() <= MAX_KEY_SIZE);
		self.data.push(key.len() as u8);
		self.data.extend_from_slice(key.as_bytes());
		self.data.extend_from_slice(value);
		self.count += 1;
	}

	/// Walks the encoded entries and returns where each key and value lives.
	///
	/// `block` only labels errors.
	pub fn parse(&self, sizer: &dyn ValueSizer, block: BlockId) -> Result<Vec<EntrySpan>, StorageError> {
		let corrupt = |reason: String| StorageError::Corrupt {
			block,
			reason,
		};

		let mut spans = Vec::with_capacity(self.len());
		let mut offset = 0usize;

		for i in 0..self.len() {
			let key_len = *self.data.get(offset).ok_or_else(|| corrupt(format!("entry {i} truncated")))? as usize;
			if key_len > MAX_KEY_SIZE {
				return Err(corrupt(format!("key of entry {i} is {key_len} bytes")));
			}
			let key_start = offset + 1;
			let value_start = key_start + key_len;
			if value_start > self.data.len() {
				return Err(corrupt(format!("key of entry {i} runs past the block")));
			}

			let value_len = sizer.size(&self.data[value_start..]).map_err(|e| corrupt(format!("entry {i}: {e}")))?;
			let value_end = value_start + value_len;
			if value_end > self.data.len() {
				return Err(corrupt(format!("value of entry {i} runs past the block")));
			}

			spans.push(EntrySpan {
				key: (key_start as u32, value_start as u32),
				value: (value_start as u32, value_end as u32),
			});
			offset = value_end;
		}

		if offset != self.data.len() {
			return Err(corrupt(format!("{} trailing bytes", self.data.len() - offset)));
		}

		Ok(spans)
	}

	#[inline]
	pub fn key_of(&self, span: &EntrySpan) -> &[u8] {
		&self.data[span.key_range()]
	}

	#[inline]
	pub fn value_of(&self, span: &EntrySpan) -> &[u8] {
		&self.data[span.value_range()]
	}
}
