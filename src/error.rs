//! # Error Types for Range Queries
//!
//! Two layers of errors exist:
//!
//! - [`StorageError`] is what the block layer reports: a node or blob could
//!   not be read, or its bytes did not decode.
//! - [`Error`] is what a range query reports to its caller. Storage failures
//!   are wrapped, never retried here, and always end the query.
//!
//! ## Error Flow
//!
//! ```text
//! next() ──► scanner ──► acquire(block) ──► Err(StorageError)
//!                                               │
//!                                               ▼
//!                              scope closes: inner stages dropped,
//!                              transaction released on its home context
//!                                               │
//!                                               ▼
//!                                   Err(Error::Storage) to caller
//! ```
//!
//! Every later pull on the same scope reports [`Error::Exhausted`].

use thiserror::Error;

use crate::context::ContextId;
use crate::node::{BlobId, BlockId};

/// Failures reported by a [`crate::store::BlockSource`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
	/// The block id does not name a block in this store.
	#[error("block {0} does not exist")]
	MissingBlock(BlockId),

	/// An out-of-line payload could not be found.
	#[error("blob {0} does not exist")]
	MissingBlob(BlobId),

	/// The block exists but its contents could not be decoded.
	#[error("block {block} is corrupt: {reason}")]
	Corrupt {
		block: BlockId,
		reason: String,
	},

	/// The block could not be read right now (transport or device failure).
	#[error("block {0} is unavailable")]
	Unavailable(BlockId),
}

/// Errors surfaced by a range query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// The block layer failed. Fatal for the current query.
	#[error("storage: {0}")]
	Storage(#[from] StorageError),

	/// A surviving entry could not be turned into a result.
	#[error("failed to materialize {key}: {reason}")]
	Materialize {
		key: String,
		reason: String,
	},

	/// The sequence was pulled after it finished or failed.
	#[error("pulled from an exhausted range query")]
	Exhausted,

	/// A transaction-scoped resource was touched off its home context.
	#[error("expected to run on context {expected}, running on {actual:?}")]
	WrongContext {
		expected: ContextId,
		actual: Option<ContextId>,
	},

	/// The home context of a transaction no longer accepts work.
	#[error("context {0} is closed")]
	ContextClosed(ContextId),
}

/// A Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
