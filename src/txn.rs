//! Read transactions.
//!
//! A [`Transaction`] pins one version of the tree and belongs to the context it was begun
//! on, its home. Pinning, unpinning and blob reads all happen on the home context: release
//! goes through [`Context::run`] no matter which thread drops the handle, and a
//! [`BlobReader`] refuses to read anywhere else.

use bytes::Bytes;
use log::{debug, error};
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::node::BlobId;
use crate::store::{BlockSize, BlockSource, SnapshotPin, Superblock};

type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

/// An owned read transaction over a [`BlockSource`].
///
/// The snapshot is released exactly once, by [`Transaction::release`] or on drop, and always
/// on the home context. If the home context has shut down the snapshot is left pinned and the
/// failure is logged.
pub struct Transaction<S: BlockSource> {
	home: Context,
	store: Arc<S>,
	pin: Option<SnapshotPin>,
	on_release: Option<ReleaseHook>,
}

impl<S: BlockSource> Transaction<S> {
	/// Pins the store's current version on `home`.
	pub fn begin(store: Arc<S>, home: &Context) -> Result<Transaction<S>> {
		let pinning = Arc::clone(&store);
		let pin = home.run(move || pinning.pin_snapshot())?;
		debug!("transaction {} began on {} at {:?}", pin.id(), home.id(), pin.superblock());

		Ok(Transaction {
			home: home.clone(),
			store,
			pin: Some(pin),
			on_release: None,
		})
	}

	/// The context this transaction must be released on.
	pub fn home(&self) -> &Context {
		&self.home
	}

	/// Root of the pinned version.
	pub fn superblock(&self) -> Superblock {
		self.pin.as_ref().map(SnapshotPin::superblock).unwrap_or_default()
	}

	pub fn block_size(&self) -> BlockSize {
		self.store.block_size()
	}

	/// Reader for out-of-line payloads of the pinned version.
	pub fn blobs(&self) -> BlobReader<S> {
		BlobReader {
			home: self.home.clone(),
			store: Arc::clone(&self.store),
		}
	}

	/// Registers a hook that runs on the home context right after the snapshot is released.
	pub fn on_release<F>(&mut self, hook: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.on_release = Some(Box::new(hook));
	}

	/// Releases the snapshot on the home context.
	pub fn release(mut self) -> Result<()> {
		self.release_on_home()
	}

	fn release_on_home(&mut self) -> Result<()> {
		let Some(pin) = self.pin.take() else {
			return Ok(());
		};
		let id = pin.id();
		let store = Arc::clone(&self.store);
		let hook = self.on_release.take();

		let released = self.home.run(move || {
			store.release_snapshot(pin);
			if let Some(hook) = hook {
				hook();
			}
		});

		match released {
			Ok(()) => {
				debug!("transaction {} released on {}", id, self.home.id());
				Ok(())
			}
			Err(e) => {
				error!("transaction {} could not be released on {}: {}", id, self.home.id(), e);
				Err(e)
			}
		}
	}
}

impl<S: BlockSource> Drop for Transaction<S> {
	fn drop(&mut self) {
		// Failures are logged by the release itself
		let _ = self.release_on_home();
	}
}

impl<S: BlockSource> fmt::Debug for Transaction<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Transaction").field("home", &self.home.id()).field("pin", &self.pin).finish()
	}
}

/// Reads out-of-line payloads on behalf of a transaction. Only usable on the transaction's
/// home context.
pub struct BlobReader<S: BlockSource> {
	home: Context,
	store: Arc<S>,
}

impl<S: BlockSource> Clone for BlobReader<S> {
	fn clone(&self) -> Self {
		BlobReader {
			home: self.home.clone(),
			store: Arc::clone(&self.store),
		}
	}
}

impl<S: BlockSource> BlobReader<S> {
	pub fn read(&self, id: BlobId) -> Result<Bytes> {
		self.home.assert_current()?;
		Ok(self.store.read_blob(id)?)
	}
}
