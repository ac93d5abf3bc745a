//! Versioned node latch with optimistic, shared and exclusive access.
//!
//! The latch pairs a raw reader-writer lock with a version counter. Shared and exclusive
//! access block; optimistic access does not, and has to be validated with
//! [`OptimisticGuard::recheck`] before anything read through it is trusted.
//!
//! Blocking access is handed out as owned guards ([`SharedGuard`], [`ExclusiveGuard`]) that
//! keep the latch alive through an `Arc`. A range scan keeps such a guard in its cursor
//! between pulls, and the cursor may be dropped on a different thread than the one that
//! locked the node, so the guards are not tied to a borrow or to the locking thread.
//!
//! The version is even while the latch is free or shared and odd while an exclusive holder
//! is inside.

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A latch that uses versioning to enable optimistic, shared or exclusive access to the
/// underlying data.
pub struct HybridLatch<T> {
	version: AtomicUsize,
	lock: RawRwLock,
	data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for HybridLatch<T> {}
unsafe impl<T: Send + Sync> Sync for HybridLatch<T> {}

impl<T> HybridLatch<T> {
	/// Creates a new, unlocked latch.
	#[inline]
	pub fn new(data: T) -> HybridLatch<T> {
		HybridLatch {
			version: AtomicUsize::new(0),
			lock: RawRwLock::INIT,
			data: UnsafeCell::new(data),
		}
	}

	/// Locks the latch with shared access, blocking until it can be acquired.
	#[inline]
	pub fn shared(this: &Arc<Self>) -> SharedGuard<T> {
		this.lock.lock_shared();
		SharedGuard {
			latch: Arc::clone(this),
		}
	}

	/// Locks the latch with exclusive access, blocking until it can be acquired.
	#[inline]
	pub fn exclusive(this: &Arc<Self>) -> ExclusiveGuard<T> {
		this.lock.lock_exclusive();
		let version = this.version.load(Ordering::Relaxed) + 1;
		this.version.store(version, Ordering::Release);
		ExclusiveGuard {
			latch: Arc::clone(this),
			version,
		}
	}

	/// Acquires optimistic read access without blocking. Returns `None` while an exclusive
	/// holder is inside.
	///
	/// The returned guard does NOT validate anything when dropped.
	#[inline]
	pub fn optimistic(&self) -> Option<OptimisticGuard<'_, T>> {
		let version = self.version.load(Ordering::Acquire);
		if version & 1 == 1 {
			return None;
		}

		Some(OptimisticGuard {
			latch: self,
			version,
		})
	}
}

/// Structure used to perform optimistic accesses and validation.
pub struct OptimisticGuard<'a, T> {
	latch: &'a HybridLatch<T>,
	version: usize,
}

impl<'a, T> OptimisticGuard<'a, T> {
	/// Validates all previous optimistic accesses since the creation of the guard. Returns
	/// `false` if a writer entered the latch in the meantime, in which case everything read
	/// through this guard must be discarded.
	#[inline]
	pub fn recheck(&self) -> bool {
		self.version == self.latch.version.load(Ordering::Acquire)
	}
}

impl<'a, T> std::ops::Deref for OptimisticGuard<'a, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.latch.data.get() }
	}
}

/// Owned shared access to a latch, released when dropped.
pub struct SharedGuard<T> {
	latch: Arc<HybridLatch<T>>,
}

// SAFETY: the raw lock keeps no owner-thread state, so a shared hold may end on any thread.
// Readers only ever get `&T`, which requires `T: Sync` to cross threads.
unsafe impl<T: Send + Sync> Send for SharedGuard<T> {}
unsafe impl<T: Send + Sync> Sync for SharedGuard<T> {}

impl<T> Drop for SharedGuard<T> {
	#[inline]
	fn drop(&mut self) {
		// SAFETY: this guard was created by a successful `lock_shared`.
		unsafe { self.latch.lock.unlock_shared() }
	}
}

impl<T> std::ops::Deref for SharedGuard<T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		unsafe { &*self.latch.data.get() }
	}
}

/// Owned exclusive access to a latch, released when dropped.
pub struct ExclusiveGuard<T> {
	latch: Arc<HybridLatch<T>>,
	version: usize,
}

// SAFETY: as for `SharedGuard`.
unsafe impl<T: Send + Sync> Send for ExclusiveGuard<T> {}
unsafe impl<T: Send + Sync> Sync for ExclusiveGuard<T> {}

impl<T> Drop for ExclusiveGuard<T> {
	#[inline]
	fn drop(&mut self) {
		self.latch.version.store(self.version + 1, Ordering::Release);
		// SAFETY: this guard was created by a successful exclusive lock.
		unsafe { self.latch.lock.unlock_exclusive() }
	}
}

impl<T> std::ops::Deref for ExclusiveGuard<T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		unsafe { &*self.latch.data.get() }
	}
}
