//! Pull-based pipeline stages for range queries.
//!
//! A range query is a static chain of [`OneWay`] stages:
//!
//! ```text
//! BoundedLeafScanner ─► Filter<ExpirationFilter> ─► Transform<ValueMaterializer> ─► TransactionScoped
//!   StoredEntry            StoredEntry (live)          KeyWithData                   owns the txn
//! ```
//!
//! Each pull runs to completion on the calling thread, apart from the hop the materializer
//! makes to the transaction's home context. [`RgetResult`] puts a fused
//! [`Iterator`] face on the chain.

use bytes::Bytes;
use log::warn;
use std::fmt;
use std::iter::FusedIterator;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::node::StoreKey;
use crate::scan::{BoundedLeafScanner, ScanStats, StoredEntry};
use crate::store::BlockSource;
use crate::txn::{BlobReader, Transaction};
use crate::value::{ExpTime, Payload, StoredValue};

/// A single-pass sequence whose pulls can fail.
pub trait OneWay {
	type Item;

	/// Returns the next item, or `None` once the sequence is done.
	fn next(&mut self) -> Result<Option<Self::Item>>;

	/// Best-effort hint that [`OneWay::next`] is about to be called. Never blocks.
	fn prefetch(&mut self) {}
}

/// Decides whether an item survives a [`Filter`].
pub trait Predicate<T> {
	fn keep(&mut self, item: &T) -> Result<bool>;
}

impl<T, F> Predicate<T> for F
where
	F: FnMut(&T) -> Result<bool>,
{
	fn keep(&mut self, item: &T) -> Result<bool> {
		self(item)
	}
}

/// Converts items in a [`Transform`].
pub trait Mapper<T> {
	type Output;

	fn map(&mut self, item: T) -> Result<Self::Output>;
}

/// Drops the items its predicate rejects.
pub struct Filter<I, P> {
	inner: I,
	predicate: P,
}

impl<I, P> Filter<I, P> {
	pub fn new(inner: I, predicate: P) -> Self {
		Filter {
			inner,
			predicate,
		}
	}

	pub fn get_ref(&self) -> &I {
		&self.inner
	}
}

impl<I, P> OneWay for Filter<I, P>
where
	I: OneWay,
	P: Predicate<I::Item>,
{
	type Item = I::Item;

	fn next(&mut self) -> Result<Option<I::Item>> {
		while let Some(item) = self.inner.next()? {
			if self.predicate.keep(&item)? {
				return Ok(Some(item));
			}
		}
		Ok(None)
	}

	fn prefetch(&mut self) {
		self.inner.prefetch()
	}
}

/// Maps every item through its mapper.
pub struct Transform<I, M> {
	inner: I,
	mapper: M,
}

impl<I, M> Transform<I, M> {
	pub fn new(inner: I, mapper: M) -> Self {
		Transform {
			inner,
			mapper,
		}
	}

	pub fn get_ref(&self) -> &I {
		&self.inner
	}
}

impl<I, M> OneWay for Transform<I, M>
where
	I: OneWay,
	M: Mapper<I::Item>,
{
	type Item = M::Output;

	fn next(&mut self) -> Result<Option<M::Output>> {
		match self.inner.next()? {
			Some(item) => self.mapper.map(item).map(Some),
			None => Ok(None),
		}
	}

	fn prefetch(&mut self) {
		self.inner.prefetch()
	}
}

/// Keeps entries that are still alive at a fixed point in time.
#[derive(Debug, Clone, Copy)]
pub struct ExpirationFilter {
	now: ExpTime,
}

impl ExpirationFilter {
	pub fn new(now: ExpTime) -> ExpirationFilter {
		ExpirationFilter {
			now,
		}
	}
}

impl Predicate<StoredEntry> for ExpirationFilter {
	fn keep(&mut self, entry: &StoredEntry) -> Result<bool> {
		let value = entry.value.decode().map_err(|e| Error::Materialize {
			key: entry.key.to_string(),
			reason: e.to_string(),
		})?;
		Ok(!value.expired(self.now))
	}
}

/// A materialized rget result. Owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWithData {
	pub key: StoreKey,
	pub flags: u32,
	pub payload: Bytes,
}

/// Turns stored entries into [`KeyWithData`] on the transaction's home context.
pub struct ValueMaterializer<S: BlockSource> {
	home: Context,
	blobs: BlobReader<S>,
}

impl<S: BlockSource> ValueMaterializer<S> {
	pub fn new(txn: &Transaction<S>) -> Self {
		ValueMaterializer {
			home: txn.home().clone(),
			blobs: txn.blobs(),
		}
	}
}

impl<S: BlockSource> Mapper<StoredEntry> for ValueMaterializer<S> {
	type Output = KeyWithData;

	fn map(&mut self, entry: StoredEntry) -> Result<KeyWithData> {
		let blobs = self.blobs.clone();
		self.home.run(move || materialize(entry, &blobs))?
	}
}

fn materialize<S: BlockSource>(entry: StoredEntry, blobs: &BlobReader<S>) -> Result<KeyWithData> {
	let failed = |reason: String| Error::Materialize {
		key: entry.key.to_string(),
		reason,
	};

	let value = entry.value.decode().map_err(|e| failed(e.to_string()))?;
	let payload = match value.payload() {
		Payload::Inline(data) => Bytes::copy_from_slice(data),
		Payload::Blob {
			id,
			len,
		} => {
			let data = blobs.read(id)?;
			if data.len() != len as usize {
				return Err(failed(format!("{} holds {} bytes, expected {}", id, data.len(), len)));
			}
			data
		}
	};
	let flags = value.flags();

	Ok(KeyWithData {
		key: entry.key.clone(),
		flags,
		payload,
	})
}

/// Owns an inner pipeline together with the transaction it reads through.
///
/// Closing drops the inner pipeline, and with it every node lock, before the transaction is
/// released on its home context. The scope closes itself when the inner pipeline is done or
/// fails, and on drop. Pulling from a closed scope reports [`Error::Exhausted`].
pub struct TransactionScoped<I, S: BlockSource> {
	inner: Option<I>,
	txn: Option<Transaction<S>>,
}

impl<I: OneWay, S: BlockSource> TransactionScoped<I, S> {
	pub fn new(inner: I, txn: Transaction<S>) -> Self {
		TransactionScoped {
			inner: Some(inner),
			txn: Some(txn),
		}
	}

	pub fn get_ref(&self) -> Option<&I> {
		self.inner.as_ref()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.is_none()
	}

	/// Tears the scope down. Later calls do nothing.
	pub fn close(&mut self) -> Result<()> {
		drop(self.inner.take());
		match self.txn.take() {
			Some(txn) => txn.release(),
			None => Ok(()),
		}
	}
}

impl<I: OneWay, S: BlockSource> OneWay for TransactionScoped<I, S> {
	type Item = I::Item;

	fn next(&mut self) -> Result<Option<I::Item>> {
		let Some(inner) = self.inner.as_mut() else {
			return Err(Error::Exhausted);
		};

		match inner.next() {
			Ok(Some(item)) => Ok(Some(item)),
			Ok(None) => {
				self.close()?;
				Ok(None)
			}
			Err(e) => {
				if let Err(close) = self.close() {
					warn!("closing after {} failed too: {}", e, close);
				}
				Err(e)
			}
		}
	}

	fn prefetch(&mut self) {
		if let Some(inner) = self.inner.as_mut() {
			inner.prefetch()
		}
	}
}

impl<I, S: BlockSource> Drop for TransactionScoped<I, S> {
	fn drop(&mut self) {
		drop(self.inner.take());
		// Release errors are logged by the transaction
		drop(self.txn.take());
	}
}

/// The stage chain behind [`RgetResult`].
pub type RgetPipeline<S> = Transform<Filter<BoundedLeafScanner<S>, ExpirationFilter>, ValueMaterializer<S>>;

/// The sequence returned by [`crate::rget_slice`].
///
/// Yields live entries in ascending key order. After the last entry or the first error it
/// yields `None` forever. Dropping it early releases every lock and the transaction.
pub struct RgetResult<S: BlockSource> {
	scope: TransactionScoped<RgetPipeline<S>, S>,
	done: bool,
}

impl<S: BlockSource> RgetResult<S> {
	pub(crate) fn new(pipeline: RgetPipeline<S>, txn: Transaction<S>) -> Self {
		RgetResult {
			scope: TransactionScoped::new(pipeline, txn),
			done: false,
		}
	}

	/// Hints the store about the next block the scan will read.
	pub fn prefetch(&mut self) {
		self.scope.prefetch()
	}

	/// Scanner counters, until the sequence closes.
	pub fn stats(&self) -> Option<ScanStats> {
		self.scope.get_ref().map(|pipeline| pipeline.get_ref().get_ref().stats())
	}

	pub fn is_closed(&self) -> bool {
		self.scope.is_closed()
	}

	/// Stops the query and releases its transaction, reporting a failed release.
	pub fn close(mut self) -> Result<()> {
		self.done = true;
		self.scope.close()
	}
}

impl<S: BlockSource> Iterator for RgetResult<S> {
	type Item = Result<KeyWithData>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}
		match self.scope.next() {
			Ok(Some(entry)) => Some(Ok(entry)),
			Ok(None) => {
				self.done = true;
				None
			}
			Err(e) => {
				self.done = true;
				Some(Err(e))
			}
		}
	}
}

impl<S: BlockSource> FusedIterator for RgetResult<S> {}

impl<S: BlockSource> fmt::Debug for RgetResult<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RgetResult").field("closed", &self.is_closed()).field("done", &self.done).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemStore;
	use std::collections::VecDeque;
	use std::sync::Arc;

	struct Source {
		items: VecDeque<Result<u32>>,
		prefetched: usize,
	}

	impl Source {
		fn new(items: impl IntoIterator<Item = Result<u32>>) -> Source {
			Source {
				items: items.into_iter().collect(),
				prefetched: 0,
			}
		}
	}

	impl OneWay for Source {
		type Item = u32;

		fn next(&mut self) -> Result<Option<u32>> {
			self.items.pop_front().transpose()
		}

		fn prefetch(&mut self) {
			self.prefetched += 1;
		}
	}

	struct Double;

	impl Mapper<u32> for Double {
		type Output = u64;

		fn map(&mut self, item: u32) -> Result<u64> {
			Ok(item as u64 * 2)
		}
	}

	fn drain<I: OneWay>(stage: &mut I) -> Result<Vec<I::Item>> {
		let mut out = Vec::new();
		while let Some(item) = stage.next()? {
			out.push(item);
		}
		Ok(out)
	}

	#[test]
	fn filter_then_transform_is_lazy_and_ordered() {
		let pulled = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let seen = Arc::clone(&pulled);
		let odd = move |x: &u32| -> Result<bool> {
			seen.lock().push(*x);
			Ok(x % 2 == 1)
		};
		let mut stage = Transform::new(Filter::new(Source::new((0..6).map(Ok)), odd), Double);

		assert_eq!(stage.next().unwrap(), Some(2));
		assert_eq!(*pulled.lock(), vec![0, 1]);
		assert_eq!(drain(&mut stage).unwrap(), vec![6, 10]);
		assert_eq!(stage.next().unwrap(), None);
	}

	#[test]
	fn errors_pass_through_stages() {
		let keep_all = |_: &u32| -> Result<bool> { Ok(true) };
		let mut stage = Filter::new(Source::new([Ok(1), Err(Error::Exhausted), Ok(2)]), keep_all);
		assert_eq!(stage.next().unwrap(), Some(1));
		assert_eq!(stage.next(), Err(Error::Exhausted));

		let reject = |x: &u32| -> Result<bool> {
			if *x == 3 {
				Err(Error::Materialize {
					key: "3".into(),
					reason: "bad".into(),
				})
			} else {
				Ok(true)
			}
		};
		let mut stage = Filter::new(Source::new([Ok(3)]), reject);
		assert!(matches!(stage.next(), Err(Error::Materialize { .. })));
	}

	#[test]
	fn prefetch_reaches_the_source() {
		let keep_all = |_: &u32| -> Result<bool> { Ok(true) };
		let mut stage = Transform::new(Filter::new(Source::new([Ok(1)]), keep_all), Double);
		stage.prefetch();
		stage.prefetch();
		assert_eq!(stage.get_ref().get_ref().prefetched, 2);
	}

	fn scoped(items: Vec<Result<u32>>) -> (Arc<MemStore>, TransactionScoped<Source, MemStore>) {
		let store = Arc::new(MemStore::default());
		let home = Context::spawn("scope").unwrap();
		let txn = Transaction::begin(Arc::clone(&store), &home).unwrap();
		(store, TransactionScoped::new(Source::new(items), txn))
	}

	#[test]
	fn scope_closes_on_exhaustion() {
		let (store, mut scope) = scoped(vec![Ok(1)]);
		assert_eq!(store.active_snapshots(), 1);
		assert_eq!(scope.next().unwrap(), Some(1));
		assert_eq!(store.active_snapshots(), 1);
		assert_eq!(scope.next().unwrap(), None);
		assert!(scope.is_closed());
		assert_eq!(store.active_snapshots(), 0);
		assert_eq!(scope.next(), Err(Error::Exhausted));
	}

	#[test]
	fn scope_closes_before_reporting_errors() {
		let (store, mut scope) = scoped(vec![Err(Error::Exhausted), Ok(1)]);
		assert!(scope.next().is_err());
		assert_eq!(store.active_snapshots(), 0);
		assert_eq!(scope.next(), Err(Error::Exhausted));
	}

	#[test]
	fn scope_releases_on_drop_and_close_is_idempotent() {
		let (store, scope) = scoped(vec![Ok(1), Ok(2)]);
		drop(scope);
		assert_eq!(store.active_snapshots(), 0);

		let (store, mut scope) = scoped(vec![Ok(1)]);
		scope.close().unwrap();
		scope.close().unwrap();
		assert_eq!(store.active_snapshots(), 0);
	}
}
