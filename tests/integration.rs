//! # Integration Tests for rget Range Queries
//!
//! End-to-end tests that build trees through the bulk loader and query them through
//! [`rget::rget_slice`], checking ordering, bounds, expiration and resource release.

use rget::iter::KeyWithData;
use rget::{
	rget_slice, BlockId, BlockSize, BtreeSlice, Context, Error, ExpTime, Item, MemStore, RgetBoundMode, RgetResult, ScanConfig,
	StorageError, StoreKey, Superblock, Transaction,
};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use RgetBoundMode::{Closed, Open};

// ===========================================================================
// Fixtures
// ===========================================================================

struct Fixture {
	store: Arc<MemStore>,
	home: Context,
	slice: BtreeSlice<MemStore>,
}

impl Fixture {
	fn build(store: MemStore, leaf_capacity: usize, fanout: usize, items: Vec<(StoreKey, Item)>) -> Fixture {
		store.builder().leaf_capacity(leaf_capacity).fanout(fanout).load(items);
		let store = Arc::new(store);
		Fixture {
			slice: BtreeSlice::new(Arc::clone(&store)),
			home: Context::spawn("txn-home").unwrap(),
			store,
		}
	}

	fn numbered(n: usize) -> Fixture {
		let items = (0..n).map(|i| (key(i), Item::new(format!("value-{i}")).with_flags(i as u32))).collect();
		Fixture::build(MemStore::default(), 4, 4, items)
	}

	fn begin(&self) -> Transaction<MemStore> {
		Transaction::begin(Arc::clone(&self.store), &self.home).unwrap()
	}

	fn rget(&self, lm: RgetBoundMode, l: &str, rm: RgetBoundMode, r: &str, now: u32) -> RgetResult<MemStore> {
		let txn = self.begin();
		let sb = txn.superblock();
		rget_slice(&self.slice, lm, &l.into(), rm, &r.into(), ExpTime(now), txn, &sb)
	}

	fn keys(&self, lm: RgetBoundMode, l: &str, rm: RgetBoundMode, r: &str, now: u32) -> Vec<String> {
		collect(self.rget(lm, l, rm, r, now)).into_iter().map(|e| e.key.to_string()).collect()
	}
}

fn key(i: usize) -> StoreKey {
	StoreKey::from(format!("key{i:05}").as_str())
}

fn name(i: usize) -> String {
	format!("key{i:05}")
}

fn collect(result: RgetResult<MemStore>) -> Vec<KeyWithData> {
	result.collect::<Result<Vec<_>, Error>>().unwrap()
}

fn scenario() -> Fixture {
	let items = ["a", "b", "c", "d", "e"]
		.into_iter()
		.map(|k| {
			let item = Item::new(format!("{k}-payload"));
			let item = if k == "b" {
				item.expiring_at(ExpTime(100))
			} else {
				item
			};
			(StoreKey::from(k), item)
		})
		.collect();
	Fixture::build(MemStore::default(), 2, 2, items)
}

// ===========================================================================
// Query Semantics
// ===========================================================================

#[test]
fn closed_a_to_open_d_at_time_100() {
	let fx = scenario();
	let out = collect(fx.rget(Closed, "a", Open, "d", 100));
	let keys: Vec<_> = out.iter().map(|e| e.key.to_string()).collect();
	assert_eq!(keys, ["a", "c"]);
	assert_eq!(out[0].payload, "a-payload");
	assert_eq!(out[1].payload, "c-payload");
}

#[test]
fn expiration_is_relative_to_effective_time() {
	let fx = scenario();
	assert_eq!(fx.keys(RgetBoundMode::None, "", RgetBoundMode::None, "", 99), ["a", "b", "c", "d", "e"]);
	assert_eq!(fx.keys(RgetBoundMode::None, "", RgetBoundMode::None, "", 100), ["a", "c", "d", "e"]);
	assert_eq!(fx.keys(RgetBoundMode::None, "", RgetBoundMode::None, "", 5000), ["a", "c", "d", "e"]);
}

#[test]
fn bound_modes_on_both_sides() {
	let fx = Fixture::numbered(200);
	let range = |lo: usize, hi: usize| (lo..=hi).map(name).collect::<Vec<_>>();

	assert_eq!(fx.keys(Closed, &name(10), Closed, &name(20), 0), range(10, 20));
	assert_eq!(fx.keys(Open, &name(10), Closed, &name(20), 0), range(11, 20));
	assert_eq!(fx.keys(Closed, &name(10), Open, &name(20), 0), range(10, 19));
	assert_eq!(fx.keys(Open, &name(10), Open, &name(20), 0), range(11, 19));
	assert_eq!(fx.keys(RgetBoundMode::None, "ignored", Open, &name(3), 0), range(0, 2));
	assert_eq!(fx.keys(Open, &name(196), RgetBoundMode::None, "ignored", 0), range(197, 199));
	assert_eq!(fx.keys(RgetBoundMode::None, "", RgetBoundMode::None, "", 0), range(0, 199));
}

#[test]
fn bounds_between_stored_keys() {
	let fx = Fixture::numbered(50);
	// "key00010x" sorts between key00010 and key00011
	assert_eq!(fx.keys(Closed, "key00010x", Closed, "key00013x", 0), (11..=13).map(name).collect::<Vec<_>>());
	assert!(fx.keys(Closed, "key00010x", Closed, "key00010y", 0).is_empty());
	assert!(fx.keys(Closed, "zzz", RgetBoundMode::None, "", 0).is_empty());
	assert!(fx.keys(RgetBoundMode::None, "", Open, "key00000", 0).is_empty());
}

#[test]
fn flags_survive_materialization() {
	let fx = Fixture::numbered(30);
	for entry in collect(fx.rget(Closed, &name(5), Closed, &name(9), 0)) {
		let i: usize = entry.key.to_string()[3..].parse().unwrap();
		assert_eq!(entry.flags, i as u32);
		assert_eq!(entry.payload, format!("value-{i}").into_bytes());
	}
}

#[test]
fn large_values_are_read_from_blobs() {
	let big = |i: u8| vec![i; 3000];
	let items = (0..6u8).map(|i| (StoreKey::from(format!("blob{i}").as_str()), Item::new(big(i)))).collect();
	let fx = Fixture::build(MemStore::new(BlockSize::new(512)), 8, 4, items);

	let out = collect(fx.rget(Closed, "blob1", Closed, "blob4", 0));
	assert_eq!(out.len(), 4);
	for (entry, i) in out.iter().zip(1u8..) {
		assert_eq!(entry.payload.as_ref(), big(i).as_slice());
	}
}

// ===========================================================================
// Empty Results
// ===========================================================================

#[test]
fn empty_tree_yields_nothing() {
	let fx = Fixture::build(MemStore::default(), 4, 4, Vec::new());
	assert_eq!(fx.store.superblock(), Superblock::default());

	let mut result = fx.rget(RgetBoundMode::None, "", RgetBoundMode::None, "", 0);
	assert!(result.next().is_none());
	assert!(result.next().is_none());
	assert!(result.is_closed());
	assert_eq!(fx.store.active_snapshots(), 0);
}

#[test]
fn inverted_range_is_empty_not_an_error() {
	let fx = Fixture::numbered(40);
	let mut result = fx.rget(Closed, &name(30), Closed, &name(10), 0);
	assert!(result.next().is_none());
	assert_eq!(fx.store.locks().acquired(), 0);
	assert_eq!(fx.store.active_snapshots(), 0);

	assert!(fx.keys(Open, &name(7), Closed, &name(7), 0).is_empty());
	assert_eq!(fx.keys(Closed, &name(7), Closed, &name(7), 0), [name(7)]);
}

// ===========================================================================
// Snapshots
// ===========================================================================

#[test]
fn same_snapshot_same_output() {
	let fx = Fixture::numbered(120);
	let first = collect(fx.rget(Open, &name(3), Closed, &name(97), 0));
	let second = collect(fx.rget(Open, &name(3), Closed, &name(97), 0));
	assert_eq!(first.len(), 94);
	assert_eq!(first, second);
}

#[test]
fn pinned_version_ignores_later_loads() {
	let fx = Fixture::numbered(20);
	let txn = fx.begin();
	let old = txn.superblock();

	fx.store.builder().load(vec![(StoreKey::from("other"), Item::new("x"))]);
	assert_ne!(fx.store.superblock(), old);

	let out = collect(rget_slice(&fx.slice, RgetBoundMode::None, &"".into(), RgetBoundMode::None, &"".into(), ExpTime(0), txn, &old));
	assert_eq!(out.len(), 20);
	assert_eq!(fx.keys(RgetBoundMode::None, "", RgetBoundMode::None, "", 0), ["other"]);
}

// ===========================================================================
// Resource Release
// ===========================================================================

fn counted(fx: &Fixture) -> (Transaction<MemStore>, Arc<AtomicUsize>, Arc<parking_lot::Mutex<Vec<Option<rget::ContextId>>>>) {
	let mut txn = fx.begin();
	let releases = Arc::new(AtomicUsize::new(0));
	let contexts = Arc::new(parking_lot::Mutex::new(Vec::new()));
	let (r, c) = (Arc::clone(&releases), Arc::clone(&contexts));
	txn.on_release(move || {
		r.fetch_add(1, Ordering::SeqCst);
		c.lock().push(Context::current());
	});
	(txn, releases, contexts)
}

#[test]
fn abandoning_after_any_number_of_pulls_releases_once_on_home() {
	let fx = Fixture::numbered(40);
	for pulls in 0..=41 {
		let (txn, releases, contexts) = counted(&fx);
		let sb = txn.superblock();
		let mut result = rget_slice(&fx.slice, RgetBoundMode::None, &"".into(), RgetBoundMode::None, &"".into(), ExpTime(0), txn, &sb);
		for _ in 0..pulls {
			let _ = result.next();
		}
		drop(result);

		assert_eq!(releases.load(Ordering::SeqCst), 1, "after {pulls} pulls");
		assert_eq!(*contexts.lock(), [Some(fx.home.id())]);
		assert_eq!(fx.store.locks().held(), 0);
		assert_eq!(fx.store.active_snapshots(), 0);
	}
}

#[test]
fn explicit_close_releases() {
	let fx = Fixture::numbered(40);
	let mut result = fx.rget(RgetBoundMode::None, "", RgetBoundMode::None, "", 0);
	assert!(result.next().is_some());
	assert_eq!(fx.store.active_snapshots(), 1);
	result.close().unwrap();
	assert_eq!(fx.store.active_snapshots(), 0);
	assert_eq!(fx.store.locks().held(), 0);
}

#[test]
fn storage_failure_ends_the_query_after_teardown() {
	let fx = Fixture::numbered(64);
	// leaves are written first: block 3 holds key00012..key00015
	fx.store.fail_block(BlockId(3));

	let (txn, releases, _) = counted(&fx);
	let sb = txn.superblock();
	let mut result = rget_slice(&fx.slice, RgetBoundMode::None, &"".into(), RgetBoundMode::None, &"".into(), ExpTime(0), txn, &sb);

	let mut seen = Vec::new();
	let err = loop {
		match result.next() {
			Some(Ok(entry)) => seen.push(entry.key.to_string()),
			Some(Err(e)) => break e,
			None => panic!("query finished without reporting the failure"),
		}
	};

	assert_eq!(err, Error::Storage(StorageError::Unavailable(BlockId(3))));
	assert_eq!(seen, (0..12).map(name).collect::<Vec<_>>());
	// teardown ran before the error was handed out
	assert_eq!(releases.load(Ordering::SeqCst), 1);
	assert_eq!(fx.store.locks().held(), 0);
	assert!(result.next().is_none());
	assert!(result.is_closed());
}

// ===========================================================================
// Lock Bound
// ===========================================================================

#[test]
fn depth_first_holds_at_most_height_plus_one_locks() {
	let fx = Fixture::numbered(2000);
	let height = fx.store.superblock().height;
	assert!(height >= 5);
	fx.store.locks().reset_peak();

	let mut result = fx.rget(RgetBoundMode::None, "", RgetBoundMode::None, "", 0);
	let mut count = 0;
	while let Some(entry) = result.next() {
		entry.unwrap();
		count += 1;
		assert!(fx.store.locks().held() <= height + 1);
	}
	assert_eq!(count, 2000);
	assert!(fx.store.locks().peak() <= height + 1, "peak {} height {}", fx.store.locks().peak(), height);
}

#[test]
fn hybrid_policy_returns_the_same_entries() {
	let fx = Fixture::numbered(500);
	let expected = fx.keys(Closed, &name(17), Open, &name(480), 0);

	for limit in [1, 4, 16, 64, 10_000] {
		let slice = fx.slice.clone().with_config(ScanConfig::hybrid(NonZeroUsize::new(limit).unwrap()));
		let txn = fx.begin();
		let sb = txn.superblock();
		let out = collect(rget_slice(&slice, Closed, &key(17), Open, &key(480), ExpTime(0), txn, &sb));
		let keys: Vec<_> = out.into_iter().map(|e| e.key.to_string()).collect();
		assert_eq!(keys, expected, "frontier limit {limit}");
		assert_eq!(fx.store.locks().held(), 0);
	}
}

#[test]
fn prefetch_hints_reach_the_store() {
	let fx = Fixture::numbered(100);
	let mut result = fx.rget(RgetBoundMode::None, "", RgetBoundMode::None, "", 0);
	result.prefetch();
	assert_eq!(fx.store.prefetched(), 1);
	while let Some(entry) = result.next() {
		entry.unwrap();
		result.prefetch();
	}
	assert!(fx.store.prefetched() > 1);
	assert!(result.stats().is_none());
}
