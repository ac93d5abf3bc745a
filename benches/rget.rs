// Copyright © SurrealDB Ltd
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Criterion benchmarks for range queries.
//!
//! This benchmark suite compares:
//! - depth-first traversal against the hybrid policy at a few frontier limits
//! - short ranges near the start of the tree against full scans
//! - inline payloads against payloads stored as blobs

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rget::{rget_slice, BlockSize, BtreeSlice, Context, ExpTime, Item, MemStore, RgetBoundMode, ScanConfig, StoreKey, Transaction};
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::Arc;

const SEED: u64 = 42;
const ENTRIES: usize = 100_000;

// ============================================================================
// Helper Functions
// ============================================================================

fn key(i: usize) -> StoreKey {
	StoreKey::from(format!("key{i:08}").as_str())
}

/// Loads `entries` entries with payloads of `payload` bytes; about a tenth expire at 1000.
fn build(entries: usize, block_size: u32, payload: usize) -> Arc<MemStore> {
	let mut rng = StdRng::seed_from_u64(SEED);
	let store = MemStore::new(BlockSize::new(block_size));
	store.builder().load((0..entries).map(|i| {
		let exptime = if rng.random_ratio(1, 10) {
			ExpTime(1000)
		} else {
			ExpTime::NEVER
		};
		(key(i), Item::new(vec![(i % 251) as u8; payload]).expiring_at(exptime))
	}));
	Arc::new(store)
}

fn scan(slice: &BtreeSlice<MemStore>, home: &Context, lo: usize, hi: usize) -> usize {
	let txn = Transaction::begin(Arc::clone(slice.store()), home).unwrap();
	let sb = txn.superblock();
	rget_slice(slice, RgetBoundMode::Closed, &key(lo), RgetBoundMode::Open, &key(hi), ExpTime(2000), txn, &sb)
		.map(|entry| black_box(entry.unwrap()))
		.count()
}

fn policies() -> Vec<(&'static str, ScanConfig)> {
	let hybrid = |n: usize| ScanConfig::hybrid(NonZeroUsize::new(n).unwrap());
	vec![("depth_first", ScanConfig::depth_first()), ("hybrid_8", hybrid(8)), ("hybrid_64", hybrid(64))]
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_range_width(c: &mut Criterion) {
	let store = build(ENTRIES, 4096, 16);
	let home = Context::spawn("bench-home").unwrap();
	let mut group = c.benchmark_group("range_width");

	for width in [10usize, 1_000, ENTRIES] {
		group.throughput(Throughput::Elements(width as u64));
		for (name, config) in policies() {
			let slice = BtreeSlice::new(Arc::clone(&store)).with_config(config);
			group.bench_with_input(BenchmarkId::new(name, width), &width, |b, &width| {
				b.iter(|| scan(&slice, &home, 0, width));
			});
		}
	}

	group.finish();
}

fn bench_random_short_ranges(c: &mut Criterion) {
	let store = build(ENTRIES, 4096, 16);
	let home = Context::spawn("bench-home").unwrap();
	let mut group = c.benchmark_group("random_short_ranges");

	for (name, config) in policies() {
		let slice = BtreeSlice::new(Arc::clone(&store)).with_config(config);
		let mut rng = StdRng::seed_from_u64(SEED);
		group.bench_function(name, |b| {
			b.iter(|| {
				let lo = rng.random_range(0..ENTRIES - 100);
				scan(&slice, &home, lo, lo + 100)
			});
		});
	}

	group.finish();
}

fn bench_payload_size(c: &mut Criterion) {
	let home = Context::spawn("bench-home").unwrap();
	let mut group = c.benchmark_group("payload_size");

	// 1024 byte blocks keep payloads above 256 bytes out of line
	for payload in [16usize, 200, 2_000] {
		let slice = BtreeSlice::new(build(20_000, 1024, payload));
		group.throughput(Throughput::Bytes((payload * 1_000) as u64));
		group.bench_with_input(BenchmarkId::from_parameter(payload), &payload, |b, _| {
			b.iter(|| scan(&slice, &home, 5_000, 6_000));
		});
	}

	group.finish();
}

criterion_group!(benches, bench_range_width, bench_random_short_ranges, bench_payload_size);
criterion_main!(benches);
