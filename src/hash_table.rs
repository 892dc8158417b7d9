//! Partitioned chained hash table over the build row tables.
//!
//! ```text
//!  JoinHashTable
//!  ┌─────────────┬─────────────┬─────┐
//!  │ sub-table 0 │ sub-table 1 │ ... │   partition = hash % partition_number
//!  └──────┬──────┴─────────────┴─────┘
//!         ▼
//!  heads (Vec<AtomicU64>)          row table segments
//!  ┌────────────────────┐          ┌──────────────────────────┐
//!  │ bucket 0: RowPtr   │─────────►│ row ── next_row ──► row  │
//!  │ bucket 1: NONE     │          │                          │
//!  │ ...                │          │                          │
//!  └────────────────────┘          └──────────────────────────┘
//!   bucket = hash >> shift (top bits, independent of the partition bits)
//! ```
//!
//! Several build workers may insert into the same sub-table at once, each
//! owning a disjoint segment range. Rows are pushed onto bucket chains with a
//! CAS on the bucket head; the row's own `next_row` slot is written only by the
//! worker that owns its segment.

use std::sync::atomic::Ordering;

// Shuttle atomics panic outside a shuttle run, hence the feature gate.
#[cfg(not(all(test, feature = "shuttle")))]
use std::sync::atomic::AtomicU64;
#[cfg(all(test, feature = "shuttle"))]
use shuttle::sync::atomic::AtomicU64;

use crate::row_table::{RowPtr, RowTable};

/// Routes a key hash to its partition. Build and probe both go through here.
#[inline(always)]
pub fn partition_of(hash: u64, partition_number: usize) -> usize {
    (hash % partition_number as u64) as usize
}

/// Compute directory size (power-of-two buckets) and shift for bucket selection.
/// Table is sized to ~1.125n. Minimum 16 buckets.
fn compute_table_params(num_rows: usize) -> (usize, u32) {
    let min_size = 16_usize;
    let target = (num_rows + (num_rows / 8)).max(min_size);
    let table_size = target.next_power_of_two();
    let shift = 64 - table_size.trailing_zeros();
    (table_size, shift)
}

pub struct SubTable {
    pub(crate) row_data: RowTable,
    heads: Vec<AtomicU64>,
    shift: u32,
}

impl SubTable {
    pub fn new(row_data: RowTable) -> Self {
        let (table_size, shift) = compute_table_params(row_data.valid_key_count());
        Self {
            row_data,
            heads: (0..table_size)
                .map(|_| AtomicU64::new(RowPtr::NONE.raw()))
                .collect(),
            shift,
        }
    }

    #[inline(always)]
    fn bucket(&self, hash: u64) -> usize {
        (hash >> self.shift) as usize
    }

    /// Indexes the rows of segments `seg_start..seg_end`.
    pub fn build(&self, seg_start: usize, seg_end: usize) {
        for seg_idx in seg_start..seg_end {
            let seg = &self.row_data.segments[seg_idx];
            for &row_idx in &seg.valid_join_key_pos {
                let ptr = RowPtr::new(seg_idx, row_idx);
                let head = &self.heads[self.bucket(seg.hash(row_idx))];
                let mut current = head.load(Ordering::Relaxed);
                loop {
                    seg.next_row[row_idx].store(current, Ordering::Relaxed);
                    // Release publishes the link above together with the new head.
                    match head.compare_exchange_weak(
                        current,
                        ptr.raw(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }

    /// First row of the chain `hash` falls into. The chain may hold rows with
    /// other hashes; callers compare hash and key.
    #[inline]
    pub fn lookup(&self, hash: u64) -> RowPtr {
        RowPtr::from_raw(self.heads[self.bucket(hash)].load(Ordering::Acquire))
    }

    #[inline]
    pub fn next(&self, ptr: RowPtr) -> RowPtr {
        RowPtr::from_raw(
            self.row_data.segment(ptr).next_row[ptr.row()].load(Ordering::Acquire),
        )
    }

    pub fn segment_count(&self) -> usize {
        self.row_data.segment_count()
    }

    pub fn mem_usage(&self) -> usize {
        self.row_data.mem_usage() + self.heads.capacity() * size_of::<AtomicU64>()
    }
}

pub struct JoinHashTable {
    pub(crate) tables: Vec<SubTable>,
}

impl JoinHashTable {
    pub fn new(row_tables: Vec<RowTable>) -> Self {
        Self {
            tables: row_tables.into_iter().map(SubTable::new).collect(),
        }
    }

    pub fn partition_number(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn sub_table(&self, partition: usize) -> &SubTable {
        &self.tables[partition]
    }

    /// Sub-table a key hash was routed to at build time.
    #[inline]
    pub fn sub_table_for(&self, hash: u64) -> &SubTable {
        &self.tables[partition_of(hash, self.tables.len())]
    }

    pub fn total_row_count(&self) -> usize {
        self.tables.iter().map(|t| t.row_data.row_count()).sum()
    }

    pub fn is_hash_table_empty(&self) -> bool {
        self.tables.iter().all(|t| t.row_data.row_count() == 0)
    }

    pub fn mem_usage(&self) -> usize {
        self.tables.iter().map(SubTable::mem_usage).sum()
    }

    /// Bytes held by the bucket heads alone.
    pub fn bucket_mem_usage(&self) -> usize {
        self.tables
            .iter()
            .map(|t| t.heads.capacity() * size_of::<AtomicU64>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::hash_key;
    use crate::row_table::RowTableSegment;

    // -- Helpers ------------------------------------------------------------

    /// Row bytes are the key itself; good enough to walk chains.
    fn table_from_keys(keys: &[u64], rows_per_segment: usize) -> RowTable {
        let mut table = RowTable::new();
        for chunk in keys.chunks(rows_per_segment.max(1)) {
            let mut seg = RowTableSegment::new(false);
            for &key in chunk {
                let start = seg.raw_data.len();
                seg.raw_data.extend_from_slice(&key.to_le_bytes());
                seg.push_row(start, hash_key(&key.to_le_bytes()), true);
            }
            seg.finalize();
            table.segments.push(seg);
        }
        table
    }

    fn matches(sub: &SubTable, key: u64) -> usize {
        let hash = hash_key(&key.to_le_bytes());
        let mut found = 0;
        let mut ptr = sub.lookup(hash);
        while !ptr.is_none() {
            let seg = sub.row_data.segment(ptr);
            if seg.hash(ptr.row()) == hash && seg.row(ptr.row()) == key.to_le_bytes() {
                found += 1;
            }
            ptr = sub.next(ptr);
        }
        found
    }

    // -- Sizing -------------------------------------------------------------

    #[test]
    fn sizing_basics() {
        let (size, shift) = compute_table_params(0);
        assert_eq!(size, 16);
        assert_eq!(shift, 60);

        for n in [100, 10_000, 1_000_000] {
            let (size, shift) = compute_table_params(n);
            assert!(size.is_power_of_two());
            assert!(size >= n);
            assert_eq!(1_usize << (64 - shift), size);
        }
    }

    #[test]
    fn partition_of_is_mod() {
        assert_eq!(partition_of(10, 4), 2);
        assert_eq!(partition_of(u64::MAX, 1), 0);
        for h in [0_u64, 7, 1 << 40, u64::MAX] {
            assert!(partition_of(h, 16) < 16);
        }
    }

    // -- Build and lookup ---------------------------------------------------

    #[test]
    fn lookup_finds_every_row() {
        let keys: Vec<u64> = (0..3000).collect();
        let sub = SubTable::new(table_from_keys(&keys, 1024));
        sub.build(0, sub.segment_count());
        for &k in &keys {
            assert_eq!(matches(&sub, k), 1, "key {k}");
        }
        assert_eq!(matches(&sub, 99_999), 0);
    }

    #[test]
    fn duplicates_share_a_chain() {
        let keys = [5, 5, 5, 9, 9, 11];
        let sub = SubTable::new(table_from_keys(&keys, 2));
        sub.build(0, sub.segment_count());
        assert_eq!(matches(&sub, 5), 3);
        assert_eq!(matches(&sub, 9), 2);
        assert_eq!(matches(&sub, 11), 1);
    }

    #[test]
    fn split_ranges_equal_full_build() {
        let keys: Vec<u64> = (0..500).map(|i| i % 97).collect();
        let sub = SubTable::new(table_from_keys(&keys, 16));
        let segs = sub.segment_count();
        std::thread::scope(|s| {
            for start in (0..segs).step_by(5) {
                let sub = &sub;
                s.spawn(move || sub.build(start, (start + 5).min(segs)));
            }
        });
        for k in 0..97 {
            let expected = keys.iter().filter(|&&x| x == k).count();
            assert_eq!(matches(&sub, k), expected, "key {k}");
        }
    }

    #[test]
    fn empty_table() {
        let table = JoinHashTable::new(vec![RowTable::new(), RowTable::new()]);
        assert!(table.is_hash_table_empty());
        assert_eq!(table.partition_number(), 2);
        assert!(table.sub_table_for(12345).lookup(12345).is_none());
    }

    /// Explores real interleavings of the bucket-head CAS only with
    /// `cargo test --features shuttle shuttle_`.
    #[test]
    fn shuttle_concurrent_build() {
        shuttle::check_random(
            || {
                let keys: Vec<u64> = (0..64).map(|i| i % 8).collect();
                let sub = Arc::new(SubTable::new(table_from_keys(&keys, 4)));
                let segs = sub.segment_count();

                let handles: Vec<_> = (0..4)
                    .map(|t| {
                        let sub = sub.clone();
                        shuttle::thread::spawn(move || {
                            let per = segs / 4;
                            sub.build(t * per, (t + 1) * per);
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }

                for k in 0..8 {
                    assert_eq!(matches(&sub, k), 8);
                }
            },
            100,
        );
    }
}
