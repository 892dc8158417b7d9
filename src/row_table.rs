//! Segmented, append-only storage for build rows.
//!
//! ```text
//!  RowTable (one per partition)
//!  ┌───────────┬───────────┬───────────┐
//!  │ segment 0 │ segment 1 │ segment 2 │  ≤ MAX_SEGMENT_ROWS rows each
//!  └─────┬─────┴───────────┴───────────┘
//!        ▼
//!  raw_data:          [row 0 bytes][row 1 bytes]...
//!  row_start_offsets: [0, 37, ...]
//!  hash_values:       [h0, h1, ...]
//!  next_row:          [RowPtr, ...]   chain links, written by the hash-table build
//!  used_flags:        [bool, ...]     only when the join needs them
//! ```
//!
//! A segment is filled by a single builder and sealed with [`RowTableSegment::finalize`];
//! after that only the atomic `next_row` and `used_flags` slots change.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const MAX_SEGMENT_ROWS: usize = 1024;

/// Location of a row inside one partition: segment index in the high 32 bits,
/// row index in the low 32 bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct RowPtr(u64);

impl RowPtr {
    pub const NONE: Self = Self(u64::MAX);
    const SEGMENT_SHIFT: u32 = 32;

    #[inline(always)]
    pub fn new(segment: usize, row: usize) -> Self {
        Self(((segment as u64) << Self::SEGMENT_SHIFT) | row as u64)
    }

    #[inline(always)]
    pub fn segment(self) -> usize {
        (self.0 >> Self::SEGMENT_SHIFT) as usize
    }

    #[inline(always)]
    pub fn row(self) -> usize {
        self.0 as u32 as usize
    }

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline(always)]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Default)]
pub struct RowTableSegment {
    pub(crate) raw_data: Vec<u8>,
    pub(crate) row_start_offsets: Vec<usize>,
    pub(crate) hash_values: Vec<u64>,
    /// Rows that go into the hash index; the rest are only visible to the scan.
    pub(crate) valid_join_key_pos: Vec<usize>,
    pub(crate) next_row: Vec<AtomicU64>,
    pub(crate) used_flags: Vec<AtomicBool>,
    need_used_flag: bool,
}

impl RowTableSegment {
    pub fn new(need_used_flag: bool) -> Self {
        Self {
            raw_data: Vec::new(),
            row_start_offsets: Vec::with_capacity(MAX_SEGMENT_ROWS),
            hash_values: Vec::with_capacity(MAX_SEGMENT_ROWS),
            valid_join_key_pos: Vec::with_capacity(MAX_SEGMENT_ROWS),
            next_row: Vec::new(),
            used_flags: Vec::new(),
            need_used_flag,
        }
    }

    pub fn row_count(&self) -> usize {
        self.row_start_offsets.len()
    }

    pub fn is_full(&self) -> bool {
        self.row_count() >= MAX_SEGMENT_ROWS
    }

    /// Registers the row whose bytes were just appended at `start`.
    pub(crate) fn push_row(&mut self, start: usize, hash: u64, valid_key: bool) {
        if valid_key {
            self.valid_join_key_pos.push(self.row_count());
        }
        self.row_start_offsets.push(start);
        self.hash_values.push(hash);
    }

    /// Seals the segment: allocates the chain links and used flags.
    pub(crate) fn finalize(&mut self) {
        let rows = self.row_count();
        self.next_row = (0..rows).map(|_| AtomicU64::new(RowPtr::NONE.raw())).collect();
        if self.need_used_flag {
            self.used_flags = (0..rows).map(|_| AtomicBool::new(false)).collect();
        }
    }

    #[inline]
    pub fn row(&self, idx: usize) -> &[u8] {
        let start = self.row_start_offsets[idx];
        let end = self
            .row_start_offsets
            .get(idx + 1)
            .copied()
            .unwrap_or(self.raw_data.len());
        &self.raw_data[start..end]
    }

    #[inline]
    pub fn hash(&self, idx: usize) -> u64 {
        self.hash_values[idx]
    }

    #[inline]
    pub fn is_used(&self, idx: usize) -> bool {
        self.used_flags
            .get(idx)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    #[inline]
    pub fn mark_used(&self, idx: usize) {
        if let Some(flag) = self.used_flags.get(idx) {
            // Most probes hit already-marked rows; avoid the write.
            if !flag.load(Ordering::Relaxed) {
                flag.store(true, Ordering::Release);
            }
        }
    }

    /// Approximate heap bytes owned by the segment.
    pub fn mem_usage(&self) -> usize {
        self.raw_data.capacity()
            + (self.row_start_offsets.capacity() + self.valid_join_key_pos.capacity())
                * size_of::<usize>()
            + self.hash_values.capacity() * size_of::<u64>()
            + self.next_row.capacity() * size_of::<AtomicU64>()
            + self.used_flags.capacity()
    }
}

/// All rows of one partition.
#[derive(Debug, Default)]
pub struct RowTable {
    pub(crate) segments: Vec<RowTableSegment>,
}

impl RowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every segment of `other` to the end of this table.
    pub fn merge(&mut self, other: RowTable) {
        self.segments.extend(other.segments);
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn row_count(&self) -> usize {
        self.segments.iter().map(RowTableSegment::row_count).sum()
    }

    pub fn valid_key_count(&self) -> usize {
        self.segments.iter().map(|s| s.valid_join_key_pos.len()).sum()
    }

    #[inline]
    pub fn segment(&self, ptr: RowPtr) -> &RowTableSegment {
        &self.segments[ptr.segment()]
    }

    #[inline]
    pub fn row(&self, ptr: RowPtr) -> &[u8] {
        self.segments[ptr.segment()].row(ptr.row())
    }

    pub fn mem_usage(&self) -> usize {
        self.segments.iter().map(RowTableSegment::mem_usage).sum()
    }
}
