//! Per-worker conversion of build chunks into partitioned row tables.

use crate::chunk::Chunk;
use crate::codec::{self, hash_key};
use crate::error::Result;
use crate::hash_table::partition_of;
use crate::meta::JoinTableMeta;
use crate::predicate::Predicate;
use crate::row_table::{RowTable, RowTableSegment};

/// Bytes accounted per row on top of its raw data: offset, hash, chain link.
const ROW_OVERHEAD: usize = 3 * size_of::<u64>();

pub(crate) struct RowTableBuilder {
    build_key_index: Vec<usize>,
    partition_number: usize,

    serialized_key_vector_buffer: Vec<Vec<u8>>,
    filter_vector: Vec<bool>,
    null_key_vector: Vec<bool>,
    current_segments: Vec<Option<RowTableSegment>>,
    /// Round-robin cursor for rows that are stored but never indexed.
    invalid_rows_seen: usize,
}

impl RowTableBuilder {
    pub(crate) fn new(build_key_index: Vec<usize>, partition_number: usize) -> Self {
        Self {
            build_key_index,
            partition_number,
            serialized_key_vector_buffer: Vec::new(),
            filter_vector: Vec::new(),
            null_key_vector: Vec::new(),
            current_segments: (0..partition_number).map(|_| None).collect(),
            invalid_rows_seen: 0,
        }
    }

    fn reset_buffer(&mut self, rows: usize) {
        self.serialized_key_vector_buffer.resize_with(rows, Vec::new);
        self.serialized_key_vector_buffer.truncate(rows);
        for buf in &mut self.serialized_key_vector_buffer {
            buf.clear();
        }
        self.null_key_vector.clear();
        self.null_key_vector.resize(rows, false);
        self.filter_vector.clear();
    }

    /// Appends every row of `chk` to its partition. Returns the number of
    /// bytes added, for memory accounting.
    pub(crate) fn process_chunk(
        &mut self,
        chk: &Chunk,
        meta: &JoinTableMeta,
        filter: Option<&dyn Predicate>,
        row_tables: &mut [Option<RowTable>],
    ) -> Result<usize> {
        let rows = chk.num_rows();
        self.reset_buffer(rows);
        if let Some(filter) = filter {
            filter.vectorized_filter(chk, &mut self.filter_vector)?;
        }
        let filter_vector = filter.map(|_| self.filter_vector.as_slice());

        for (i, &col_idx) in self.build_key_index.iter().enumerate() {
            codec::serialize_keys(
                chk,
                &meta.build_key_types[i],
                col_idx,
                filter_vector,
                &mut self.null_key_vector,
                meta.null_eq[i],
                meta.serialize_modes[i],
                &mut self.serialized_key_vector_buffer,
            )?;
        }

        let mut appended = 0;
        for (i, row) in chk.rows().iter().enumerate() {
            let passed_filter = filter_vector.is_none_or(|f| f[i]);
            let valid = passed_filter && !self.null_key_vector[i];

            let (hash, part) = if valid {
                let hash = hash_key(&self.serialized_key_vector_buffer[i]);
                (hash, partition_of(hash, self.partition_number))
            } else if meta.keep_invalid_key_rows {
                let part = self.invalid_rows_seen % self.partition_number;
                self.invalid_rows_seen += 1;
                (0, part)
            } else {
                continue;
            };

            let seg = self.current_segments[part]
                .get_or_insert_with(|| RowTableSegment::new(meta.need_used_flag));
            let start = seg.raw_data.len();
            let key: &[u8] = if valid {
                &self.serialized_key_vector_buffer[i]
            } else {
                &[]
            };
            meta.encode_row(row, key, &mut seg.raw_data)?;
            seg.push_row(start, hash, valid);
            appended += seg.raw_data.len() - start + ROW_OVERHEAD;

            if seg.is_full() {
                if let Some(mut full) = self.current_segments[part].take() {
                    full.finalize();
                    row_tables[part].get_or_insert_with(RowTable::new).segments.push(full);
                }
            }
        }
        Ok(appended)
    }

    /// Seals the partially filled segments once the input is drained.
    pub(crate) fn append_remaining_segments(&mut self, row_tables: &mut [Option<RowTable>]) {
        for (part, slot) in self.current_segments.iter_mut().enumerate() {
            if let Some(mut seg) = slot.take() {
                if seg.row_count() == 0 {
                    continue;
                }
                seg.finalize();
                row_tables[part].get_or_insert_with(RowTable::new).segments.push(seg);
            }
        }
    }
}
