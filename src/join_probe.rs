//! Per-worker probe state machines.
//!
//! A probe worker hands a chunk to [`JoinProbe::set_chunk_for_probe`] and then
//! calls [`JoinProbe::probe`] until [`JoinProbe::is_current_chunk_probe_done`],
//! flushing the output chunk whenever it fills. Joins that must revisit build
//! rows afterwards run the `*_scan_row_table` half once every worker is done
//! probing.

use std::sync::Arc;

use crate::chunk::{Chunk, Datum, Row};
use crate::codec::{self, hash_key};
use crate::config::JoinType;
use crate::context::{self, HashJoinCtx};
use crate::error::{JoinError, Result};
use crate::hash_table::JoinHashTable;
use crate::row_table::{RowPtr, RowTableSegment};

pub trait JoinProbe: Send {
    fn set_chunk_for_probe(&mut self, chk: Chunk) -> Result<()>;

    fn is_current_chunk_probe_done(&self) -> bool;

    /// Appends join results to `out` until it is full or the chunk is done.
    fn probe(&mut self, out: &mut Chunk) -> Result<()>;

    /// Gives the probed chunk back so it can be refilled.
    fn take_probed_chunk(&mut self) -> Option<Chunk>;

    fn need_scan_row_table(&self) -> bool;

    fn init_for_scan_row_table(&mut self);

    fn is_scan_row_table_done(&self) -> bool;

    fn scan_row_table(&mut self, out: &mut Chunk) -> Result<()>;
}

/// Picks the probe implementation for this join.
pub(crate) fn new_join_probe(ctx: Arc<HashJoinCtx>, worker_id: usize) -> Box<dyn JoinProbe> {
    Box::new(HashJoinProbe::new(ctx, worker_id))
}

/// What a key match does.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MatchAction {
    /// Emit the joined pair (inner and outer joins).
    EmitPair,
    /// Emit the probe row once, on its first match.
    EmitProbeOnce,
    /// Drop the probe row on its first match.
    RejectProbe,
    /// Only mark the build row; the scan emits it later.
    MarkBuild,
}

#[derive(Default)]
struct ScanCursor {
    partitions: Vec<usize>,
    part: usize,
    seg: usize,
    row: usize,
}

pub struct HashJoinProbe {
    ctx: Arc<HashJoinCtx>,
    worker_id: usize,
    hash_table: Option<Arc<JoinHashTable>>,
    action: MatchAction,
    preserves_probe: bool,
    need_used_flag: bool,

    chunk: Option<Chunk>,
    serialized_keys: Vec<Vec<u8>>,
    hashes: Vec<u64>,
    filter_vector: Vec<bool>,
    null_key_vector: Vec<bool>,

    cur_row: usize,
    cur_ptr: RowPtr,
    cur_started: bool,
    cur_matched: bool,

    build_row: Vec<Datum>,
    collisions: i64,
    scan: ScanCursor,
}

impl HashJoinProbe {
    pub(crate) fn new(ctx: Arc<HashJoinCtx>, worker_id: usize) -> Self {
        let (jt, rab) = (ctx.join_type, ctx.right_as_build);
        let action = match (jt, rab) {
            (JoinType::Semi, true) => MatchAction::EmitProbeOnce,
            (JoinType::AntiSemi, true) => MatchAction::RejectProbe,
            (JoinType::Semi | JoinType::AntiSemi, false) => MatchAction::MarkBuild,
            _ => MatchAction::EmitPair,
        };
        Self {
            worker_id,
            hash_table: None,
            action,
            preserves_probe: context::preserves_probe(jt, rab),
            need_used_flag: context::need_scan_row_table(jt, rab),
            chunk: None,
            serialized_keys: Vec::new(),
            hashes: Vec::new(),
            filter_vector: Vec::new(),
            null_key_vector: Vec::new(),
            cur_row: 0,
            cur_ptr: RowPtr::NONE,
            cur_started: false,
            cur_matched: false,
            build_row: Vec::new(),
            collisions: 0,
            scan: ScanCursor::default(),
            ctx,
        }
    }

    fn probe_row_valid(&self, i: usize) -> bool {
        let passed = self.ctx.probe_filter.is_none() || self.filter_vector[i];
        passed && !self.null_key_vector[i]
    }

    fn advance_row(&mut self) {
        self.cur_row += 1;
        self.cur_started = false;
        self.cur_matched = false;
        self.cur_ptr = RowPtr::NONE;
    }

    /// Lays out `probe` and `build` as `left ++ right`.
    fn joined_row(&self, probe: &[Datum], build: Option<&[Datum]>) -> Row {
        let build_width = self.ctx.build_width();
        let mut row = Vec::with_capacity(self.ctx.probe_used.len() + build_width);
        let push_build = |row: &mut Row| match build {
            Some(cols) => row.extend_from_slice(cols),
            None => row.resize(row.len() + build_width, Datum::Null),
        };
        if self.ctx.right_as_build {
            row.extend(self.ctx.probe_used.iter().map(|&c| probe[c].clone()));
            push_build(&mut row);
        } else {
            push_build(&mut row);
            row.extend(self.ctx.probe_used.iter().map(|&c| probe[c].clone()));
        }
        row
    }

    fn projected_probe(&self, probe: &[Datum]) -> Row {
        self.ctx.probe_used.iter().map(|&c| probe[c].clone()).collect()
    }

    /// Probe row without a partner.
    fn emit_unmatched_probe(&self, probe: &[Datum], out: &mut Chunk) {
        if !self.preserves_probe {
            return;
        }
        if self.ctx.outputs_right_side() {
            out.push_row(self.joined_row(probe, None));
        } else {
            out.push_row(self.projected_probe(probe));
        }
    }

    fn other_condition_passes(&self, probe: &[Datum]) -> Result<bool> {
        match &self.ctx.other_condition {
            Some(cond) => cond.eval(&self.joined_row(probe, Some(&self.build_row))),
            None => Ok(true),
        }
    }

    fn build_row_out(&self, seg: &RowTableSegment, row: usize, out: &mut Chunk) {
        let mut decoded = Vec::with_capacity(self.ctx.build_width());
        self.ctx.meta.decode_columns(seg.row(row), &mut decoded);
        if !self.ctx.outputs_right_side() {
            out.push_row(decoded);
            return;
        }
        let nulls = self.ctx.probe_used.len();
        let mut full = Vec::with_capacity(decoded.len() + nulls);
        if self.ctx.right_as_build {
            full.resize(nulls, Datum::Null);
            full.extend(decoded);
        } else {
            full.extend(decoded);
            full.resize(full.len() + nulls, Datum::Null);
        }
        out.push_row(full);
    }
}

impl JoinProbe for HashJoinProbe {
    fn set_chunk_for_probe(&mut self, chk: Chunk) -> Result<()> {
        if self.hash_table.is_none() {
            self.hash_table = Some(
                self.ctx
                    .hash_table()
                    .cloned()
                    .ok_or_else(|| JoinError::Internal("probe started before build finished".into()))?,
            );
        }
        let ctx = Arc::clone(&self.ctx);
        let rows = chk.num_rows();
        self.serialized_keys.resize_with(rows, Vec::new);
        self.serialized_keys.truncate(rows);
        for buf in &mut self.serialized_keys {
            buf.clear();
        }
        self.null_key_vector.clear();
        self.null_key_vector.resize(rows, false);
        self.filter_vector.clear();
        if let Some(filter) = &ctx.probe_filter {
            filter.vectorized_filter(&chk, &mut self.filter_vector)?;
        }
        let filter_vector = ctx.probe_filter.as_ref().map(|_| self.filter_vector.as_slice());

        let meta = &ctx.meta;
        for (i, &col_idx) in ctx.probe_keys.iter().enumerate() {
            codec::serialize_keys(
                &chk,
                &meta.probe_key_types[i],
                col_idx,
                filter_vector,
                &mut self.null_key_vector,
                meta.null_eq[i],
                meta.serialize_modes[i],
                &mut self.serialized_keys,
            )?;
        }
        self.hashes.clear();
        self.hashes
            .extend(self.serialized_keys.iter().map(|k| hash_key(k)));

        self.chunk = Some(chk);
        self.cur_row = 0;
        self.cur_started = false;
        self.cur_matched = false;
        self.cur_ptr = RowPtr::NONE;
        Ok(())
    }

    fn is_current_chunk_probe_done(&self) -> bool {
        self.chunk
            .as_ref()
            .is_none_or(|chk| self.cur_row >= chk.num_rows())
    }

    fn probe(&mut self, out: &mut Chunk) -> Result<()> {
        let (Some(chk), Some(table)) = (self.chunk.take(), self.hash_table.clone()) else {
            return Ok(());
        };
        let result = self.probe_chunk(&chk, &table, out);
        self.chunk = Some(chk);
        if let Some(stats) = &self.ctx.stats {
            stats.add_probe_collision(std::mem::take(&mut self.collisions));
        }
        result
    }

    fn take_probed_chunk(&mut self) -> Option<Chunk> {
        self.chunk.take()
    }

    fn need_scan_row_table(&self) -> bool {
        self.need_used_flag
    }

    fn init_for_scan_row_table(&mut self) {
        if self.hash_table.is_none() {
            self.hash_table = self.ctx.hash_table().cloned();
        }
        let partitions = match &self.hash_table {
            Some(table) => (self.worker_id..table.partition_number())
                .step_by(self.ctx.concurrency)
                .collect(),
            None => Vec::new(),
        };
        self.scan = ScanCursor {
            partitions,
            ..ScanCursor::default()
        };
    }

    fn is_scan_row_table_done(&self) -> bool {
        self.scan.part >= self.scan.partitions.len()
    }

    fn scan_row_table(&mut self, out: &mut Chunk) -> Result<()> {
        let Some(table) = self.hash_table.clone() else {
            return Ok(());
        };
        let want_used = self.ctx.join_type == JoinType::Semi;
        while !self.is_scan_row_table_done() && !out.is_full() {
            let sub = table.sub_table(self.scan.partitions[self.scan.part]);
            let Some(seg) = sub.row_data.segments.get(self.scan.seg) else {
                self.scan.part += 1;
                self.scan.seg = 0;
                self.scan.row = 0;
                continue;
            };
            if self.scan.row >= seg.row_count() {
                self.scan.seg += 1;
                self.scan.row = 0;
                continue;
            }
            let row = self.scan.row;
            self.scan.row += 1;
            if seg.is_used(row) == want_used {
                self.build_row_out(seg, row, out);
            }
        }
        Ok(())
    }
}

impl HashJoinProbe {
    fn probe_chunk(&mut self, chk: &Chunk, table: &JoinHashTable, out: &mut Chunk) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let meta = &ctx.meta;
        while self.cur_row < chk.num_rows() && !out.is_full() {
            let i = self.cur_row;
            let probe_row = chk.row(i);
            if !self.probe_row_valid(i) {
                self.emit_unmatched_probe(probe_row, out);
                self.advance_row();
                continue;
            }

            let hash = self.hashes[i];
            let sub = table.sub_table_for(hash);
            if !self.cur_started {
                self.cur_ptr = sub.lookup(hash);
                self.cur_started = true;
            }

            while !self.cur_ptr.is_none() && !out.is_full() {
                let ptr = self.cur_ptr;
                self.cur_ptr = sub.next(ptr);
                let seg = sub.row_data.segment(ptr);
                let raw = seg.row(ptr.row());
                if seg.hash(ptr.row()) != hash || meta.key_of(raw) != self.serialized_keys[i] {
                    self.collisions += 1;
                    continue;
                }
                if self.action == MatchAction::MarkBuild && seg.is_used(ptr.row()) {
                    // Already matched; nothing left to learn from this row.
                    continue;
                }
                self.build_row.clear();
                meta.decode_columns(raw, &mut self.build_row);
                if !self.other_condition_passes(probe_row)? {
                    continue;
                }
                self.cur_matched = true;
                match self.action {
                    MatchAction::EmitPair => {
                        out.push_row(self.joined_row(probe_row, Some(&self.build_row)));
                        if self.need_used_flag {
                            seg.mark_used(ptr.row());
                        }
                    }
                    MatchAction::EmitProbeOnce => {
                        out.push_row(self.projected_probe(probe_row));
                        self.cur_ptr = RowPtr::NONE;
                    }
                    MatchAction::RejectProbe => self.cur_ptr = RowPtr::NONE,
                    MatchAction::MarkBuild => seg.mark_used(ptr.row()),
                }
            }

            if self.cur_ptr.is_none() {
                if !self.cur_matched {
                    self.emit_unmatched_probe(probe_row, out);
                }
                self.advance_row();
            }
        }
        Ok(())
    }
}
