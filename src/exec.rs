//! The join operator: owns both children and drives the build and probe
//! threads behind an open/next/close interface.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::build;
use crate::chunk::{Chunk, FieldType};
use crate::config::{JoinConfig, JoinType};
use crate::context::{self, HashJoinCtx};
use crate::error::{JoinError, Result, recover_panic};
use crate::join_probe::new_join_probe;
use crate::meta::JoinTableMeta;
use crate::probe::{self, JoinResult, ProbeChkResource, ProbeSideTupleFetcher, ProbeWorker};
use crate::source::{RowSource, SharedSource};
use crate::stats::HashJoinRuntimeStats;
use crate::tracker::{DiskTracker, MemTracker};

/// A partitioned, multi-threaded hash join over two [`RowSource`]s.
///
/// The executor is itself a [`RowSource`]: `open` prepares a run, the first
/// `next` starts the build and probe threads, and `close` tears them down.
/// Output rows are laid out as the projected left columns followed by the
/// projected right columns (left columns only for semi and anti joins), in
/// no particular order.
pub struct PartitionedHashJoinExec {
    cfg: JoinConfig,
    left: SharedSource,
    right: SharedSource,
    output_types: Vec<FieldType>,

    mem_tracker: Arc<MemTracker>,
    disk_tracker: Arc<DiskTracker>,
    stmt_mem_tracker: Option<Arc<MemTracker>>,
    stmt_disk_tracker: Option<Arc<DiskTracker>>,

    /// Children that opened and still need a `close`.
    left_opened: bool,
    right_opened: bool,
    ctx: Option<Arc<HashJoinCtx>>,
    close_tx: Option<Sender<()>>,
    prepared: bool,
    result_rx: Option<Receiver<JoinResult>>,
    threads: Vec<JoinHandle<()>>,
    /// Stats of every closed run, merged.
    stats: Option<Arc<HashJoinRuntimeStats>>,
}

impl PartitionedHashJoinExec {
    pub fn new(cfg: JoinConfig, left: Box<dyn RowSource>, right: Box<dyn RowSource>) -> Result<Self> {
        cfg.validate(left.field_types(), right.field_types())?;
        let output_types = output_types(&cfg, left.field_types(), right.field_types());
        Ok(Self {
            cfg,
            left: Arc::new(Mutex::new(left)),
            right: Arc::new(Mutex::new(right)),
            output_types,
            mem_tracker: MemTracker::new("hash join"),
            disk_tracker: DiskTracker::new("hash join"),
            stmt_mem_tracker: None,
            stmt_disk_tracker: None,
            left_opened: false,
            right_opened: false,
            ctx: None,
            close_tx: None,
            prepared: false,
            result_rx: None,
            threads: Vec::new(),
            stats: None,
        })
    }

    /// Charges this join's usage to statement-level trackers from the next
    /// `open` on.
    pub fn with_statement_trackers(mut self, mem: Arc<MemTracker>, disk: Arc<DiskTracker>) -> Self {
        self.stmt_mem_tracker = Some(mem);
        self.stmt_disk_tracker = Some(disk);
        self
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Stats of the running execution, or the merged stats of the closed
    /// ones. `None` unless the config asked for stats.
    pub fn runtime_stats(&self) -> Option<Arc<HashJoinRuntimeStats>> {
        match &self.ctx {
            Some(ctx) => ctx.stats.clone(),
            None => self.stats.clone(),
        }
    }

    fn build_and_probe_sources(&self) -> (&SharedSource, &SharedSource) {
        if self.cfg.right_as_build {
            (&self.right, &self.left)
        } else {
            (&self.left, &self.right)
        }
    }

    fn new_ctx(&self, close_rx: Receiver<()>) -> HashJoinCtx {
        let cfg = &self.cfg;
        let left_types = self.left.lock().field_types().to_vec();
        let right_types = self.right.lock().field_types().to_vec();
        let (build_types, probe_types, build_keys, probe_keys, build_used, probe_used) =
            if cfg.right_as_build {
                (&right_types, &left_types, &cfg.right_keys, &cfg.left_keys, &cfg.right_used, &cfg.left_used)
            } else {
                (&left_types, &right_types, &cfg.left_keys, &cfg.right_keys, &cfg.left_used, &cfg.right_used)
            };
        let build_used = build_used
            .clone()
            .unwrap_or_else(|| (0..build_types.len()).collect());
        let probe_used = probe_used
            .clone()
            .unwrap_or_else(|| (0..probe_types.len()).collect());
        let null_eq = if cfg.null_eq.is_empty() {
            vec![false; build_keys.len()]
        } else {
            cfg.null_eq.clone()
        };

        let meta = JoinTableMeta::new(
            build_types,
            build_keys.iter().map(|&c| build_types[c]).collect(),
            probe_keys.iter().map(|&c| probe_types[c]).collect(),
            build_used,
            null_eq,
            context::need_scan_row_table(cfg.join_type, cfg.right_as_build),
            context::preserves_build(cfg.join_type, cfg.right_as_build),
        );
        HashJoinCtx::new(cfg, probe_used, meta, close_rx, Arc::clone(&self.mem_tracker))
    }

    fn start_build_and_probe(&mut self, ctx: &Arc<HashJoinCtx>) {
        let concurrency = ctx.concurrency;
        let (build_src, probe_src) = self.build_and_probe_sources();
        let (build_src, probe_src) = (Arc::clone(build_src), Arc::clone(probe_src));
        tracing::debug!(
            join_type = ?ctx.join_type,
            right_as_build = ctx.right_as_build,
            concurrency,
            partitions = ctx.partition_number,
            "starting hash join"
        );

        let (build_done_tx, build_done_rx) = bounded::<Result<()>>(1);
        let build_ctx = Arc::clone(ctx);
        self.threads.push(thread::spawn(move || {
            let built = recover_panic(|| build::fetch_and_build_hash_table(&build_ctx, &build_src));
            if let Err(err) = &built {
                tracing::debug!(%err, "hash table build failed");
            }
            let _ = build_done_tx.send(built);
        }));

        let (result_tx, result_rx) = bounded::<JoinResult>(concurrency + 1);
        let (resource_tx, resource_rx) = bounded::<ProbeChkResource>(concurrency);
        let mut probe_result_txs = Vec::with_capacity(concurrency);
        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let (probe_tx, probe_rx) = bounded::<Chunk>(1);
            let (join_chk_tx, join_chk_rx) = bounded::<Chunk>(1);
            // Both channels are empty and sized for one chunk.
            let _ = join_chk_tx.try_send(Chunk::new(ctx.max_chunk_size));
            let _ = resource_tx.try_send(ProbeChkResource {
                chk: Chunk::new(ctx.max_chunk_size),
                dest: worker_id,
            });
            probe_result_txs.push(probe_tx);
            workers.push(ProbeWorker::new(
                worker_id,
                Arc::clone(ctx),
                new_join_probe(Arc::clone(ctx), worker_id),
                probe_rx,
                resource_tx.clone(),
                join_chk_tx,
                join_chk_rx,
                result_tx.clone(),
            ));
        }

        let fetcher = ProbeSideTupleFetcher {
            ctx: Arc::clone(ctx),
            source: probe_src,
            resource_rx,
            probe_result_txs,
            build_done_rx,
            result_tx,
        };
        self.threads.push(thread::spawn(move || fetcher.run()));

        let waiter_ctx = Arc::clone(ctx);
        self.threads.push(thread::spawn(move || {
            probe::wait_join_workers_and_close_result_chan(waiter_ctx, workers)
        }));
        self.result_rx = Some(result_rx);
    }

    /// Tears down one run. `finished` is set before the close signal fires.
    fn stop_run(&mut self, ctx: Arc<HashJoinCtx>) {
        ctx.set_finished();
        drop(self.close_tx.take());
        if let Some(result_rx) = self.result_rx.take() {
            result_rx.try_iter().for_each(drop);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.prepared = false;

        if let Some(stats) = &ctx.stats {
            self.register_stats(stats);
        }
        drop(ctx);
        self.mem_tracker.reset();
        self.mem_tracker.detach();
        self.disk_tracker.reset();
        self.disk_tracker.detach();
    }

    fn register_stats(&mut self, run: &HashJoinRuntimeStats) {
        tracing::debug!(stats = %run, "hash join closed");
        match &self.stats {
            Some(total) => total.merge(run),
            None => {
                let total = HashJoinRuntimeStats::new(run.concurrency());
                total.merge(run);
                self.stats = Some(Arc::new(total));
            }
        }
    }
}

impl RowSource for PartitionedHashJoinExec {
    fn field_types(&self) -> &[FieldType] {
        &self.output_types
    }

    fn open(&mut self) -> Result<()> {
        if self.ctx.is_some() || self.left_opened || self.right_opened {
            self.close()?;
        }
        self.left.lock().open()?;
        self.left_opened = true;
        self.right.lock().open()?;
        self.right_opened = true;

        self.mem_tracker.reset();
        if let Some(parent) = &self.stmt_mem_tracker {
            self.mem_tracker.attach_to(parent);
        }
        self.disk_tracker.reset();
        if let Some(parent) = &self.stmt_disk_tracker {
            self.disk_tracker.attach_to(parent);
        }

        let (close_tx, close_rx) = bounded::<()>(0);
        self.ctx = Some(Arc::new(self.new_ctx(close_rx)));
        self.close_tx = Some(close_tx);
        self.prepared = false;
        Ok(())
    }

    fn next(&mut self, chk: &mut Chunk) -> Result<()> {
        let ctx = self.ctx.clone().ok_or(JoinError::NotOpened)?;
        if context::should_limit_probe_fetch_size(ctx.join_type, ctx.right_as_build) {
            ctx.required_rows.store(chk.required_rows(), Ordering::Release);
        }
        if !self.prepared {
            self.start_build_and_probe(&ctx);
            self.prepared = true;
        }
        chk.reset();

        let Some(result_rx) = &self.result_rx else {
            return Ok(());
        };
        match result_rx.recv() {
            // Every worker is done.
            Err(_) => Ok(()),
            Ok(Err(err)) => {
                ctx.set_finished();
                Err(err)
            }
            Ok(Ok(mut result)) => {
                chk.swap_rows(&mut result.chk);
                let _ = result.src.try_send(result.chk);
                Ok(())
            }
        }
    }

    /// Stops every thread and closes the children that opened. Safe to call
    /// before `open`, after a failed `open` and more than once.
    fn close(&mut self) -> Result<()> {
        if let Some(ctx) = self.ctx.take() {
            self.stop_run(ctx);
        }
        let left = if std::mem::take(&mut self.left_opened) {
            self.left.lock().close()
        } else {
            Ok(())
        };
        let right = if std::mem::take(&mut self.right_opened) {
            self.right.lock().close()
        } else {
            Ok(())
        };
        left.and(right)
    }
}

impl Drop for PartitionedHashJoinExec {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Columns of the rows `next` produces. Columns a join may NULL-extend become
/// nullable.
fn output_types(cfg: &JoinConfig, left: &[FieldType], right: &[FieldType]) -> Vec<FieldType> {
    let project = |used: &Option<Vec<usize>>, types: &[FieldType], nullable: bool| {
        let cols: Vec<usize> = used.clone().unwrap_or_else(|| (0..types.len()).collect());
        cols.into_iter()
            .map(|c| FieldType {
                nullable: types[c].nullable || nullable,
                ..types[c]
            })
            .collect::<Vec<_>>()
    };
    match cfg.join_type {
        JoinType::Semi | JoinType::AntiSemi => project(&cfg.left_used, left, false),
        JoinType::Inner => [project(&cfg.left_used, left, false), project(&cfg.right_used, right, false)].concat(),
        JoinType::LeftOuter => [project(&cfg.left_used, left, false), project(&cfg.right_used, right, true)].concat(),
        JoinType::RightOuter => [project(&cfg.left_used, left, true), project(&cfg.right_used, right, false)].concat(),
    }
}
