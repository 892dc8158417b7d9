//! Probe side: one fetcher feeding `concurrency` probe workers.
//!
//! Chunks circulate instead of being allocated per batch. The fetcher fills
//! an empty probe chunk taken from the resource channel and hands it to the
//! worker named by `dest`; the worker gives it back once probed. Output
//! chunks travel the same way: every worker owns one, ships it to the
//! coordinator through the result channel and gets it back through `src`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};

use crate::chunk::Chunk;
use crate::context::{self, HashJoinCtx};
use crate::error::{Result, recover_panic};
use crate::join_probe::JoinProbe;
use crate::source::SharedSource;

/// A full output chunk and the channel that returns it to its worker.
pub(crate) struct HashJoinWorkerResult {
    pub(crate) chk: Chunk,
    pub(crate) src: Sender<Chunk>,
}

pub(crate) type JoinResult = Result<HashJoinWorkerResult>;

/// An empty probe chunk owned by worker `dest`.
pub(crate) struct ProbeChkResource {
    pub(crate) chk: Chunk,
    pub(crate) dest: usize,
}

/// Sends unless the join is closing. Returns whether the value was delivered.
fn send_or_close<T>(ctx: &HashJoinCtx, tx: &Sender<T>, value: T) -> bool {
    select! {
        send(tx, value) -> res => res.is_ok(),
        recv(ctx.close_rx) -> _ => false,
    }
}

pub(crate) struct ProbeSideTupleFetcher {
    pub(crate) ctx: Arc<HashJoinCtx>,
    pub(crate) source: SharedSource,
    pub(crate) resource_rx: Receiver<ProbeChkResource>,
    /// One per worker, indexed by `ProbeChkResource::dest`.
    pub(crate) probe_result_txs: Vec<Sender<Chunk>>,
    pub(crate) build_done_rx: Receiver<Result<()>>,
    pub(crate) result_tx: Sender<JoinResult>,
}

impl ProbeSideTupleFetcher {
    /// Runs until the probe input is drained. Dropping `self` on return
    /// disconnects every worker's input.
    pub(crate) fn run(self) {
        let _span = tracing::debug_span!("probe_fetcher").entered();
        if let Err(err) = recover_panic(|| self.fetch_probe_side_chunks()) {
            tracing::debug!(%err, "probe fetcher failed");
            send_or_close(&self.ctx, &self.result_tx, Err(err));
        }
    }

    /// Blocks until the build finishes. `Ok(false)` means probing is
    /// pointless: the join closed, or the table is empty and no probe row can
    /// survive without a partner.
    fn wait_for_build_side(&self) -> Result<bool> {
        let built = select! {
            recv(self.build_done_rx) -> msg => msg,
            recv(self.ctx.close_rx) -> _ => return Ok(false),
        };
        if let Ok(Err(err)) = built {
            return Err(err);
        }
        let Some(table) = self.ctx.hash_table() else {
            return Ok(false);
        };
        let ctx = &self.ctx;
        Ok(!(table.is_hash_table_empty()
            && context::can_skip_probe_if_hash_table_empty(ctx.join_type, ctx.right_as_build)))
    }

    fn fetch_probe_side_chunks(&self) -> Result<()> {
        if !self.wait_for_build_side()? {
            return Ok(());
        }
        let ctx = &self.ctx;
        let limit_fetch = context::should_limit_probe_fetch_size(ctx.join_type, ctx.right_as_build);
        let need_scan = context::need_scan_row_table(ctx.join_type, ctx.right_as_build);
        let mut first_chunk = true;
        loop {
            if ctx.is_finished() {
                return Ok(());
            }
            let resource = select! {
                recv(self.resource_rx) -> msg => msg.ok(),
                recv(ctx.close_rx) -> _ => None,
            };
            let Some(ProbeChkResource { mut chk, dest }) = resource else {
                return Ok(());
            };
            if limit_fetch {
                let required = ctx.required_rows.load(Ordering::Acquire);
                chk.set_required_rows(required, ctx.max_chunk_size);
            }
            self.source.lock().next(&mut chk)?;
            if chk.is_empty() {
                if first_chunk && !need_scan {
                    ctx.set_finished();
                }
                return Ok(());
            }
            first_chunk = false;
            if !send_or_close(ctx, &self.probe_result_txs[dest], chk) {
                return Ok(());
            }
        }
    }
}

pub(crate) struct ProbeWorker {
    pub(crate) worker_id: usize,
    pub(crate) ctx: Arc<HashJoinCtx>,
    pub(crate) join_probe: Box<dyn JoinProbe>,
    pub(crate) probe_result_rx: Receiver<Chunk>,
    pub(crate) resource_tx: Sender<ProbeChkResource>,
    /// Holds this worker's idle output chunk.
    pub(crate) join_chk_tx: Sender<Chunk>,
    pub(crate) join_chk_rx: Receiver<Chunk>,
    pub(crate) result_tx: Sender<JoinResult>,
    probe_time: Duration,
}

impl ProbeWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: usize,
        ctx: Arc<HashJoinCtx>,
        join_probe: Box<dyn JoinProbe>,
        probe_result_rx: Receiver<Chunk>,
        resource_tx: Sender<ProbeChkResource>,
        join_chk_tx: Sender<Chunk>,
        join_chk_rx: Receiver<Chunk>,
        result_tx: Sender<JoinResult>,
    ) -> Self {
        Self {
            worker_id,
            ctx,
            join_probe,
            probe_result_rx,
            resource_tx,
            join_chk_tx,
            join_chk_rx,
            result_tx,
            probe_time: Duration::ZERO,
        }
    }

    fn get_new_join_result(&self) -> Option<Chunk> {
        select! {
            recv(self.join_chk_rx) -> msg => msg.ok().map(|mut chk| {
                chk.reset();
                chk
            }),
            recv(self.ctx.close_rx) -> _ => None,
        }
    }

    fn send_result(&self, result: JoinResult) -> bool {
        send_or_close(&self.ctx, &self.result_tx, result)
    }

    fn ship(&self, chk: Chunk) -> bool {
        self.send_result(Ok(HashJoinWorkerResult {
            chk,
            src: self.join_chk_tx.clone(),
        }))
    }

    /// Probes `probe_chk` to completion. `None` means the join is closing.
    fn process_one_probe_chunk(&mut self, probe_chk: Chunk, mut join_result: Chunk) -> Result<Option<Chunk>> {
        self.join_probe.set_chunk_for_probe(probe_chk)?;
        while !self.join_probe.is_current_chunk_probe_done() {
            self.join_probe.probe(&mut join_result)?;
            if join_result.is_full() {
                if !self.ship(join_result) {
                    return Ok(None);
                }
                match self.get_new_join_result() {
                    Some(chk) => join_result = chk,
                    None => return Ok(None),
                }
            }
        }
        Ok(Some(join_result))
    }

    fn run_join_worker(&mut self) -> Result<()> {
        let Some(mut join_result) = self.get_new_join_result() else {
            return Ok(());
        };
        loop {
            if self.ctx.is_finished() {
                break;
            }
            let probe_chk = select! {
                recv(self.probe_result_rx) -> msg => msg.ok(),
                recv(self.ctx.close_rx) -> _ => return Ok(()),
            };
            let Some(probe_chk) = probe_chk else { break };

            let start = Instant::now();
            let processed = self.process_one_probe_chunk(probe_chk, join_result);
            self.probe_time += start.elapsed();
            match processed? {
                Some(chk) => join_result = chk,
                None => return Ok(()),
            }

            if let Some(mut chk) = self.join_probe.take_probed_chunk() {
                chk.reset();
                let _ = self.resource_tx.send(ProbeChkResource {
                    chk,
                    dest: self.worker_id,
                });
            }
        }

        if !join_result.is_empty() {
            self.ship(join_result);
        } else {
            let _ = self.join_chk_tx.try_send(join_result);
        }
        Ok(())
    }

    fn scan_row_table_after_probe_done(&mut self) -> Result<()> {
        self.join_probe.init_for_scan_row_table();
        let Some(mut join_result) = self.get_new_join_result() else {
            return Ok(());
        };
        while !self.join_probe.is_scan_row_table_done() {
            self.join_probe.scan_row_table(&mut join_result)?;
            if join_result.is_full() {
                if !self.ship(join_result) {
                    return Ok(());
                }
                match self.get_new_join_result() {
                    Some(chk) => join_result = chk,
                    None => return Ok(()),
                }
            }
        }
        if !join_result.is_empty() {
            self.ship(join_result);
        }
        Ok(())
    }
}

/// Runs the probe workers, then the residual scan when the join needs one.
/// The result channel disconnects once this returns and `workers` are gone.
pub(crate) fn wait_join_workers_and_close_result_chan(ctx: Arc<HashJoinCtx>, workers: Vec<ProbeWorker>) {
    let _span = tracing::debug_span!("probe_workers", concurrency = workers.len()).entered();
    let survivors: Vec<Option<ProbeWorker>> = thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut w| {
                s.spawn(move || {
                    let start = Instant::now();
                    let outcome = recover_panic(|| w.run_join_worker());
                    if let Some(stats) = &w.ctx.stats {
                        stats.add_probe_worker(start.elapsed(), w.probe_time);
                    }
                    match outcome {
                        Ok(()) => Some(w),
                        Err(err) => {
                            w.send_result(Err(err));
                            None
                        }
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().ok().flatten()).collect()
    });

    let all_clean = survivors.iter().all(Option::is_some);
    let workers: Vec<ProbeWorker> = survivors.into_iter().flatten().collect();
    let need_scan = workers
        .first()
        .is_some_and(|w| w.join_probe.need_scan_row_table());
    if !need_scan || !all_clean || ctx.is_finished() || ctx.hash_table().is_none() {
        return;
    }

    tracing::debug!("scanning row table for residual build rows");
    thread::scope(|s| {
        for mut w in workers {
            s.spawn(move || {
                if let Err(err) = recover_panic(|| w.scan_row_table_after_probe_done()) {
                    w.send_result(Err(err));
                }
            });
        }
    });
}

