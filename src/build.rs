//! Build side: fetch, partition and index the build input.
//!
//! ```text
//!  fetcher ──chunks──► partition workers ──► per-partition RowTables
//!                                                   │ merge
//!                                                   ▼
//!                    build tasks ──► build workers ──► JoinHashTable
//! ```
//!
//! Each wave runs inside its own `thread::scope`, so a wave has fully stopped
//! before the next one starts. Workers report through a shared error channel;
//! once it holds anything the remaining workers wind down and the first error
//! is returned.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded, select};

use crate::chunk::Chunk;
use crate::context::HashJoinCtx;
use crate::error::{JoinError, Result, recover_panic};
use crate::hash_table::JoinHashTable;
use crate::row_table::RowTable;
use crate::row_table_builder::RowTableBuilder;
use crate::source::SharedSource;

/// Segments `seg_start_idx..seg_end_idx` of one partition, indexed by a single
/// build worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BuildTask {
    pub(crate) partition_idx: usize,
    pub(crate) seg_start_idx: usize,
    pub(crate) seg_end_idx: usize,
}

/// One task per partition is good enough when there is a worker per
/// partition and no partition strays more than 80% from the mean.
pub(crate) fn check_balance(seg_counts: &[usize], concurrency: usize, total_segments: usize) -> bool {
    if concurrency != seg_counts.len() || seg_counts.is_empty() {
        return false;
    }
    let avg = total_segments / seg_counts.len();
    let threshold = (avg as f64 * 0.8) as usize;
    seg_counts.iter().all(|&n| n.abs_diff(avg) <= threshold)
}

pub(crate) fn create_tasks(
    seg_counts: &[usize],
    concurrency: usize,
    total_segments: usize,
) -> Vec<BuildTask> {
    let balanced = check_balance(seg_counts, concurrency, total_segments);
    let seg_step = (total_segments / concurrency.max(1)).max(1);
    let mut tasks = Vec::new();
    for (partition_idx, &segments) in seg_counts.iter().enumerate() {
        if balanced {
            tasks.push(BuildTask {
                partition_idx,
                seg_start_idx: 0,
                seg_end_idx: segments,
            });
            continue;
        }
        for start in (0..segments).step_by(seg_step) {
            tasks.push(BuildTask {
                partition_idx,
                seg_start_idx: start,
                seg_end_idx: (start + seg_step).min(segments),
            });
        }
    }
    tasks
}

/// Records a failed worker. Only the first error matters; later ones are
/// dropped when the channel is full.
fn report(err_tx: &Sender<JoinError>, err: JoinError) {
    let _ = err_tx.try_send(err);
}

fn first_error(err_rx: &Receiver<JoinError>) -> Result<()> {
    match err_rx.try_recv() {
        Ok(err) => Err(err),
        Err(_) => Ok(()),
    }
}

/// Reads the whole build input and publishes the hash table on `ctx`.
///
/// Returns `Ok` without a table when the join was closed midway.
pub(crate) fn fetch_and_build_hash_table(ctx: &Arc<HashJoinCtx>, source: &SharedSource) -> Result<()> {
    let _span = tracing::debug_span!("fetch_and_build_hash_table").entered();
    let start = Instant::now();
    let concurrency = ctx.concurrency;
    let (err_tx, err_rx) = bounded::<JoinError>(1 + concurrency);

    let partitioned = partition_build_side(ctx, source, &err_tx, &err_rx);
    first_error(&err_rx)?;
    if ctx.is_closing() {
        return Ok(());
    }

    let mut row_tables: Vec<RowTable> = (0..ctx.partition_number).map(|_| RowTable::new()).collect();
    for worker_tables in partitioned {
        for (merged, table) in row_tables.iter_mut().zip(worker_tables) {
            if let Some(table) = table {
                merged.merge(table);
            }
        }
    }
    let seg_counts: Vec<usize> = row_tables.iter().map(RowTable::segment_count).collect();
    let total_segments: usize = seg_counts.iter().sum();

    let build_start = Instant::now();
    let table = JoinHashTable::new(row_tables);
    ctx.mem_tracker.consume(table.bucket_mem_usage() as i64);
    let tasks = create_tasks(&seg_counts, concurrency, total_segments);
    tracing::debug!(
        rows = table.total_row_count(),
        segments = total_segments,
        tasks = tasks.len(),
        "building hash table"
    );
    build_hash_table(ctx, &table, tasks, &err_tx, &err_rx);
    first_error(&err_rx)?;
    if ctx.is_closing() {
        return Ok(());
    }

    if let Some(stats) = &ctx.stats {
        stats.set_build_table_elapse(build_start.elapsed());
        stats.set_fetch_and_build(start.elapsed());
    }
    ctx.hash_table
        .set(Arc::new(table))
        .map_err(|_| JoinError::Internal("hash table built twice".into()))
}

/// Fetch and partition waves. Returns the row tables of every worker that
/// finished cleanly.
fn partition_build_side(
    ctx: &Arc<HashJoinCtx>,
    source: &SharedSource,
    err_tx: &Sender<JoinError>,
    err_rx: &Receiver<JoinError>,
) -> Vec<Vec<Option<RowTable>>> {
    let (chk_tx, chk_rx) = bounded::<Chunk>(1);
    thread::scope(|s| {
        s.spawn(move || {
            if let Err(err) = recover_panic(|| fetch_build_side_rows(ctx, source, chk_tx, err_rx)) {
                report(err_tx, err);
            }
        });

        let handles: Vec<_> = (0..ctx.concurrency)
            .map(|_| {
                let chk_rx = chk_rx.clone();
                s.spawn(move || match recover_panic(|| split_and_append(ctx, chk_rx)) {
                    Ok(tables) => Some(tables),
                    Err(err) => {
                        report(err_tx, err);
                        None
                    }
                })
            })
            .collect();
        drop(chk_rx);

        handles
            .into_iter()
            .filter_map(|h| h.join().ok().flatten())
            .collect()
    })
}

fn fetch_build_side_rows(
    ctx: &HashJoinCtx,
    source: &SharedSource,
    chk_tx: Sender<Chunk>,
    err_rx: &Receiver<JoinError>,
) -> Result<()> {
    loop {
        if ctx.is_closing() || !err_rx.is_empty() {
            return Ok(());
        }
        let mut chk = Chunk::new(ctx.max_chunk_size);
        source.lock().next(&mut chk)?;
        if chk.is_empty() {
            return Ok(());
        }
        // A failed send means every partition worker is gone and one of them
        // reported why.
        let sent = select! {
            send(chk_tx, chk) -> res => res.is_ok(),
            recv(ctx.close_rx) -> _ => false,
        };
        if !sent {
            return Ok(());
        }
    }
}

fn split_and_append(ctx: &HashJoinCtx, chk_rx: Receiver<Chunk>) -> Result<Vec<Option<RowTable>>> {
    let mut builder = RowTableBuilder::new(ctx.build_keys.clone(), ctx.partition_number);
    let mut tables: Vec<Option<RowTable>> = (0..ctx.partition_number).map(|_| None).collect();
    loop {
        let chk = select! {
            recv(chk_rx) -> msg => msg.ok(),
            recv(ctx.close_rx) -> _ => return Ok(tables),
        };
        let Some(chk) = chk else { break };
        let appended =
            builder.process_chunk(&chk, &ctx.meta, ctx.build_filter.as_deref(), &mut tables)?;
        ctx.mem_tracker.consume(appended as i64);
    }
    builder.append_remaining_segments(&mut tables);
    Ok(tables)
}

/// Hash-construction wave.
fn build_hash_table(
    ctx: &HashJoinCtx,
    table: &JoinHashTable,
    tasks: Vec<BuildTask>,
    err_tx: &Sender<JoinError>,
    err_rx: &Receiver<JoinError>,
) {
    let (task_tx, task_rx) = bounded::<BuildTask>(ctx.concurrency);
    thread::scope(|s| {
        for _ in 0..ctx.concurrency {
            let task_rx = task_rx.clone();
            s.spawn(move || {
                if let Err(err) = recover_panic(|| run_build_tasks(ctx, table, task_rx)) {
                    report(err_tx, err);
                }
            });
        }
        drop(task_rx);

        for task in tasks {
            if !err_rx.is_empty() {
                break;
            }
            let sent = select! {
                send(task_tx, task) -> res => res.is_ok(),
                recv(ctx.close_rx) -> _ => false,
            };
            if !sent {
                break;
            }
        }
        drop(task_tx);
    });
}

fn run_build_tasks(ctx: &HashJoinCtx, table: &JoinHashTable, task_rx: Receiver<BuildTask>) -> Result<()> {
    loop {
        select! {
            recv(task_rx) -> msg => match msg {
                Ok(task) => table
                    .sub_table(task.partition_idx)
                    .build(task.seg_start_idx, task.seg_end_idx),
                Err(_) => return Ok(()),
            },
            recv(ctx.close_rx) -> _ => return Ok(()),
        }
    }
}
