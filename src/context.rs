//! Per-execution state shared by every thread of one join.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::config::{JoinConfig, JoinType};
use crate::hash_table::JoinHashTable;
use crate::meta::JoinTableMeta;
use crate::predicate::Predicate;
use crate::stats::HashJoinRuntimeStats;
use crate::tracker::MemTracker;

pub(crate) struct HashJoinCtx {
    pub(crate) join_type: JoinType,
    pub(crate) right_as_build: bool,
    pub(crate) concurrency: usize,
    pub(crate) partition_number: usize,
    pub(crate) max_chunk_size: usize,

    pub(crate) build_keys: Vec<usize>,
    pub(crate) probe_keys: Vec<usize>,
    pub(crate) build_filter: Option<Arc<dyn Predicate>>,
    pub(crate) probe_filter: Option<Arc<dyn Predicate>>,
    pub(crate) other_condition: Option<Arc<dyn Predicate>>,
    /// Probe-side columns copied into output rows.
    pub(crate) probe_used: Vec<usize>,
    pub(crate) meta: JoinTableMeta,

    /// Set once by the build thread, read-only afterwards.
    pub(crate) hash_table: OnceLock<Arc<JoinHashTable>>,
    pub(crate) finished: AtomicBool,
    /// Row count the caller asked for in its latest `next`.
    pub(crate) required_rows: AtomicUsize,
    /// Disconnected when the executor closes.
    pub(crate) close_rx: Receiver<()>,
    pub(crate) mem_tracker: Arc<MemTracker>,
    pub(crate) stats: Option<Arc<HashJoinRuntimeStats>>,
}

impl HashJoinCtx {
    pub(crate) fn new(
        cfg: &JoinConfig,
        probe_used: Vec<usize>,
        meta: JoinTableMeta,
        close_rx: Receiver<()>,
        mem_tracker: Arc<MemTracker>,
    ) -> Self {
        let (build_keys, probe_keys, build_filter, probe_filter) = if cfg.right_as_build {
            (
                cfg.right_keys.clone(),
                cfg.left_keys.clone(),
                cfg.right_filter.clone(),
                cfg.left_filter.clone(),
            )
        } else {
            (
                cfg.left_keys.clone(),
                cfg.right_keys.clone(),
                cfg.left_filter.clone(),
                cfg.right_filter.clone(),
            )
        };
        Self {
            join_type: cfg.join_type,
            right_as_build: cfg.right_as_build,
            concurrency: cfg.concurrency,
            partition_number: cfg.partition_number,
            max_chunk_size: cfg.max_chunk_size,
            build_keys,
            probe_keys,
            build_filter,
            probe_filter,
            other_condition: cfg.other_condition.clone(),
            probe_used,
            meta,
            hash_table: OnceLock::new(),
            finished: AtomicBool::new(false),
            required_rows: AtomicUsize::new(0),
            close_rx,
            mem_tracker,
            stats: cfg
                .collect_stats
                .then(|| Arc::new(HashJoinRuntimeStats::new(cfg.concurrency))),
        }
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Finished, or the close signal already fired.
    pub(crate) fn is_closing(&self) -> bool {
        self.is_finished() || matches!(self.close_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn hash_table(&self) -> Option<&Arc<JoinHashTable>> {
        self.hash_table.get()
    }

    /// Width of a stored build row.
    pub(crate) fn build_width(&self) -> usize {
        self.meta.stored_column_count()
    }

    /// Semi and anti joins only output the left input.
    pub(crate) fn outputs_right_side(&self) -> bool {
        !matches!(self.join_type, JoinType::Semi | JoinType::AntiSemi)
    }
}

/// What the join does with a build or probe row that found no partner.
pub(crate) fn preserves_build(join_type: JoinType, right_as_build: bool) -> bool {
    matches!(
        (join_type, right_as_build),
        (JoinType::LeftOuter, false) | (JoinType::RightOuter, true) | (JoinType::AntiSemi, false)
    )
}

pub(crate) fn preserves_probe(join_type: JoinType, right_as_build: bool) -> bool {
    matches!(
        (join_type, right_as_build),
        (JoinType::LeftOuter, true) | (JoinType::RightOuter, false) | (JoinType::AntiSemi, true)
    )
}

/// Build rows must be revisited after probing: unmatched ones for the
/// build-preserving joins, matched ones for a semi join building on the left.
pub(crate) fn need_scan_row_table(join_type: JoinType, right_as_build: bool) -> bool {
    preserves_build(join_type, right_as_build) || (join_type == JoinType::Semi && !right_as_build)
}

/// With nothing to probe against, only unmatched probe rows could reach the
/// output.
pub(crate) fn can_skip_probe_if_hash_table_empty(join_type: JoinType, right_as_build: bool) -> bool {
    !preserves_probe(join_type, right_as_build)
}

/// Outer joins driven by the probe side emit at most one row per probe row
/// when nothing matches, so the caller's row limit is worth forwarding.
pub(crate) fn should_limit_probe_fetch_size(join_type: JoinType, right_as_build: bool) -> bool {
    matches!(
        (join_type, right_as_build),
        (JoinType::LeftOuter, true) | (JoinType::RightOuter, false)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_table() {
        use JoinType::*;
        // (type, right_as_build, preserves_build, preserves_probe, need_scan)
        let cases = [
            (Inner, true, false, false, false),
            (Inner, false, false, false, false),
            (LeftOuter, true, false, true, false),
            (LeftOuter, false, true, false, true),
            (RightOuter, true, true, false, true),
            (RightOuter, false, false, true, false),
            (Semi, true, false, false, false),
            (Semi, false, false, false, true),
            (AntiSemi, true, false, true, false),
            (AntiSemi, false, true, false, true),
        ];
        for (jt, rab, pb, pp, scan) in cases {
            assert_eq!(preserves_build(jt, rab), pb, "{jt:?} {rab}");
            assert_eq!(preserves_probe(jt, rab), pp, "{jt:?} {rab}");
            assert_eq!(need_scan_row_table(jt, rab), scan, "{jt:?} {rab}");
            assert_eq!(can_skip_probe_if_hash_table_empty(jt, rab), !pp);
        }
    }

    #[test]
    fn limit_only_for_probe_driven_outer_joins() {
        assert!(should_limit_probe_fetch_size(JoinType::LeftOuter, true));
        assert!(should_limit_probe_fetch_size(JoinType::RightOuter, false));
        assert!(!should_limit_probe_fetch_size(JoinType::LeftOuter, false));
        assert!(!should_limit_probe_fetch_size(JoinType::Inner, true));
        assert!(!should_limit_probe_fetch_size(JoinType::AntiSemi, true));
    }
}
