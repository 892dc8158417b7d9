//! Runtime statistics of one hash join execution.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct HashJoinRuntimeStats {
    /// Nanoseconds spent fetching the build side and building the table.
    fetch_and_build_hash_table: AtomicU64,
    /// Nanoseconds spent in the hash-construction wave alone.
    build_table_elapse: AtomicU64,
    /// Summed over probe workers.
    fetch_and_probe: AtomicU64,
    probe: AtomicU64,
    max_fetch_and_probe: AtomicU64,
    probe_collision: AtomicI64,
    concurrency: usize,
}

impl HashJoinRuntimeStats {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub(crate) fn set_fetch_and_build(&self, d: Duration) {
        self.fetch_and_build_hash_table
            .store(d.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_build_table_elapse(&self, d: Duration) {
        self.build_table_elapse
            .store(d.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records one probe worker's totals.
    pub(crate) fn add_probe_worker(&self, fetch_and_probe: Duration, probe: Duration) {
        let total = fetch_and_probe.as_nanos() as u64;
        self.fetch_and_probe.fetch_add(total, Ordering::Relaxed);
        self.probe
            .fetch_add(probe.as_nanos() as u64, Ordering::Relaxed);
        self.max_fetch_and_probe.fetch_max(total, Ordering::Relaxed);
    }

    pub(crate) fn add_probe_collision(&self, n: i64) {
        if n != 0 {
            self.probe_collision.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn fetch_and_build_hash_table(&self) -> Duration {
        nanos(&self.fetch_and_build_hash_table)
    }

    pub fn build_table_elapse(&self) -> Duration {
        nanos(&self.build_table_elapse)
    }

    pub fn fetch_and_probe(&self) -> Duration {
        nanos(&self.fetch_and_probe)
    }

    pub fn probe(&self) -> Duration {
        nanos(&self.probe)
    }

    pub fn max_fetch_and_probe(&self) -> Duration {
        nanos(&self.max_fetch_and_probe)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn probe_collision(&self) -> i64 {
        self.probe_collision.load(Ordering::Relaxed)
    }

    /// Folds another execution's numbers into this one.
    pub fn merge(&self, other: &HashJoinRuntimeStats) {
        for (dst, src) in [
            (&self.fetch_and_build_hash_table, &other.fetch_and_build_hash_table),
            (&self.build_table_elapse, &other.build_table_elapse),
            (&self.fetch_and_probe, &other.fetch_and_probe),
            (&self.probe, &other.probe),
        ] {
            dst.fetch_add(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.max_fetch_and_probe.fetch_max(
            other.max_fetch_and_probe.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.add_probe_collision(other.probe_collision());
    }
}

fn nanos(v: &AtomicU64) -> Duration {
    Duration::from_nanos(v.load(Ordering::Relaxed))
}

impl fmt::Display for HashJoinRuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let build_total = self.fetch_and_build_hash_table();
        let mut wrote = false;
        if !build_total.is_zero() {
            let build = self.build_table_elapse();
            write!(
                f,
                "build_hash_table:{{total:{:?}, fetch:{:?}, build:{:?}}}",
                build_total,
                build_total.saturating_sub(build),
                build
            )?;
            wrote = true;
        }
        let probe = self.probe();
        if !probe.is_zero() {
            if wrote {
                f.write_str(", ")?;
            }
            let total = self.fetch_and_probe();
            write!(
                f,
                "probe:{{concurrency:{}, total:{:?}, max:{:?}, probe:{:?}, fetch:{:?}",
                self.concurrency,
                total,
                self.max_fetch_and_probe(),
                probe,
                total.saturating_sub(probe)
            )?;
            if self.probe_collision() > 0 {
                write!(f, ", probe_collision:{}", self.probe_collision())?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}
