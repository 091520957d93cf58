//! Process-wide operation counters.
//!
//! # Responsibility
//! - Count calls and errors per `(operation, target)` pair.
//! - Accumulate wall-clock duration per pair through a scope timer.
//!
//! # Invariants
//! - A timer records exactly once, when dropped.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Exec,
    Query,
    QueryRow,
    CopyIn,
    Begin,
    Commit,
    Rollback,
    Get,
    GetMany,
    GetMetadata,
    Upsert,
    Remove,
    RemoveMany,
    Count,
    Exists,
    SweepOrphans,
    PurgeOrphans,
    UpdateState,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Query => "query",
            Self::QueryRow => "query_row",
            Self::CopyIn => "copy_in",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Get => "get",
            Self::GetMany => "get_many",
            Self::GetMetadata => "get_metadata",
            Self::Upsert => "upsert",
            Self::Remove => "remove",
            Self::RemoveMany => "remove_many",
            Self::Count => "count",
            Self::Exists => "exists",
            Self::SweepOrphans => "sweep_orphans",
            Self::PurgeOrphans => "purge_orphans",
            Self::UpdateState => "update_state",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub calls: u64,
    pub errors: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

static REGISTRY: Lazy<Mutex<HashMap<(Op, &'static str), OpStats>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Starts a timer for one call of `op` on `target`.
pub fn timer(op: Op, target: &'static str) -> OpTimer {
    OpTimer {
        op,
        target,
        started_at: Instant::now(),
        failed: Cell::new(false),
    }
}

pub fn snapshot() -> BTreeMap<(Op, &'static str), OpStats> {
    REGISTRY
        .lock()
        .iter()
        .map(|(key, stats)| (*key, *stats))
        .collect()
}

pub fn stats(op: Op, target: &'static str) -> OpStats {
    REGISTRY
        .lock()
        .get(&(op, target))
        .copied()
        .unwrap_or_default()
}

pub fn reset() {
    REGISTRY.lock().clear();
}

pub struct OpTimer {
    op: Op,
    target: &'static str,
    started_at: Instant,
    failed: Cell<bool>,
}

impl OpTimer {
    /// Marks the timed call as failed.
    pub fn fail(&self) {
        self.failed.set(true);
    }

    /// Marks the call as failed when `result` is an error, then passes it on.
    pub fn track<T, E>(&self, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            self.fail();
        }
        result
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        let mut registry = REGISTRY.lock();
        let stats = registry.entry((self.op, self.target)).or_default();
        stats.calls += 1;
        if self.failed.get() {
            stats.errors += 1;
        }
        stats.total_duration += elapsed;
        stats.max_duration = stats.max_duration.max(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::{stats, timer, Op};

    #[test]
    fn timer_counts_calls_and_failures() {
        {
            let _ok = timer(Op::Count, "metrics_test");
        }
        {
            let failed = timer(Op::Count, "metrics_test");
            let result: Result<(), &str> = failed.track(Err("boom"));
            assert!(result.is_err());
        }

        let counted = stats(Op::Count, "metrics_test");
        assert_eq!(counted.calls, 2);
        assert_eq!(counted.errors, 1);
        assert!(counted.max_duration <= counted.total_duration);
    }
}
