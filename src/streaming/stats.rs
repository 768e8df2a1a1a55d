//! Counters describing what the streamer has done so far

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of the streamer's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingStats {
    /// Visibility traversals completed
    pub traversals: u64,
    /// Successful point loads from the source
    pub nodes_fetched: u64,
    /// Points received from the source
    pub points_fetched: u64,
    /// Nodes admitted into the budget
    pub admitted: u64,
    /// Loaded nodes evicted in favor of more urgent ones
    pub evictions: u64,
    /// Nodes that could not be admitted into the budget
    pub rejections: u64,
    /// Display handles created
    pub materialized: u64,
    /// Display handles destroyed
    pub destroyed: u64,
    /// Nodes reset by teardown sweeps
    pub torn_down: u64,
    /// Queue entries dropped because the node had moved on
    pub stale_dropped: u64,
}

/// Live counters shared between the render and loader threads
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    traversals: AtomicU64,
    nodes_fetched: AtomicU64,
    points_fetched: AtomicU64,
    admitted: AtomicU64,
    evictions: AtomicU64,
    rejections: AtomicU64,
    materialized: AtomicU64,
    destroyed: AtomicU64,
    torn_down: AtomicU64,
    stale_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl StatCounters {
    pub(crate) fn traversal(&self) {
        bump(&self.traversals, 1);
    }

    pub(crate) fn fetched(&self, points: u64) {
        bump(&self.nodes_fetched, 1);
        bump(&self.points_fetched, points);
    }

    pub(crate) fn admitted(&self) {
        bump(&self.admitted, 1);
    }

    pub(crate) fn evicted(&self) {
        bump(&self.evictions, 1);
    }

    pub(crate) fn rejected(&self) {
        bump(&self.rejections, 1);
    }

    pub(crate) fn materialized(&self) {
        bump(&self.materialized, 1);
    }

    pub(crate) fn destroyed(&self) {
        bump(&self.destroyed, 1);
    }

    pub(crate) fn torn_down(&self, nodes: u64) {
        bump(&self.torn_down, nodes);
    }

    pub(crate) fn stale(&self) {
        bump(&self.stale_dropped, 1);
    }

    pub(crate) fn snapshot(&self) -> StreamingStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StreamingStats {
            traversals: get(&self.traversals),
            nodes_fetched: get(&self.nodes_fetched),
            points_fetched: get(&self.points_fetched),
            admitted: get(&self.admitted),
            evictions: get(&self.evictions),
            rejections: get(&self.rejections),
            materialized: get(&self.materialized),
            destroyed: get(&self.destroyed),
            torn_down: get(&self.torn_down),
            stale_dropped: get(&self.stale_dropped),
        }
    }
}
