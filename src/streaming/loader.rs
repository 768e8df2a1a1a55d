//! Budgeted background loader
//!
//! Takes the most urgent node off the to-load queue, fetches its points if
//! their count is still unknown, and admits it into the point budget by
//! evicting loaded nodes that are strictly less urgent. A node that cannot
//! be admitted also drops the rest of the queue: everything behind it is
//! less urgent and would not fit either.
//!
//! The point source is only ever called with the queue lock released, so a
//! slow fetch never stalls the render thread's traversal.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use crate::core::Error;
use crate::core::types::Result;
use crate::streaming::node::{NodeStatus, OctreeNode};
use crate::streaming::scheduler::{LoadQueues, Shared};
use crate::streaming::source::PointBatch;

/// Outcome of one loader step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// The to-load queue was empty
    Idle,
    /// The dequeued node was no longer waiting to be loaded
    Superseded,
    /// The node was admitted into the budget
    Admitted,
    /// The node did not fit; the to-load queue was dropped
    Rejected,
    /// The node was torn down while its points were being fetched
    Abandoned,
}

pub(crate) struct BudgetedLoader<'a> {
    shared: &'a Shared,
}

impl<'a> BudgetedLoader<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    /// Step until shutdown. Returns the first error, which ends the loader.
    pub(crate) fn run(&self) -> Result<()> {
        while !self.shared.is_shut_down() {
            self.step(true)?;
        }
        Ok(())
    }

    /// Process at most one node.
    ///
    /// With `wait` set, an empty queue blocks until a traversal signals new
    /// work or the idle timeout passes.
    pub(crate) fn step(&self, wait: bool) -> Result<Step> {
        let shared = self.shared;
        let mut queues = shared.lock_queues();

        let Some(entry) = queues.to_load.pop() else {
            if wait && !shared.is_shut_down() {
                let timeout = Duration::from_millis(shared.config.loader_idle_wait_ms);
                let _ = shared
                    .queue_ready
                    .wait_timeout(queues, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return Ok(Step::Idle);
        };
        let priority = entry.priority;
        let node = entry.node;
        let generation = queues.generation;

        let needs_fetch = {
            let mut state = node.lock();
            if state.status() != NodeStatus::ToLoad {
                shared.stats.stale();
                return Ok(Step::Superseded);
            }
            state.transition(node.id(), NodeStatus::Loading)?;
            state.point_count().is_none()
        };

        if needs_fetch {
            drop(queues);
            let fetched = self.fetch(&node);
            queues = shared.lock_queues();

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    self.abandon(&node);
                    return Err(e);
                }
            };

            let mut state = node.lock();
            // The count is kept even when the node was torn down meanwhile
            state.store_payload(node.id(), batch);
            if state.status() != NodeStatus::Loading {
                state.discard_payload();
                log::trace!("{} left Loading during fetch ({:?})", node.id(), state.status());
                return Ok(Step::Abandoned);
            }
        }

        let points = node.point_count().unwrap_or(0);
        if self.make_room(&mut queues, &node, priority, points)? {
            drop(queues);
            self.admit(&node, priority)
        } else {
            self.reject(&mut queues, &node, generation, points)?;
            Ok(Step::Rejected)
        }
    }

    fn fetch(&self, node: &OctreeNode) -> Result<PointBatch> {
        let batch = self.shared.source.load_points(node.id(), node.bounds())?;
        self.shared.stats.fetched(batch.len() as u64);
        log::trace!("Fetched {} points for {}", batch.len(), node.id());
        Ok(batch)
    }

    /// Undo `ToLoad -> Loading` after a failed fetch
    fn abandon(&self, node: &OctreeNode) {
        let mut state = node.lock();
        state.discard_payload();
        if state.status() == NodeStatus::Loading {
            // Loading is not resident, so the delta is always zero
            if let Err(e) = state.transition(node.id(), NodeStatus::Invisible) {
                log::error!("{}", e);
            }
        }
    }

    /// Evict strictly less urgent loaded nodes until `points` fit.
    ///
    /// Returns whether they fit. Must be called with the queue lock held.
    fn make_room(&self, queues: &mut LoadQueues, candidate: &OctreeNode, priority: f32, points: u64) -> Result<bool> {
        let shared = self.shared;

        while !shared.ledger.fits(points) {
            let Some(head) = queues.loaded.peek() else {
                return Ok(false);
            };
            let victim = Arc::clone(&head.node);
            let victim_priority = head.priority;

            let mut state = victim.lock();
            if !state.status().is_resident() {
                // Moved on since the traversal queued it
                drop(state);
                queues.loaded.pop();
                continue;
            }
            if victim_priority >= priority {
                return Ok(false);
            }

            queues.loaded.pop();
            let next = if state.has_handle() {
                NodeStatus::ToDelete
            } else {
                state.discard_payload();
                NodeStatus::Invisible
            };
            let freed = state.resident_points();
            let delta = state.transition(victim.id(), next)?;
            shared.ledger.apply(delta);
            drop(state);

            if next == NodeStatus::ToDelete {
                shared.to_delete.push(Arc::clone(&victim));
            }
            shared.stats.evicted();
            log::trace!(
                "Evicted {} ({:.1}px, {} points) for {} ({:.1}px)",
                victim.id(),
                victim_priority,
                freed,
                candidate.id(),
                priority
            );
        }
        Ok(true)
    }

    /// Finish loading an admitted node. Called without the queue lock.
    fn admit(&self, node: &Arc<OctreeNode>, priority: f32) -> Result<Step> {
        let shared = self.shared;

        let needs_payload = {
            let state = node.lock();
            !state.has_payload() && !state.has_handle()
        };
        let lazy = if needs_payload {
            match self.fetch(node) {
                Ok(batch) => Some(batch),
                Err(e) => {
                    self.abandon(node);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut state = node.lock();
        match state.status() {
            NodeStatus::Loading => {
                if let Some(batch) = lazy {
                    state.store_payload(node.id(), batch);
                }
                let next = if state.has_handle() {
                    state.discard_payload();
                    NodeStatus::Rendered
                } else {
                    NodeStatus::ToRender
                };
                let delta = state.transition(node.id(), next)?;
                shared.ledger.apply(delta);
                drop(state);

                if next == NodeStatus::ToRender {
                    shared.to_render.push(Arc::clone(node));
                }
                shared.stats.admitted();
                log::trace!("Admitted {} ({:.1}px) as {:?}", node.id(), priority, next);
                Ok(Step::Admitted)
            }
            // Torn down (and possibly re-requested) while unlocked
            NodeStatus::Invisible | NodeStatus::ToLoad | NodeStatus::Rendered => {
                state.discard_payload();
                Ok(Step::Abandoned)
            }
            status => {
                drop(state);
                log::error!("Admitted node {} found in unreachable status {:?}", node.id(), status);
                Err(Error::InvariantViolation {
                    node: node.id().clone(),
                    status,
                    context: "admitted node left Loading",
                })
            }
        }
    }

    /// Drop a node that did not fit, and the rest of the to-load queue with it
    fn reject(&self, queues: &mut LoadQueues, node: &Arc<OctreeNode>, generation: u64, points: u64) -> Result<()> {
        let shared = self.shared;

        {
            let mut state = node.lock();
            state.discard_payload();
            if state.status() == NodeStatus::Loading {
                let to_delete = state.has_handle();
                let next = if to_delete { NodeStatus::ToDelete } else { NodeStatus::Invisible };
                let delta = state.transition(node.id(), next)?;
                shared.ledger.apply(delta);
                drop(state);
                if to_delete {
                    shared.to_delete.push(Arc::clone(node));
                }
            }
        }

        let dropped = if queues.generation == generation {
            let dropped = queues.to_load.len();
            queues.to_load.clear();
            dropped
        } else {
            0
        };

        shared.stats.rejected();
        log::debug!(
            "Rejected {} ({} points, {} in budget of {}), dropped {} queued nodes",
            node.id(),
            points,
            shared.ledger.points(),
            shared.ledger.budget(),
            dropped
        );
        Ok(())
    }
}
