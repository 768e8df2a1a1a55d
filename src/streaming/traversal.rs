//! Visibility traversal
//!
//! Walks every registered hierarchy breadth-first, decides which nodes are
//! worth showing from the current viewpoint and rebuilds the loader's two
//! queues from scratch. Nodes that fail the test are torn down together with
//! everything below them that was requested or loaded.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::Error;
use crate::core::camera::ViewState;
use crate::core::types::Result;
use crate::streaming::materialize::Materializer;
use crate::streaming::node::{NodeStatus, OctreeNode};
use crate::streaming::priority::{EvictionQueue, LoadQueue};
use crate::streaming::scheduler::Shared;

/// What one traversal did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraversalReport {
    /// Nodes whose visibility was evaluated
    pub visited: usize,
    /// Nodes placed in the new to-load queue
    pub queued_for_load: usize,
    /// Loaded nodes placed in the new eviction queue
    pub already_loaded: usize,
    /// Nodes reset to `Invisible` by teardown
    pub torn_down: usize,
}

/// Bounding radius of `child` given its parent's.
///
/// Radii halve per level in a regular octree. A child that is not deeper
/// than its parent gets its radius from its own bounds.
fn child_radius(parent: &OctreeNode, parent_radius: f32, child: &OctreeNode) -> f32 {
    if child.level() > parent.level() {
        parent_radius / 2f32.powi((child.level() - parent.level()) as i32)
    } else {
        child.bounds().radius()
    }
}

pub(crate) fn traverse(shared: &Shared, view: &ViewState, materializer: &mut dyn Materializer) -> Result<TraversalReport> {
    let min_size = shared.config.min_projected_size;
    let mut to_load = LoadQueue::new();
    let mut loaded = EvictionQueue::new();
    let mut report = TraversalReport::default();

    let mut frontier: VecDeque<(Arc<OctreeNode>, f32)> = shared
        .roots()
        .into_iter()
        .map(|root| {
            let radius = root.bounds().radius();
            (root, radius)
        })
        .collect();

    while let Some((node, radius)) = frontier.pop_front() {
        if shared.is_shut_down() {
            return Err(Error::ShutDown);
        }
        report.visited += 1;

        let bounds = node.bounds();
        let distance = view.position.distance(bounds.center());
        let projected = view.projected_size(radius, distance);

        if projected < min_size || !view.frustum.intersects_aabb(bounds) {
            report.torn_down += teardown(shared, &node, materializer)?;
            continue;
        }

        {
            let mut state = node.lock();
            match state.status() {
                NodeStatus::Invisible | NodeStatus::ToLoad => {
                    state.transition(node.id(), NodeStatus::ToLoad)?;
                    to_load.push(Arc::clone(&node), projected);
                }
                NodeStatus::ToDelete => {
                    // Resurrected before the consumer got to it. The handle
                    // cannot be carried through ToLoad, so release it now; the
                    // stale delete-FIFO entry is dropped by the consumer.
                    if let Some(handle) = state.take_handle() {
                        materializer.destroy(node.id(), handle);
                        shared.stats.destroyed();
                    }
                    state.transition(node.id(), NodeStatus::ToLoad)?;
                    to_load.push(Arc::clone(&node), projected);
                    log::trace!("Resurrected {} ({:.1}px)", node.id(), projected);
                }
                NodeStatus::Loading | NodeStatus::ToRender | NodeStatus::Rendered => {
                    loaded.push(Arc::clone(&node), projected);
                }
            }
        }

        for child in node.children() {
            frontier.push_back((Arc::clone(child), child_radius(&node, radius, child)));
        }
    }

    report.queued_for_load = to_load.len();
    report.already_loaded = loaded.len();

    {
        let mut queues = shared.lock_queues();
        queues.replace(to_load, loaded);
        if report.queued_for_load > 0 {
            shared.queue_ready.notify_all();
        }
    }

    shared.stats.traversal();
    log::debug!(
        "Traversal: {} visited, {} to load, {} loaded, {} torn down",
        report.visited,
        report.queued_for_load,
        report.already_loaded,
        report.torn_down
    );
    Ok(report)
}

/// Reset `start` and its requested or loaded descendants to `Invisible`.
///
/// Returns the number of nodes whose status changed.
pub(crate) fn teardown(shared: &Shared, start: &Arc<OctreeNode>, materializer: &mut dyn Materializer) -> Result<usize> {
    let mut changed = 0;
    let mut pending = VecDeque::from([Arc::clone(start)]);

    while let Some(node) = pending.pop_front() {
        let prior = {
            let mut state = node.lock();
            let prior = state.status();
            state.discard_payload();
            if let Some(handle) = state.take_handle() {
                materializer.destroy(node.id(), handle);
                shared.stats.destroyed();
            }
            let delta = state.transition(node.id(), NodeStatus::Invisible)?;
            shared.ledger.apply(delta);
            prior
        };

        // Children of an inactive node cannot be active, so the sweep stops there
        if prior.is_active() {
            changed += 1;
            pending.extend(node.children().iter().cloned());
        }
    }

    if changed > 0 {
        shared.stats.torn_down(changed as u64);
        log::trace!("Tore down {} nodes below {}", changed, start.id());
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::Camera;
    use crate::core::types::Vec3;
    use crate::math::Aabb;
    use crate::streaming::config::StreamingConfig;
    use crate::streaming::hierarchy::{OctreeBuilder, breadth_first, full_octree_node_count};
    use crate::streaming::materialize::HeadlessMaterializer;
    use crate::streaming::node::NodeId;
    use crate::streaming::source::{MemoryPointSource, PointBatch, synthetic_points};

    const SCREEN_HEIGHT: f32 = 1080.0;

    fn shared_with(config: StreamingConfig, roots: &[Arc<OctreeNode>]) -> Shared {
        crate::core::logging::init_for_tests();
        let shared = Shared::new(config, Arc::new(MemoryPointSource::new()));
        shared.roots.lock().unwrap().extend(roots.iter().cloned());
        shared
    }

    fn facing_origin() -> ViewState {
        Camera::default().view_state(SCREEN_HEIGHT)
    }

    fn facing_away() -> ViewState {
        Camera::look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, 20.0), Vec3::Y).view_state(SCREEN_HEIGHT)
    }

    fn unit_octree(depth: u32) -> Arc<OctreeNode> {
        OctreeBuilder::new(Aabb::cube(Vec3::ZERO, 1.0), depth).build()
    }

    fn batch(n: usize) -> PointBatch {
        synthetic_points(&Aabb::cube(Vec3::ZERO, 1.0), 0, n)
    }

    #[test]
    fn test_visible_nodes_are_queued() {
        let root = unit_octree(2);
        let shared = shared_with(StreamingConfig::default(), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        let report = traverse(&shared, &facing_origin(), &mut display).unwrap();

        let total = full_octree_node_count(2);
        assert_eq!(report.visited, total);
        assert_eq!(report.queued_for_load, total);
        assert_eq!(report.torn_down, 0);
        assert!(breadth_first([&root]).all(|n| n.status() == NodeStatus::ToLoad));

        let queued = shared.lock_queues().to_load.snapshot();
        assert_eq!(queued[0].0, NodeId::root());
        assert!(queued.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_small_nodes_are_not_recursed_into() {
        let root = unit_octree(3);
        let mut config = StreamingConfig::default();
        // Root projects to ~160px, children ~80px, grandchildren ~40px
        config.min_projected_size = 60.0;
        let shared = shared_with(config, &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        let report = traverse(&shared, &facing_origin(), &mut display).unwrap();

        assert_eq!(report.queued_for_load, 1 + 8);
        assert_eq!(report.visited, 1 + 8 + 64);
        for node in breadth_first([&root]) {
            let expected = if node.level() <= 1 { NodeStatus::ToLoad } else { NodeStatus::Invisible };
            assert_eq!(node.status(), expected, "{}", node.id());
        }
    }

    #[test]
    fn test_traversal_is_idempotent() {
        let root = unit_octree(2);
        let shared = shared_with(StreamingConfig::default(), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        traverse(&shared, &facing_origin(), &mut display).unwrap();
        let first_queue = shared.lock_queues().to_load.snapshot();
        let first_status: Vec<_> = breadth_first([&root]).map(|n| n.status()).collect();

        traverse(&shared, &facing_origin(), &mut display).unwrap();
        let second_queue = shared.lock_queues().to_load.snapshot();
        let second_status: Vec<_> = breadth_first([&root]).map(|n| n.status()).collect();

        assert_eq!(first_queue, second_queue);
        assert_eq!(first_status, second_status);
        assert_eq!(shared.lock_queues().generation, 2);
    }

    #[test]
    fn test_loaded_nodes_become_eviction_candidates() {
        let root = unit_octree(1);
        let shared = shared_with(StreamingConfig::default(), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        let handle = display.issue_handle(root.id(), 10);
        root.lock().seed(NodeStatus::Rendered, Some(10), None, Some(handle));
        shared.ledger.add(10);
        let child = &root.children()[3];
        child.lock().seed(NodeStatus::Loading, None, None, None);

        let report = traverse(&shared, &facing_origin(), &mut display).unwrap();

        assert_eq!(report.already_loaded, 2);
        assert_eq!(report.queued_for_load, 7);
        let loaded = shared.lock_queues().loaded.snapshot();
        let ids: Vec<_> = loaded.iter().map(|(id, _)| id.clone()).collect();
        // Smallest projected size first
        assert_eq!(ids, vec![child.id().clone(), NodeId::root()]);
        assert_eq!(root.status(), NodeStatus::Rendered);
        assert_eq!(shared.ledger.points(), 10);
    }

    #[test]
    fn test_pending_delete_is_resurrected() {
        let root = OctreeNode::leaf(NodeId::root(), Aabb::cube(Vec3::ZERO, 1.0));
        let shared = shared_with(StreamingConfig::default(), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        let handle = display.issue_handle(root.id(), 40);
        root.lock().seed(NodeStatus::ToDelete, Some(40), None, Some(handle));
        shared.to_delete.push(Arc::clone(&root));

        let report = traverse(&shared, &facing_origin(), &mut display).unwrap();

        assert_eq!(report.queued_for_load, 1);
        assert_eq!(root.status(), NodeStatus::ToLoad);
        assert_eq!(root.point_count(), Some(40));
        assert!(!root.has_handle());
        assert!(!display.is_live(handle));
        assert_eq!(display.destroyed(), &[NodeId::root()]);
    }

    #[test]
    fn test_teardown_cascades_to_loaded_descendants() {
        // r (0 points) -> r0 (300, rendered) -> r00 (100, rendered)
        //              -> r1 (200, admitted, not yet materialized)
        let bounds = Aabb::cube(Vec3::ZERO, 1.0);
        let r00 = OctreeNode::leaf(NodeId::root().child(0).child(0), bounds.child_octant(0).child_octant(0));
        let r0 = OctreeNode::new(NodeId::root().child(0), bounds.child_octant(0), vec![Arc::clone(&r00)]);
        let r1 = OctreeNode::leaf(NodeId::root().child(1), bounds.child_octant(1));
        let root = OctreeNode::new(NodeId::root(), bounds, vec![Arc::clone(&r0), Arc::clone(&r1)]);

        let shared = shared_with(StreamingConfig::with_budget(1000), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        let root_handle = display.issue_handle(root.id(), 0);
        root.lock().seed(NodeStatus::Rendered, Some(0), None, Some(root_handle));
        let r0_handle = display.issue_handle(r0.id(), 300);
        r0.lock().seed(NodeStatus::Rendered, Some(300), None, Some(r0_handle));
        r1.lock().seed(NodeStatus::ToRender, Some(200), Some(batch(200)), None);
        let r00_handle = display.issue_handle(r00.id(), 100);
        r00.lock().seed(NodeStatus::Rendered, Some(100), None, Some(r00_handle));
        shared.ledger.add(600);

        let report = traverse(&shared, &facing_away(), &mut display).unwrap();

        assert_eq!(report.visited, 1);
        assert_eq!(report.torn_down, 4);
        assert_eq!(shared.ledger.points(), 0);
        assert_eq!(display.live_count(), 0);
        let mut destroyed = display.destroyed().to_vec();
        destroyed.sort();
        assert_eq!(destroyed, vec![root.id().clone(), r0.id().clone(), r00.id().clone()]);
        for node in breadth_first([&root]) {
            assert_eq!(node.status(), NodeStatus::Invisible);
            assert!(!node.has_payload());
            assert!(!node.has_handle());
        }
        assert_eq!(shared.stats.snapshot().torn_down, 4);
    }

    #[test]
    fn test_teardown_skips_inactive_subtrees() {
        let root = unit_octree(2);
        let shared = shared_with(StreamingConfig::default(), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();

        // Only the root was ever requested
        root.lock().seed(NodeStatus::ToLoad, None, None, None);
        let changed = teardown(&shared, &root, &mut display).unwrap();

        assert_eq!(changed, 1);
        assert_eq!(root.status(), NodeStatus::Invisible);
    }

    #[test]
    fn test_shutdown_aborts_traversal() {
        let root = unit_octree(1);
        let shared = shared_with(StreamingConfig::default(), &[Arc::clone(&root)]);
        let mut display = HeadlessMaterializer::new();
        shared.signal_shutdown();

        let result = traverse(&shared, &facing_origin(), &mut display);
        assert!(matches!(result, Err(Error::ShutDown)));
        assert_eq!(shared.lock_queues().generation, 0);
    }
}
