//! Per-frame consumer
//!
//! Runs on the render thread. Each tick materializes a bounded number of
//! admitted nodes and destroys a bounded number of evicted nodes' handles;
//! whatever exceeds the caps waits for the next tick in FIFO order.

use crate::core::types::Result;
use crate::streaming::materialize::Materializer;
use crate::streaming::node::{NodeStatus, OctreeNode};
use crate::streaming::scheduler::Shared;

/// What one tick did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Nodes given a display handle
    pub materialized: usize,
    /// Display handles destroyed
    pub destroyed: usize,
    /// Entries dropped because the node had moved on
    pub stale: usize,
    /// Nodes demoted because materialization failed
    pub failed: usize,
}

pub(crate) fn tick(shared: &Shared, materializer: &mut dyn Materializer) -> Result<TickReport> {
    let mut report = TickReport::default();

    for _ in 0..shared.config.max_materialize_per_tick {
        let Some(node) = shared.to_render.pop() else {
            break;
        };
        materialize_node(shared, &node, materializer, &mut report)?;
    }

    for _ in 0..shared.config.max_destroy_per_tick {
        let Some(node) = shared.to_delete.pop() else {
            break;
        };
        destroy_node(shared, &node, materializer, &mut report)?;
    }

    if report != TickReport::default() {
        log::trace!(
            "Tick: {} materialized, {} destroyed, {} stale, {} failed",
            report.materialized,
            report.destroyed,
            report.stale,
            report.failed
        );
    }
    Ok(report)
}

fn materialize_node(
    shared: &Shared,
    node: &OctreeNode,
    materializer: &mut dyn Materializer,
    report: &mut TickReport,
) -> Result<()> {
    let id = node.id();
    let mut state = node.lock();
    if state.status() != NodeStatus::ToRender {
        shared.stats.stale();
        report.stale += 1;
        return Ok(());
    }

    let Some(points) = state.take_payload() else {
        log::error!("Node {} admitted without points, dropping it", id);
        let delta = state.transition(id, NodeStatus::Invisible)?;
        shared.ledger.apply(delta);
        report.failed += 1;
        return Ok(());
    };

    match materializer.materialize(id, points, &shared.config.render) {
        Ok(handle) => {
            state.set_handle(handle);
            state.transition(id, NodeStatus::Rendered)?;
            shared.stats.materialized();
            report.materialized += 1;
        }
        Err(e) => {
            log::warn!("Failed to materialize {}: {}", id, e);
            let delta = state.transition(id, NodeStatus::Invisible)?;
            shared.ledger.apply(delta);
            report.failed += 1;
        }
    }
    Ok(())
}

fn destroy_node(
    shared: &Shared,
    node: &OctreeNode,
    materializer: &mut dyn Materializer,
    report: &mut TickReport,
) -> Result<()> {
    let id = node.id();
    let mut state = node.lock();
    if state.status() != NodeStatus::ToDelete {
        shared.stats.stale();
        report.stale += 1;
        return Ok(());
    }

    if let Some(handle) = state.take_handle() {
        materializer.destroy(id, handle);
        shared.stats.destroyed();
    }
    state.discard_payload();
    let delta = state.transition(id, NodeStatus::Invisible)?;
    shared.ledger.apply(delta);
    report.destroyed += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::types::Vec3;
    use crate::math::Aabb;
    use crate::streaming::config::StreamingConfig;
    use crate::streaming::materialize::HeadlessMaterializer;
    use crate::streaming::node::NodeId;
    use crate::streaming::source::{MemoryPointSource, PointBatch, synthetic_points};

    fn shared(max_materialize: usize, max_destroy: usize) -> Shared {
        crate::core::logging::init_for_tests();
        let config = StreamingConfig {
            max_materialize_per_tick: max_materialize,
            max_destroy_per_tick: max_destroy,
            ..StreamingConfig::with_budget(10_000)
        };
        Shared::new(config, Arc::new(MemoryPointSource::new()))
    }

    fn batch(n: usize) -> PointBatch {
        synthetic_points(&Aabb::cube(Vec3::ZERO, 1.0), 0, n)
    }

    /// A node admitted by the loader and waiting in the render FIFO
    fn admitted(shared: &Shared, octant: u8, points: usize) -> Arc<OctreeNode> {
        let node = OctreeNode::leaf(NodeId::root().child(octant), Aabb::default());
        node.lock()
            .seed(NodeStatus::ToRender, Some(points as u64), Some(batch(points)), None);
        shared.ledger.add(points as u64);
        shared.to_render.push(Arc::clone(&node));
        node
    }

    #[test]
    fn test_materialize_cap_per_tick() {
        let shared = shared(2, 16);
        let mut display = HeadlessMaterializer::new();
        let nodes: Vec<_> = (0..5).map(|i| admitted(&shared, i, 10)).collect();

        let report = tick(&shared, &mut display).unwrap();
        assert_eq!(report.materialized, 2);
        assert_eq!(display.created(), &[nodes[0].id().clone(), nodes[1].id().clone()]);
        let remaining: Vec<_> = nodes[2..].iter().map(|n| n.id().clone()).collect();
        assert_eq!(shared.to_render.ids(), remaining);
        assert_eq!(nodes[2].status(), NodeStatus::ToRender);

        assert_eq!(tick(&shared, &mut display).unwrap().materialized, 2);
        assert_eq!(tick(&shared, &mut display).unwrap().materialized, 1);
        assert!(shared.to_render.is_empty());

        let order: Vec<_> = nodes.iter().map(|n| n.id().clone()).collect();
        assert_eq!(display.created(), order.as_slice());
        assert!(nodes.iter().all(|n| n.status() == NodeStatus::Rendered && n.has_handle() && !n.has_payload()));
        assert_eq!(shared.ledger.points(), 50);
    }

    #[test]
    fn test_stale_entries_count_towards_cap() {
        let shared = shared(2, 16);
        let mut display = HeadlessMaterializer::new();
        let gone = admitted(&shared, 0, 10);
        let fresh = admitted(&shared, 1, 10);
        // Torn down after admission
        gone.lock().seed(NodeStatus::Invisible, Some(10), None, None);
        shared.ledger.remove(10);

        let report = tick(&shared, &mut display).unwrap();

        assert_eq!(report.stale, 1);
        assert_eq!(report.materialized, 1);
        assert_eq!(fresh.status(), NodeStatus::Rendered);
        assert_eq!(gone.status(), NodeStatus::Invisible);
        assert_eq!(display.created(), &[fresh.id().clone()]);
    }

    #[test]
    fn test_delete_drain_destroys_handles() {
        let shared = shared(4, 1);
        let mut display = HeadlessMaterializer::new();

        let evicted: Vec<_> = (0..2)
            .map(|octant| {
                let node = OctreeNode::leaf(NodeId::root().child(octant), Aabb::default());
                let handle = display.issue_handle(node.id(), 20);
                node.lock().seed(NodeStatus::ToDelete, Some(20), None, Some(handle));
                shared.to_delete.push(Arc::clone(&node));
                node
            })
            .collect();

        let report = tick(&shared, &mut display).unwrap();
        assert_eq!(report.destroyed, 1);
        assert_eq!(evicted[0].status(), NodeStatus::Invisible);
        assert!(!evicted[0].has_handle());
        assert_eq!(evicted[1].status(), NodeStatus::ToDelete);
        assert_eq!(display.live_count(), 1);

        tick(&shared, &mut display).unwrap();
        assert_eq!(display.live_count(), 0);
        assert!(shared.to_delete.is_empty());
        assert_eq!(shared.stats.snapshot().destroyed, 2);
        assert_eq!(shared.ledger.points(), 0);
    }

    #[test]
    fn test_resurrected_delete_entry_is_stale() {
        let shared = shared(4, 4);
        let mut display = HeadlessMaterializer::new();
        let node = OctreeNode::leaf(NodeId::root(), Aabb::default());
        node.lock().seed(NodeStatus::ToLoad, Some(20), None, None);
        shared.to_delete.push(Arc::clone(&node));

        let report = tick(&shared, &mut display).unwrap();

        assert_eq!(report.stale, 1);
        assert_eq!(node.status(), NodeStatus::ToLoad);
        assert!(display.destroyed().is_empty());
    }

    #[test]
    fn test_failed_materialization_releases_budget() {
        let shared = shared(4, 4);
        let mut display = HeadlessMaterializer::new();
        let broken = admitted(&shared, 0, 70);
        let fine = admitted(&shared, 1, 30);
        display.fail_on(broken.id().clone());

        let report = tick(&shared, &mut display).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.materialized, 1);
        assert_eq!(broken.status(), NodeStatus::Invisible);
        assert!(!broken.has_handle());
        assert_eq!(fine.status(), NodeStatus::Rendered);
        assert_eq!(shared.ledger.points(), 30);
    }
}
