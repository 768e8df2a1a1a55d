//! Octree nodes and their load/render state machine
//!
//! A node's bounds, level and children never change after construction.
//! Everything that does change (status, point payload, display handle) sits
//! behind one per-node mutex so the traversal, loader and consumer always
//! observe the triplet consistently.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::Error;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::streaming::materialize::DisplayHandle;
use crate::streaming::source::PointBatch;

/// Position of a node in the hierarchy: `r` followed by one octant digit per level.
///
/// Roots of different hierarchies streamed together need distinct names;
/// a named root `tile_a` yields ids like `tile_a.r05`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Identifier of an unnamed hierarchy root
    pub fn root() -> Self {
        Self("r".to_string())
    }

    /// Identifier of a hierarchy root in the namespace `name`.
    ///
    /// The name must be non-empty ASCII alphanumerics, `_` or `-`, so ids
    /// stay usable as file names.
    pub fn root_named(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(Error::InvalidRootName(name.to_string()));
        }
        Ok(Self(format!("{name}.r")))
    }

    /// Identifier of the child in `octant` (0-7)
    pub fn child(&self, octant: u8) -> Self {
        debug_assert!(octant < 8, "octant out of range: {octant}");
        Self(format!("{}{}", self.0, octant))
    }

    /// Depth below the root (root = 0)
    pub fn level(&self) -> u32 {
        let path = self.0.split_once('.').map_or(self.0.as_str(), |(_, path)| path);
        (path.len() - 1) as u32
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Load/render status of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Not wanted; holds no payload and no handle
    #[default]
    Invisible,
    /// Visible and waiting in the to-load queue
    ToLoad,
    /// Dequeued by the loader, points being fetched or admitted
    Loading,
    /// Admitted into the budget, waiting for the consumer to materialize it
    ToRender,
    /// Materialized with a live display handle
    Rendered,
    /// Evicted; its display handle is waiting for the consumer to destroy it
    ToDelete,
}

impl NodeStatus {
    /// Whether the node's points are counted by the ledger
    pub fn is_resident(self) -> bool {
        matches!(self, NodeStatus::ToRender | NodeStatus::Rendered)
    }

    /// Whether the node has been requested or loaded at all.
    /// A teardown sweep descends into children of active nodes.
    pub fn is_active(self) -> bool {
        self != NodeStatus::Invisible
    }

    /// The legal edges of the state machine.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;

        match (self, next) {
            // Teardown may reset any node
            (_, Invisible) => true,
            // Traversal: becoming (or staying) visible, or resurrecting a pending delete
            (Invisible | ToLoad | ToDelete, ToLoad) => true,
            (ToLoad, Loading) => true,
            // Loader: admission, with or without a surviving handle, or rejection with a handle
            (Loading, ToRender | Rendered | ToDelete) => true,
            // Consumer materialization
            (ToRender, Rendered) => true,
            // Loader eviction
            (ToRender | Rendered, ToDelete) => true,
            _ => false,
        }
    }
}

/// The mutable part of a node, guarded by the node's lock.
#[derive(Debug, Default)]
pub struct NodeState {
    status: NodeStatus,
    point_count: Option<u64>,
    payload: Option<PointBatch>,
    handle: Option<DisplayHandle>,
}

impl NodeState {
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Number of points, known once the node has been loaded at least once
    pub fn point_count(&self) -> Option<u64> {
        self.point_count
    }

    /// Points this node contributes to the ledger while resident
    pub fn resident_points(&self) -> u64 {
        self.point_count.unwrap_or(0)
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Store freshly loaded points. The point count is fixed by the first load.
    pub fn store_payload(&mut self, id: &NodeId, batch: PointBatch) {
        let count = batch.len() as u64;
        match self.point_count {
            None => self.point_count = Some(count),
            Some(known) if known != count => {
                log::warn!("Node {id} reloaded with {count} points, keeping original count {known}");
            }
            Some(_) => {}
        }
        self.payload = Some(batch);
    }

    /// Hand the payload over, e.g. to the materializer
    pub fn take_payload(&mut self) -> Option<PointBatch> {
        self.payload.take()
    }

    /// Drop the payload without touching the display handle
    pub fn discard_payload(&mut self) {
        self.payload = None;
    }

    pub fn set_handle(&mut self, handle: DisplayHandle) {
        debug_assert!(self.handle.is_none(), "node already holds a display handle");
        self.handle = Some(handle);
    }

    pub fn take_handle(&mut self) -> Option<DisplayHandle> {
        self.handle.take()
    }

    /// Move to `next`, returning the signed change in resident points.
    ///
    /// The caller must apply the delta to the ledger before releasing this
    /// node's lock.
    pub fn transition(&mut self, id: &NodeId, next: NodeStatus) -> Result<i64> {
        let prev = self.status;
        if !prev.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                node: id.clone(),
                from: prev,
                to: next,
            });
        }
        self.status = next;

        let points = self.resident_points() as i64;
        Ok(match (prev.is_resident(), next.is_resident()) {
            (false, true) => points,
            (true, false) => -points,
            _ => 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn seed(
        &mut self,
        status: NodeStatus,
        point_count: Option<u64>,
        payload: Option<PointBatch>,
        handle: Option<DisplayHandle>,
    ) {
        self.status = status;
        self.point_count = point_count;
        self.payload = payload;
        self.handle = handle;
    }
}

/// Scoped access to a node's mutable state
pub type NodeGuard<'a> = MutexGuard<'a, NodeState>;

/// One node of the spatial hierarchy.
#[derive(Debug)]
pub struct OctreeNode {
    id: NodeId,
    bounds: Aabb,
    level: u32,
    children: Vec<Arc<OctreeNode>>,
    state: Mutex<NodeState>,
}

impl OctreeNode {
    /// Create a node owning `children`
    pub fn new(id: NodeId, bounds: Aabb, children: Vec<Arc<OctreeNode>>) -> Arc<Self> {
        let level = id.level();
        Arc::new(Self {
            id,
            bounds,
            level,
            children,
            state: Mutex::new(NodeState::default()),
        })
    }

    /// Create a node without children
    pub fn leaf(id: NodeId, bounds: Aabb) -> Arc<Self> {
        Self::new(id, bounds, Vec::new())
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn children(&self) -> &[Arc<OctreeNode>] {
        &self.children
    }

    /// Acquire this node's lock.
    ///
    /// A poisoned lock is recovered: after a panic the streamer is unusable
    /// anyway and callers only need the data.
    pub fn lock(&self) -> NodeGuard<'_> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> NodeStatus {
        self.lock().status()
    }

    pub fn point_count(&self) -> Option<u64> {
        self.lock().point_count()
    }

    pub fn has_handle(&self) -> bool {
        self.lock().has_handle()
    }

    pub fn has_payload(&self) -> bool {
        self.lock().has_payload()
    }

    pub fn discard_payload(&self) {
        self.lock().discard_payload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::Point;
    use NodeStatus::*;

    fn batch(n: usize) -> PointBatch {
        PointBatch::new(vec![Point::default(); n])
    }

    #[test]
    fn test_node_id_paths() {
        let root = NodeId::root();
        let child = root.child(3).child(7);
        assert_eq!(child.as_str(), "r37");
        assert_eq!(child.level(), 2);
        assert_eq!(root.level(), 0);
        assert_eq!(child.to_string(), "r37");
    }

    #[test]
    fn test_named_roots_are_distinct() {
        let a = NodeId::root_named("tile_a").unwrap();
        let b = NodeId::root_named("tile-b").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, NodeId::root());
        assert_ne!(a.child(3), b.child(3));

        let child = a.child(0).child(5);
        assert_eq!(child.as_str(), "tile_a.r05");
        assert_eq!(child.level(), 2);
        assert_eq!(a.level(), 0);
        assert_eq!(NodeId::root().child(0).child(5).level(), 2);
    }

    #[test]
    fn test_invalid_root_names_rejected() {
        for name in ["", "a.b", "tile/0", "naïve"] {
            assert!(
                matches!(NodeId::root_named(name), Err(Error::InvalidRootName(_))),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(Invisible.can_transition_to(ToLoad));
        assert!(ToDelete.can_transition_to(ToLoad));
        assert!(ToLoad.can_transition_to(Loading));
        assert!(Loading.can_transition_to(ToRender));
        assert!(Loading.can_transition_to(Rendered));
        assert!(ToRender.can_transition_to(Rendered));
        assert!(Rendered.can_transition_to(ToDelete));
        assert!(Rendered.can_transition_to(Invisible));

        assert!(!Invisible.can_transition_to(Loading));
        assert!(!Invisible.can_transition_to(Rendered));
        assert!(!ToLoad.can_transition_to(ToRender));
        assert!(!Rendered.can_transition_to(ToLoad));
        assert!(!ToDelete.can_transition_to(Rendered));
        assert!(!Loading.can_transition_to(ToLoad));
    }

    #[test]
    fn test_transition_reports_ledger_delta() {
        let id = NodeId::root();
        let mut state = NodeState::default();

        assert_eq!(state.transition(&id, ToLoad).unwrap(), 0);
        assert_eq!(state.transition(&id, Loading).unwrap(), 0);
        state.store_payload(&id, batch(120));
        assert_eq!(state.transition(&id, ToRender).unwrap(), 120);
        assert_eq!(state.transition(&id, Rendered).unwrap(), 0);
        assert_eq!(state.transition(&id, ToDelete).unwrap(), -120);
        assert_eq!(state.transition(&id, Invisible).unwrap(), 0);
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let id = NodeId::root();
        let mut state = NodeState::default();

        let err = state.transition(&id, Rendered).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { from: Invisible, to: Rendered, .. }));
        assert_eq!(state.status(), Invisible);
    }

    #[test]
    fn test_point_count_fixed_by_first_load() {
        let id = NodeId::root();
        let mut state = NodeState::default();
        assert_eq!(state.point_count(), None);

        state.store_payload(&id, batch(10));
        state.discard_payload();
        state.store_payload(&id, batch(12));

        assert_eq!(state.point_count(), Some(10));
        assert!(state.has_payload());
    }

    #[test]
    fn test_node_queries() {
        let node = OctreeNode::leaf(NodeId::root().child(1), Aabb::default());
        assert_eq!(node.level(), 1);
        assert_eq!(node.status(), Invisible);
        assert!(!node.has_handle());

        node.lock().store_payload(node.id(), batch(4));
        assert!(node.has_payload());
        assert_eq!(node.point_count(), Some(4));

        node.discard_payload();
        assert!(!node.has_payload());
        assert_eq!(node.point_count(), Some(4));
    }
}
