//! Building and walking octree hierarchies

use std::collections::VecDeque;
use std::sync::Arc;

use crate::math::Aabb;
use crate::streaming::node::{NodeId, OctreeNode};

/// Breadth-first iterator over one or more hierarchies
pub struct BreadthFirst {
    queue: VecDeque<Arc<OctreeNode>>,
}

impl Iterator for BreadthFirst {
    type Item = Arc<OctreeNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.queue.pop_front()?;
        self.queue.extend(node.children().iter().cloned());
        Some(node)
    }
}

/// Walk every node below `roots`, level by level
pub fn breadth_first<'a>(roots: impl IntoIterator<Item = &'a Arc<OctreeNode>>) -> BreadthFirst {
    BreadthFirst {
        queue: roots.into_iter().cloned().collect(),
    }
}

/// Number of nodes in a full octree of the given depth (root only = depth 0)
pub fn full_octree_node_count(depth: u32) -> usize {
    (0..=depth).map(|level| 8usize.pow(level)).sum()
}

/// Builds regular octrees by recursive octant subdivision
#[derive(Clone, Debug)]
pub struct OctreeBuilder {
    bounds: Aabb,
    max_depth: u32,
    root_id: NodeId,
}

impl OctreeBuilder {
    pub fn new(bounds: Aabb, max_depth: u32) -> Self {
        Self {
            bounds,
            max_depth,
            root_id: NodeId::root(),
        }
    }

    /// Use `root_id` (see [`NodeId::root_named`]) as the root of the built
    /// hierarchy, so several hierarchies can share one point source.
    pub fn with_root(mut self, root_id: NodeId) -> Self {
        self.root_id = root_id;
        self
    }

    /// Build a full octree down to `max_depth`
    pub fn build(&self) -> Arc<OctreeNode> {
        self.build_where(|_, _| true)
    }

    /// Build a sparse octree: a node is subdivided when `subdivide` says so
    /// and `max_depth` has not been reached.
    pub fn build_where(&self, subdivide: impl Fn(&NodeId, &Aabb) -> bool) -> Arc<OctreeNode> {
        self.build_node(self.root_id.clone(), self.bounds, &subdivide)
    }

    fn build_node(
        &self,
        id: NodeId,
        bounds: Aabb,
        subdivide: &impl Fn(&NodeId, &Aabb) -> bool,
    ) -> Arc<OctreeNode> {
        let children = if id.level() < self.max_depth && subdivide(&id, &bounds) {
            (0..8u8)
                .map(|octant| self.build_node(id.child(octant), bounds.child_octant(octant), subdivide))
                .collect()
        } else {
            Vec::new()
        };
        OctreeNode::new(id, bounds, children)
    }
}
