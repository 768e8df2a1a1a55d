//! Display-side collaborator: turns loaded points into something visible

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::Error;
use crate::core::types::Result;
use crate::streaming::node::NodeId;
use crate::streaming::source::PointBatch;

/// Opaque handle to whatever the display layer created for a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisplayHandle(pub u64);

/// How nodes are colored when materialized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Rgb,
    Elevation,
    Level,
}

/// Rendering configuration passed to every materialization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Point sprite size in pixels
    pub point_size: f32,
    pub color_mode: ColorMode,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            point_size: 2.0,
            color_mode: ColorMode::Rgb,
        }
    }
}

/// Creates and destroys display handles.
///
/// Only ever called from the render thread, so implementations may own
/// thread-affine resources.
pub trait Materializer {
    /// Create a display handle for `points`; the payload is consumed
    fn materialize(&mut self, id: &NodeId, points: PointBatch, config: &RenderConfig) -> Result<DisplayHandle>;

    /// Release a handle previously returned by `materialize`
    fn destroy(&mut self, id: &NodeId, handle: DisplayHandle);
}

/// Materializer without a display: keeps track of live handles only.
///
/// Useful for headless runs, benchmarks and tests.
#[derive(Debug, Default)]
pub struct HeadlessMaterializer {
    next_handle: u64,
    live: HashMap<DisplayHandle, (NodeId, usize)>,
    created: Vec<NodeId>,
    destroyed: Vec<NodeId>,
    failing: HashSet<NodeId>,
}

impl HeadlessMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every materialization of `id` fail
    pub fn fail_on(&mut self, id: NodeId) {
        self.failing.insert(id);
    }

    /// Hand out a handle as if `id` had been materialized with `points` points
    pub fn issue_handle(&mut self, id: &NodeId, points: usize) -> DisplayHandle {
        self.next_handle += 1;
        let handle = DisplayHandle(self.next_handle);
        self.live.insert(handle, (id.clone(), points));
        handle
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Points held by all live handles
    pub fn live_points(&self) -> usize {
        self.live.values().map(|(_, points)| points).sum()
    }

    pub fn is_live(&self, handle: DisplayHandle) -> bool {
        self.live.contains_key(&handle)
    }

    /// Nodes materialized so far, in order
    pub fn created(&self) -> &[NodeId] {
        &self.created
    }

    /// Nodes whose handle was destroyed so far, in order
    pub fn destroyed(&self) -> &[NodeId] {
        &self.destroyed
    }
}

impl Materializer for HeadlessMaterializer {
    fn materialize(&mut self, id: &NodeId, points: PointBatch, _config: &RenderConfig) -> Result<DisplayHandle> {
        if self.failing.contains(id) {
            return Err(Error::Materialize {
                node: id.clone(),
                reason: "rejected by headless materializer".to_string(),
            });
        }
        self.created.push(id.clone());
        Ok(self.issue_handle(id, points.len()))
    }

    fn destroy(&mut self, id: &NodeId, handle: DisplayHandle) {
        if self.live.remove(&handle).is_none() {
            log::warn!("Destroying unknown display handle {handle:?} for {id}");
        }
        self.destroyed.push(id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::Point;

    #[test]
    fn test_headless_tracks_live_handles() {
        let mut display = HeadlessMaterializer::new();
        let id = NodeId::root();
        let config = RenderConfig::default();

        let handle = display
            .materialize(&id, PointBatch::new(vec![Point::default(); 7]), &config)
            .unwrap();
        assert!(display.is_live(handle));
        assert_eq!(display.live_points(), 7);

        display.destroy(&id, handle);
        assert_eq!(display.live_count(), 0);
        assert_eq!(display.created(), &[id.clone()]);
        assert_eq!(display.destroyed(), &[id]);
    }

    #[test]
    fn test_headless_failure() {
        let mut display = HeadlessMaterializer::new();
        let id = NodeId::root().child(2);
        display.fail_on(id.clone());

        let err = display
            .materialize(&id, PointBatch::default(), &RenderConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Materialize { .. }));
        assert_eq!(display.live_count(), 0);
    }

    #[test]
    fn test_render_config_json() {
        let config: RenderConfig = serde_json::from_str(r#"{"color_mode":"level"}"#).unwrap();
        assert_eq!(config.color_mode, ColorMode::Level);
        assert_eq!(config.point_size, 2.0);
    }
}
