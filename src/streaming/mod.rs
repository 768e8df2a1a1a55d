//! Budgeted streaming of octree point clouds

pub mod node;
pub mod hierarchy;
pub mod source;
pub mod materialize;
pub mod priority;
pub mod ledger;
pub mod config;
pub mod stats;
pub mod traversal;
mod loader;
pub mod consumer;
pub mod scheduler;

pub use node::{NodeId, NodeStatus, NodeState, NodeGuard, OctreeNode};
pub use hierarchy::{BreadthFirst, OctreeBuilder, breadth_first, full_octree_node_count};
pub use source::{
    Point, PointBatch, PointSource,
    FilePointSource, MemoryPointSource,
    encode_points, decode_points, save_points,
    point_file_path, synthetic_points, POINT_FILE_EXTENSION,
};
pub use materialize::{DisplayHandle, Materializer, HeadlessMaterializer, RenderConfig, ColorMode};
pub use priority::{Prioritized, LoadQueue, EvictionQueue, WorkFifo};
pub use ledger::PointLedger;
pub use config::StreamingConfig;
pub use stats::StreamingStats;
pub use traversal::TraversalReport;
pub use consumer::TickReport;
pub use scheduler::PointStreamer;
