//! Octree point-cloud streaming under a fixed point budget

pub mod core;
pub mod math;
pub mod streaming;
