//! Point data and the sources the loader fetches it from
//!
//! On disk a node's points are a tightly packed array of [`Point`] records,
//! LZ4 compressed with the uncompressed size prepended. One file per node,
//! named after the node id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::core::Error;
use crate::core::types::{Result, Vec3};
use crate::math::Aabb;
use crate::streaming::hierarchy::breadth_first;
use crate::streaming::node::{NodeId, OctreeNode};

/// File extension of per-node point files
pub const POINT_FILE_EXTENSION: &str = "pts";

/// A single point as stored and handed to the materializer
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Point {
    pub position: [f32; 3],
    pub color: [u8; 4],
}

impl Point {
    pub fn new(position: Vec3, color: [u8; 4]) -> Self {
        Self {
            position: position.to_array(),
            color,
        }
    }
}

/// All points of one node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointBatch {
    points: Vec<Point>,
}

impl PointBatch {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Size of the uncompressed point records in bytes
    pub fn byte_size(&self) -> usize {
        std::mem::size_of_val(self.points.as_slice())
    }
}

/// Synchronous provider of point data, called from the loader thread.
///
/// Implementations may block for as long as the underlying storage needs.
pub trait PointSource: Send + Sync {
    fn load_points(&self, id: &NodeId, bounds: &Aabb) -> Result<PointBatch>;
}

/// Compress a batch into the on-disk representation
pub fn encode_points(batch: &PointBatch) -> Vec<u8> {
    lz4_flex::compress_prepend_size(bytemuck::cast_slice(batch.points()))
}

/// Decompress and decode the on-disk representation
pub fn decode_points(data: &[u8]) -> Result<PointBatch> {
    let bytes = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Decode(format!("LZ4 decompression failed: {e}")))?;

    let stride = std::mem::size_of::<Point>();
    if bytes.len() % stride != 0 {
        return Err(Error::Decode(format!(
            "{} bytes is not a whole number of {stride}-byte points",
            bytes.len()
        )));
    }

    // The decompressed buffer carries no alignment guarantee
    let points = bytes
        .chunks_exact(stride)
        .map(bytemuck::pod_read_unaligned::<Point>)
        .collect();
    Ok(PointBatch::new(points))
}

/// Path of a node's point file below `dir`
pub fn point_file_path(dir: &Path, id: &NodeId) -> PathBuf {
    dir.join(format!("{id}.{POINT_FILE_EXTENSION}"))
}

/// Write a node's points to `dir`, creating the directory if needed
pub fn save_points(dir: &Path, id: &NodeId, batch: &PointBatch) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(point_file_path(dir, id), encode_points(batch))?;
    Ok(())
}

/// Reads per-node point files from a directory
#[derive(Clone, Debug)]
pub struct FilePointSource {
    dir: PathBuf,
}

impl FilePointSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PointSource for FilePointSource {
    fn load_points(&self, id: &NodeId, _bounds: &Aabb) -> Result<PointBatch> {
        let path = point_file_path(&self.dir, id);
        let data = std::fs::read(&path)?;
        let batch = decode_points(&data)?;
        log::trace!("Read {} points for {} from {}", batch.len(), id, path.display());
        Ok(batch)
    }
}

/// Point source backed by in-memory batches, with optional simulated latency
#[derive(Debug, Default)]
pub struct MemoryPointSource {
    batches: HashMap<NodeId, PointBatch>,
    latency: Option<Duration>,
    loads: AtomicUsize,
}

impl MemoryPointSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every load, to mimic slow storage
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&mut self, id: NodeId, batch: PointBatch) {
        self.batches.insert(id, batch);
    }

    /// Generate `count(node)` points inside every node of the hierarchy
    pub fn populate(&mut self, root: &std::sync::Arc<OctreeNode>, count: impl Fn(&OctreeNode) -> usize) {
        for node in breadth_first([root]) {
            let batch = synthetic_points(node.bounds(), node.level(), count(&node));
            self.insert(node.id().clone(), batch);
        }
    }

    /// Number of completed `load_points` calls
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl PointSource for MemoryPointSource {
    fn load_points(&self, id: &NodeId, _bounds: &Aabb) -> Result<PointBatch> {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        let batch = self.batches.get(id).cloned().ok_or_else(|| Error::Load {
            node: id.clone(),
            reason: "no points registered".to_string(),
        })?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(batch)
    }
}

/// Deterministic, evenly spread points inside `bounds`, colored by level
pub fn synthetic_points(bounds: &Aabb, level: u32, count: usize) -> PointBatch {
    // Additive recurrence on the plastic-number generalisation of the golden ratio
    const A1: f32 = 0.819_172_5;
    const A2: f32 = 0.671_043_5;
    const A3: f32 = 0.549_700_5;

    let shade = (255 - (level * 40).min(200)) as u8;
    let points = (0..count)
        .map(|i| {
            let i = i as f32 + 0.5;
            let f = Vec3::new((i * A1).fract(), (i * A2).fract(), (i * A3).fract());
            Point::new(bounds.min + f * bounds.size(), [shade, shade, 255, 255])
        })
        .collect();
    PointBatch::new(points)
}
