//! Point streamer: the public face of the streaming subsystem
//!
//! Ties together the visibility traversal, the budgeted loader thread and
//! the per-frame consumer around one set of shared queues.
//!
//! # Threads
//!
//! ```text
//! render thread                          loader thread
//! ┌──────────────────┐  to-load/loaded   ┌──────────────────┐
//! │ traverse()       │──── (swapped) ───►│ BudgetedLoader   │
//! │  - classify      │                   │  - admit / evict │
//! │  - teardown      │◄── to-render ─────│  - fetch points  │
//! │ tick()           │◄── to-delete ─────│                  │
//! └──────────────────┘                   └──────────────────┘
//! ```
//!
//! Lock order is queue lock, then one node lock, then the ledger lock.
//! The work FIFOs have leaf locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::core::Error;
use crate::core::camera::ViewState;
use crate::core::types::Result;
use crate::streaming::config::StreamingConfig;
use crate::streaming::consumer::{self, TickReport};
use crate::streaming::hierarchy::breadth_first;
use crate::streaming::ledger::PointLedger;
use crate::streaming::loader::BudgetedLoader;
use crate::streaming::materialize::{Materializer, RenderConfig};
use crate::streaming::node::{NodeId, NodeStatus, OctreeNode};
use crate::streaming::priority::{EvictionQueue, LoadQueue, WorkFifo};
use crate::streaming::source::PointSource;
use crate::streaming::stats::{StatCounters, StreamingStats};
use crate::streaming::traversal::{self, TraversalReport};

/// The to-load and already-loaded queues, always replaced together
#[derive(Debug, Default)]
pub(crate) struct LoadQueues {
    pub(crate) to_load: LoadQueue,
    pub(crate) loaded: EvictionQueue,
    /// Bumped on every traversal swap
    pub(crate) generation: u64,
}

impl LoadQueues {
    pub(crate) fn replace(&mut self, to_load: LoadQueue, loaded: EvictionQueue) {
        self.to_load = to_load;
        self.loaded = loaded;
        self.generation += 1;
    }
}

/// State shared by the render thread and the loader thread
pub(crate) struct Shared {
    pub(crate) config: StreamingConfig,
    pub(crate) source: Arc<dyn PointSource>,
    pub(crate) roots: Mutex<Vec<Arc<OctreeNode>>>,
    pub(crate) queues: Mutex<LoadQueues>,
    /// Signalled when a traversal installs a non-empty to-load queue, and on shutdown
    pub(crate) queue_ready: Condvar,
    pub(crate) ledger: PointLedger,
    pub(crate) to_render: WorkFifo,
    pub(crate) to_delete: WorkFifo,
    pub(crate) shutdown: AtomicBool,
    pub(crate) loading: AtomicBool,
    pub(crate) stats: StatCounters,
}

impl Shared {
    pub(crate) fn new(config: StreamingConfig, source: Arc<dyn PointSource>) -> Self {
        Self {
            ledger: PointLedger::new(config.point_budget),
            config,
            source,
            roots: Mutex::new(Vec::new()),
            queues: Mutex::new(LoadQueues::default()),
            queue_ready: Condvar::new(),
            to_render: WorkFifo::new(),
            to_delete: WorkFifo::new(),
            shutdown: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    pub(crate) fn lock_queues(&self) -> MutexGuard<'_, LoadQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn roots(&self) -> Vec<Arc<OctreeNode>> {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Taking the queue lock orders the flag before a waiting loader re-checks it
        let _queues = self.lock_queues();
        self.queue_ready.notify_all();
    }
}

/// Clears the loading flag when the loader thread exits, even by panic
struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Streams an octree point cloud into a fixed point budget.
///
/// `traverse` and `tick` must be called from the thread that owns the
/// materializer. The loader runs on its own thread once started.
pub struct PointStreamer {
    shared: Arc<Shared>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl PointStreamer {
    /// Create a streamer; the loader is not started yet
    pub fn new(config: StreamingConfig, source: Arc<dyn PointSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config, source)),
            loader: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    pub fn render_config(&self) -> &RenderConfig {
        &self.shared.config.render
    }

    /// Register the root of a hierarchy to stream.
    ///
    /// Node ids key the point source, so every root needs its own id; give
    /// hierarchies distinct names with [`NodeId::root_named`].
    pub fn add_root(&self, root: Arc<OctreeNode>) -> Result<()> {
        if self.shared.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let mut roots = self.shared.roots.lock().unwrap_or_else(PoisonError::into_inner);
        if roots.iter().any(|r| r.id() == root.id()) {
            return Err(Error::DuplicateRoot(root.id().clone()));
        }
        log::debug!("Registered root {} ({:?})", root.id(), root.bounds());
        roots.push(root);
        Ok(())
    }

    pub fn root_count(&self) -> usize {
        self.shared.roots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the loader thread is running
    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::Acquire)
    }

    /// Re-evaluate visibility of the whole hierarchy and replace the load queues.
    ///
    /// Safe to call while the loader is running. Nodes that fall out of view
    /// are torn down and their handles destroyed through `materializer`.
    pub fn traverse(&self, view: &ViewState, materializer: &mut dyn Materializer) -> Result<TraversalReport> {
        if self.shared.is_shut_down() {
            return Err(Error::ShutDown);
        }
        traversal::traverse(&self.shared, view, materializer)
    }

    /// Spawn the background loader thread
    pub fn start_loader(&self) -> Result<()> {
        if self.shared.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let mut slot = self.loader.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::LoaderAlreadyStarted);
        }

        self.shared.loading.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("point-loader".to_string())
            .spawn(move || {
                let _flag = LoadingFlag(&shared.loading);
                log::info!("Point loader started (budget: {} points)", shared.ledger.budget());
                match BudgetedLoader::new(&shared).run() {
                    Ok(()) => log::info!("Point loader stopped"),
                    Err(e) => log::error!("Point loader terminated: {}", e),
                }
            });

        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.loading.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Materialize and destroy a bounded number of nodes. Call once per frame.
    pub fn tick(&self, materializer: &mut dyn Materializer) -> Result<TickReport> {
        if self.shared.is_shut_down() {
            return Err(Error::ShutDown);
        }
        consumer::tick(&self.shared, materializer)
    }

    /// Stop the loader and refuse further calls.
    ///
    /// Blocks until the loader thread has finished its current step.
    pub fn shutdown(&self) {
        self.shared.signal_shutdown();

        let handle = self.loader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Point loader thread panicked");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Whether the consumer still has nodes to materialize or destroy
    pub fn has_pending_work(&self) -> bool {
        !self.shared.to_render.is_empty() || !self.shared.to_delete.is_empty()
    }

    pub fn pending_render(&self) -> usize {
        self.shared.to_render.len()
    }

    pub fn pending_delete(&self) -> usize {
        self.shared.to_delete.len()
    }

    /// Points currently admitted (`ToRender` or `Rendered`)
    pub fn ledger_points(&self) -> u64 {
        self.shared.ledger.points()
    }

    pub fn point_budget(&self) -> u64 {
        self.shared.ledger.budget()
    }

    pub fn stats(&self) -> StreamingStats {
        self.shared.stats.snapshot()
    }

    /// Current to-load queue, most urgent first
    pub fn queued_for_load(&self) -> Vec<(NodeId, f32)> {
        self.shared.lock_queues().to_load.snapshot()
    }

    /// Current eviction candidates, least urgent first
    pub fn eviction_candidates(&self) -> Vec<(NodeId, f32)> {
        self.shared.lock_queues().loaded.snapshot()
    }

    /// Status of every node below the registered roots, breadth-first
    pub fn node_statuses(&self) -> Vec<(NodeId, NodeStatus)> {
        let roots = self.shared.roots();
        breadth_first(&roots)
            .map(|node| (node.id().clone(), node.status()))
            .collect()
    }

    /// Check the ledger against the hierarchy.
    ///
    /// Only meaningful at a quiescent point (no traversal, tick or loader step
    /// in flight). On a mismatch or a node holding a display handle while
    /// `Invisible`/`ToLoad`, the streamer is shut down and the discrepancy
    /// returned. Returns the ledger value otherwise.
    pub fn audit_ledger(&self) -> Result<u64> {
        let roots = self.shared.roots();
        let mut expected = 0u64;

        for node in breadth_first(&roots) {
            let state = node.lock();
            let status = state.status();
            if state.has_handle() && matches!(status, NodeStatus::Invisible | NodeStatus::ToLoad) {
                drop(state);
                log::error!("Node {} holds a display handle while {:?}", node.id(), status);
                self.shutdown();
                return Err(Error::InvariantViolation {
                    node: node.id().clone(),
                    status,
                    context: "display handle on a node that is not displayed",
                });
            }
            if status.is_resident() {
                expected += state.resident_points();
            }
        }

        let actual = self.shared.ledger.points();
        if expected != actual {
            log::error!("Ledger audit failed: expected {} points, ledger holds {}", expected, actual);
            self.shutdown();
            return Err(Error::LedgerMismatch { expected, actual });
        }
        Ok(actual)
    }
}

impl Drop for PointStreamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
