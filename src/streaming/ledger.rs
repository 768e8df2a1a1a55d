//! Point budget accounting
//!
//! The ledger holds the number of points of every node that is either
//! materialized or admitted for materialization (`ToRender` or `Rendered`).
//! The loader is the only writer that increases it, and only after checking
//! [`PointLedger::fits`] under the queue lock.

use std::sync::{Mutex, PoisonError};

/// Shared counter of resident points against a fixed budget
#[derive(Debug)]
pub struct PointLedger {
    budget: u64,
    points: Mutex<u64>,
}

impl PointLedger {
    /// Create an empty ledger
    ///
    /// # Arguments
    /// * `budget` - Maximum number of resident points
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            points: Mutex::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Current number of resident points
    pub fn points(&self) -> u64 {
        *self.lock()
    }

    /// Whether `extra` more points would stay within the budget
    pub fn fits(&self, extra: u64) -> bool {
        self.points().saturating_add(extra) <= self.budget
    }

    pub fn add(&self, points: u64) {
        let mut total = self.lock();
        *total = total.saturating_add(points);
    }

    pub fn remove(&self, points: u64) {
        let mut total = self.lock();
        if points > *total {
            log::error!("Ledger underflow: removing {} points from {}", points, *total);
        }
        *total = total.saturating_sub(points);
    }

    /// Apply a signed delta returned by a node status transition
    pub fn apply(&self, delta: i64) {
        match delta {
            0 => {}
            d if d > 0 => self.add(d as u64),
            d => self.remove(d.unsigned_abs()),
        }
    }
}
