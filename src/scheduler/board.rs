use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::ContainerEngine;

/// A worker node with its own container engine.
///
/// A board is the unit of exclusive compute: at most one running job holds it
/// at a time. Occupancy is decided by the grid that owns the board; jobs only
/// ever release it.
pub struct Board {
    pub hostname: String,
    pub address: String,
    engine: Arc<dyn ContainerEngine>,
    used: AtomicBool,
}

impl Board {
    pub fn new(
        hostname: impl Into<String>,
        address: impl Into<String>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            engine,
            used: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Claim the board. Returns false if it is already in use.
    pub fn try_use(&self) -> bool {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear occupancy. Releasing a free board is a no-op.
    pub fn release(&self) {
        if !self.used.swap(false, Ordering::AcqRel) {
            tracing::debug!(board = %self.hostname, "Board already released");
        }
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("hostname", &self.hostname)
            .field("address", &self.address)
            .field("used", &self.is_used())
            .finish()
    }
}
