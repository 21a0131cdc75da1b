//! Event-loop seam for fence readiness.
//!
//! Readiness lockers never poll in a loop. They ask a [`FenceReactor`] for one
//! watch per DMA-BUF plane and switch it on while they wait for the plane to
//! go idle. When the fence signals, the host routes the watch's [`PlaneKey`]
//! back to [`TransactionEngine::plane_ready`](crate::transaction::engine::TransactionEngine::plane_ready).

use std::fmt;

use weft_buffer_manager::{BufferId, PlaneFence};

use crate::error::TransactionError;

pub mod event_loop;
pub mod manual;

pub use event_loop::{install_stall_watchdog, CalloopReactor, CalloopWatch, TransactionHandler};
pub use manual::{ManualReactor, ManualWatch};

/// Identifies one plane of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneKey {
    pub buffer: BufferId,
    pub plane: usize,
}

impl fmt::Display for PlaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} plane {}", self.buffer, self.plane)
    }
}

/// A registered readiness watch. Dropping it unregisters it.
pub trait FenceWatch {
    /// Starts or stops delivering readiness for the watched fence.
    fn set_enabled(&mut self, enabled: bool);
}

/// Creates readiness watches on plane fences.
pub trait FenceReactor {
    type Watch: FenceWatch + 'static;

    /// Registers a watch for `fence`, initially disabled.
    fn watch(&mut self, key: PlaneKey, fence: &dyn PlaneFence) -> Result<Self::Watch, TransactionError>;
}
