//! # Weft Compositor Core
//!
//! The surface-commit transaction engine of the Weft Wayland compositor.
//! It includes:
//! - Surfaces (`wl_surface`): pending and current state, and the double-buffered
//!   attributes a commit carries.
//! - Subsurfaces (`wl_subsurface`): the parent/child tree and synchronized commits.
//! - Transactions: atomic, per-surface FIFO application of committed state,
//!   held back until newly attached DMA-BUFs are idle.
//! - Fence reactors: the event-loop seam the engine uses to wait on DMA-BUF
//!   implicit fences, with a calloop implementation.
//!
//! The engine is single-threaded. Protocol handling feeds it pending state and
//! commits; rendering reads the current state of each surface.

pub mod config;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod region;
pub mod subcompositor;
pub mod surface;
pub mod transaction;

pub use config::{ConfigError, TransactionConfig};
pub use error::TransactionError;
pub use reactor::{CalloopReactor, FenceReactor, FenceWatch, ManualReactor, PlaneKey, TransactionHandler};
pub use surface::{OutputTransform, StateFields, Surface, SurfaceId, SurfaceState};
pub use transaction::engine::{CommitOutcome, StalledTransaction, SurfaceCommit, TransactionEngine};
pub use transaction::{Transaction, TransactionId, TransactionListener};
