//! # Weft Buffer Manager
//!
//! This crate provides the buffer objects that surfaces reference while their
//! state is pending, in flight, or on screen. It handles buffer registration,
//! reference counting through [`BufferRef`] handles, and the DMA-BUF plane
//! descriptors whose implicit fences tell the compositor when the hardware is
//! done with a buffer's memory.
//!
//! A buffer lives exactly as long as its longest holder. Interested parties can
//! hook its destruction with [`Buffer::add_destruction_hook`], which is how the
//! transaction engine keeps per-buffer bookkeeping from outliving the buffer.

pub mod buffer;
pub mod dmabuf;
pub mod error;

// Re-export key types for convenience.
pub use buffer::{Buffer, BufferFormat, BufferId, BufferManager, BufferRef, BufferType, ClientId};
pub use dmabuf::{DmabufAttributes, DmabufPlane, FdFence, PlaneFence, MAX_PLANES};
pub use error::BufferError;
