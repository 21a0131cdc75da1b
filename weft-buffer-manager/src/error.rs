use thiserror::Error;

use crate::buffer::BufferFormat;

/// Errors raised while registering or importing buffers.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Buffer dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Stride {stride} is too small for a {width} pixel wide {format:?} buffer")]
    InvalidStride {
        stride: u32,
        width: u32,
        format: BufferFormat,
    },

    #[error("DMA-BUF import requires at least one plane")]
    NoPlanes,

    #[error("DMA-BUF has {0} planes, at most 4 are supported")]
    TooManyPlanes(usize),
}
