//! Errors raised by the transaction engine.

use std::io;

use thiserror::Error;

use crate::subcompositor::SubsurfaceError;
use crate::surface::SurfaceId;
use crate::transaction::TransactionId;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceId),

    #[error("transaction {0:?} is not pending")]
    UnknownTransaction(TransactionId),

    #[error("subsurface error: {0}")]
    Subsurface(#[from] SubsurfaceError),

    /// The reactor refused to watch a fence.
    #[error("fence reactor error: {0}")]
    Reactor(String),

    #[error("event loop error: {0}")]
    EventLoop(#[from] calloop::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
