//! DMA-BUF plane descriptors and their implicit fences.
//!
//! A DMA-BUF file descriptor doubles as an implicit synchronization fence: it
//! polls readable once every outstanding hardware write to that plane has
//! completed. The compositor uses this to hold back a new buffer until the GPU
//! has finished rendering into it.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::error::BufferError;

/// Maximum number of memory planes a DMA-BUF may carry.
pub const MAX_PLANES: usize = 4;

/// Something that can tell whether the hardware is done with a plane.
///
/// `as_fd` exposes a pollable descriptor so an event loop can be asked to
/// report when the fence signals. Fences without one can still be queried with
/// `is_idle` but cannot be waited on asynchronously.
pub trait PlaneFence: fmt::Debug {
    /// Returns `true` if no hardware operation is pending on the plane.
    fn is_idle(&self) -> bool;

    /// Descriptor that polls readable once the fence signals.
    fn as_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// The implicit fence carried by a DMA-BUF plane file descriptor.
#[derive(Debug)]
pub struct FdFence {
    fd: OwnedFd,
}

impl FdFence {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl PlaneFence for FdFence {
    fn is_idle(&self) -> bool {
        is_readable(self.fd.as_fd())
    }

    fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.fd.as_fd())
    }
}

/// Checks, without blocking, whether `fd` currently polls readable.
pub fn is_readable(fd: BorrowedFd<'_>) -> bool {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pfd` is a single initialized pollfd and `fd` stays borrowed for the call.
    let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
    if ready < 0 {
        tracing::warn!(
            "poll() on fence descriptor {} failed: {}",
            pfd.fd,
            std::io::Error::last_os_error()
        );
        return false;
    }
    ready > 0 && (pfd.revents & libc::POLLIN) != 0
}

/// One memory plane of a DMA-BUF.
#[derive(Debug)]
pub struct DmabufPlane {
    fence: Box<dyn PlaneFence>,
    pub offset: u32,
    pub stride: u32,
}

impl DmabufPlane {
    /// Creates a plane backed by a DMA-BUF file descriptor.
    pub fn new(fd: OwnedFd, offset: u32, stride: u32) -> Self {
        Self::with_fence(Box::new(FdFence::new(fd)), offset, stride)
    }

    /// Creates a plane whose idleness is reported by an arbitrary fence.
    pub fn with_fence(fence: Box<dyn PlaneFence>, offset: u32, stride: u32) -> Self {
        Self {
            fence,
            offset,
            stride,
        }
    }

    pub fn fence(&self) -> &dyn PlaneFence {
        self.fence.as_ref()
    }
}

/// Layout of an imported DMA-BUF.
#[derive(Debug)]
pub struct DmabufAttributes {
    /// DRM format modifier.
    pub modifier: u64,
    planes: Vec<DmabufPlane>,
}

impl DmabufAttributes {
    /// Validates the plane list of an import.
    ///
    /// # Errors
    /// [`BufferError::NoPlanes`] for an empty plane list and
    /// [`BufferError::TooManyPlanes`] past [`MAX_PLANES`].
    pub fn new(modifier: u64, planes: Vec<DmabufPlane>) -> Result<Self, BufferError> {
        if planes.is_empty() {
            return Err(BufferError::NoPlanes);
        }
        if planes.len() > MAX_PLANES {
            return Err(BufferError::TooManyPlanes(planes.len()));
        }
        Ok(Self { modifier, planes })
    }

    pub fn planes(&self) -> &[DmabufPlane] {
        &self.planes
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_fence_idle_once_readable() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let fence = FdFence::new(OwnedFd::from(reader));
        assert!(!fence.is_idle(), "An empty stream should not poll readable.");

        writer.write_all(&[1]).unwrap();
        assert!(fence.is_idle(), "The fence should report idle once data is readable.");
    }

    #[test]
    fn test_attributes_reject_bad_plane_counts() {
        assert!(matches!(
            DmabufAttributes::new(0, Vec::new()),
            Err(BufferError::NoPlanes)
        ));

        let planes = (0..MAX_PLANES + 1)
            .map(|_| {
                let (reader, _writer) = UnixStream::pair().unwrap();
                DmabufPlane::new(OwnedFd::from(reader), 0, 256)
            })
            .collect();
        assert!(matches!(
            DmabufAttributes::new(0, planes),
            Err(BufferError::TooManyPlanes(5))
        ));
    }
}
