//! Manages buffer objects and their properties.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dmabuf::DmabufAttributes;
use crate::error::BufferError;

/// Represents a unique identifier for a Wayland client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a new client ID.
    ///
    /// # Arguments
    /// * `id`: The raw `u64` value for this client ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Represents a unique identifier for a buffer.
///
/// Identifiers are never reused within a process, so a stale id can never
/// alias a newer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn new_unique() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Specifies the underlying type or source of a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Buffer memory is managed via a shared memory mechanism (e.g., `wl_shm`).
    Shm,
    /// Buffer memory is represented by DMA buffer file descriptors.
    DmaBuf,
}

/// Enumerates common pixel formats for buffers.
///
/// These formats typically align with Wayland's `wl_shm.format` and DRM formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    /// 32-bit ARGB format, 8 bits per channel, alpha first.
    Argb8888,
    /// 32-bit XRGB format, 8 bits per channel, alpha ignored (X).
    Xrgb8888,
    /// YUV format, NV12 (2-plane Y followed by interleaved UV).
    Nv12,
}

impl BufferFormat {
    /// Bytes per pixel of the first plane.
    fn bytes_per_pixel(self) -> u32 {
        match self {
            BufferFormat::Argb8888 | BufferFormat::Xrgb8888 => 4,
            BufferFormat::Nv12 => 1,
        }
    }
}

type DestructionHook = Box<dyn FnOnce(BufferId)>;

/// A client buffer as seen by the compositor.
///
/// Buffers are only ever handled through [`BufferRef`]. When the last handle is
/// dropped the buffer is destroyed and every registered destruction hook runs,
/// in registration order.
pub struct Buffer {
    id: BufferId,
    buffer_type: BufferType,
    width: u32,
    height: u32,
    stride: u32,
    format: BufferFormat,
    client_owner_id: Option<ClientId>,
    dmabuf: Option<DmabufAttributes>,
    destruction_hooks: RefCell<Vec<DestructionHook>>,
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Size of the buffer in pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> BufferFormat {
        self.format
    }

    pub fn client_owner_id(&self) -> Option<ClientId> {
        self.client_owner_id
    }

    /// DMA-BUF layout, `None` for buffers without hardware-synchronized planes.
    pub fn dmabuf_attributes(&self) -> Option<&DmabufAttributes> {
        self.dmabuf.as_ref()
    }

    /// Registers a callback to run when the buffer is destroyed.
    pub fn add_destruction_hook<F>(&self, hook: F)
    where
        F: FnOnce(BufferId) + 'static,
    {
        self.destruction_hooks.borrow_mut().push(Box::new(hook));
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        tracing::trace!("{} destroyed", self.id);
        let hooks = std::mem::take(self.destruction_hooks.get_mut());
        for hook in hooks {
            hook(self.id);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("buffer_type", &self.buffer_type)
            .field("size", &(self.width, self.height))
            .field("format", &self.format)
            .field("planes", &self.dmabuf.as_ref().map(DmabufAttributes::plane_count))
            .finish()
    }
}

/// Reference-counted handle keeping a [`Buffer`] alive.
///
/// Cloning a handle takes a new reference; two handles compare equal when they
/// point at the same buffer.
#[derive(Clone)]
pub struct BufferRef(Rc<Buffer>);

impl BufferRef {
    /// Number of live handles on the underlying buffer.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.0, &other.0)
    }
}

impl Deref for BufferRef {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.0
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl Eq for BufferRef {}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BufferRef").field(&self.0.id).finish()
    }
}

/// Tracks the buffers clients have created.
///
/// The manager only holds weak references: it never extends a buffer's
/// lifetime, it merely lets the protocol layer resolve a [`BufferId`] back to a
/// live buffer.
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: HashMap<BufferId, Weak<Buffer>>,
}

impl BufferManager {
    /// Creates a new, empty `BufferManager`.
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Registers a shared-memory buffer.
    ///
    /// # Errors
    /// Returns [`BufferError::InvalidDimensions`] for a zero-sized buffer and
    /// [`BufferError::InvalidStride`] if a row does not fit into `stride` bytes.
    pub fn register_shm_buffer(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: BufferFormat,
        client_owner_id: Option<ClientId>,
    ) -> Result<BufferRef, BufferError> {
        validate_dimensions(width, height)?;
        if u64::from(stride) < u64::from(width) * u64::from(format.bytes_per_pixel()) {
            return Err(BufferError::InvalidStride {
                stride,
                width,
                format,
            });
        }
        Ok(self.insert(Buffer {
            id: BufferId::new_unique(),
            buffer_type: BufferType::Shm,
            width,
            height,
            stride,
            format,
            client_owner_id,
            dmabuf: None,
            destruction_hooks: RefCell::new(Vec::new()),
        }))
    }

    /// Registers an imported DMA-BUF.
    pub fn import_dmabuf(
        &mut self,
        width: u32,
        height: u32,
        format: BufferFormat,
        attributes: DmabufAttributes,
        client_owner_id: Option<ClientId>,
    ) -> Result<BufferRef, BufferError> {
        validate_dimensions(width, height)?;
        let stride = attributes.planes()[0].stride;
        Ok(self.insert(Buffer {
            id: BufferId::new_unique(),
            buffer_type: BufferType::DmaBuf,
            width,
            height,
            stride,
            format,
            client_owner_id,
            dmabuf: Some(attributes),
            destruction_hooks: RefCell::new(Vec::new()),
        }))
    }

    /// Resolves `id` to a live buffer.
    ///
    /// Returns `None` once every handle on the buffer has been dropped.
    pub fn get_buffer(&self, id: BufferId) -> Option<BufferRef> {
        self.buffers.get(&id).and_then(Weak::upgrade).map(BufferRef)
    }

    /// Number of registered buffers that are still alive.
    pub fn live_buffers(&self) -> usize {
        self.buffers.values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Forgets destroyed buffers, returning how many entries were dropped.
    pub fn purge_destroyed(&mut self) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, weak| weak.strong_count() > 0);
        before - self.buffers.len()
    }

    fn insert(&mut self, buffer: Buffer) -> BufferRef {
        self.purge_destroyed();
        let id = buffer.id;
        let buffer = Rc::new(buffer);
        self.buffers.insert(id, Rc::downgrade(&buffer));
        tracing::debug!("Registered {} ({:?})", id, buffer.buffer_type);
        BufferRef(buffer)
    }
}

fn validate_dimensions(width: u32, height: u32) -> Result<(), BufferError> {
    if width == 0 || height == 0 {
        return Err(BufferError::InvalidDimensions { width, height });
    }
    Ok(())
}
