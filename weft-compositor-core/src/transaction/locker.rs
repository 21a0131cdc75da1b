//! Readiness lockers: hold transactions back until DMA-BUF fences signal.
//!
//! A client may commit a buffer the GPU is still rendering into. Instead of
//! blocking, the first transaction that carries such a buffer is locked and
//! parked on the buffer's [`DmabufLocker`]. The locker watches every busy
//! plane and releases all parked transactions once the last plane goes idle.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::rc::{Rc, Weak};

use weft_buffer_manager::{Buffer, BufferId, BufferRef};

use super::TransactionId;
use crate::error::TransactionError;
use crate::reactor::{FenceReactor, FenceWatch, PlaneKey};

/// Per-buffer readiness gate.
#[derive(Debug)]
pub struct DmabufLocker<W> {
    /// One watch per plane, indexed by plane.
    watches: Vec<W>,
    /// Planes that were busy when last checked and have not signalled yet.
    pending_planes: Vec<usize>,
    waiting: Vec<TransactionId>,
}

impl<W: FenceWatch> DmabufLocker<W> {
    /// Registers one disabled watch per plane of `buffer`.
    ///
    /// Returns `Ok(None)` if the buffer has no DMA-BUF planes.
    pub fn new<R>(buffer: &Buffer, reactor: &mut R) -> Result<Option<Self>, TransactionError>
    where
        R: FenceReactor<Watch = W>,
    {
        let Some(attributes) = buffer.dmabuf_attributes() else {
            return Ok(None);
        };
        let watches = attributes
            .planes()
            .iter()
            .enumerate()
            .map(|(plane, descriptor)| {
                let key = PlaneKey {
                    buffer: buffer.id(),
                    plane,
                };
                reactor.watch(key, descriptor.fence())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self {
            watches,
            pending_planes: Vec::new(),
            waiting: Vec::new(),
        }))
    }

    /// Parks `transaction` on this locker if any plane is still busy.
    ///
    /// Returns `true` if the transaction has to take a lock.
    pub fn add(&mut self, transaction: TransactionId, buffer: &Buffer) -> bool {
        if !self.arm(buffer) {
            return false;
        }
        self.waiting.push(transaction);
        true
    }

    /// Checks every plane that is not already pending and starts watching the
    /// busy ones. Returns `true` while any plane is pending.
    pub fn arm(&mut self, buffer: &Buffer) -> bool {
        if let Some(attributes) = buffer.dmabuf_attributes() {
            for (plane, descriptor) in attributes.planes().iter().enumerate() {
                if self.pending_planes.contains(&plane) || descriptor.fence().is_idle() {
                    continue;
                }
                tracing::trace!("{} plane {} is busy", buffer.id(), plane);
                if let Some(watch) = self.watches.get_mut(plane) {
                    watch.set_enabled(true);
                }
                self.pending_planes.push(plane);
            }
        }
        !self.pending_planes.is_empty()
    }

    /// Handles the fence of `plane` signalling.
    ///
    /// Once no plane is pending any more, returns the transactions to unlock.
    pub fn plane_ready(&mut self, plane: usize) -> Vec<TransactionId> {
        if let Some(watch) = self.watches.get_mut(plane) {
            watch.set_enabled(false);
        }
        self.pending_planes.retain(|&pending| pending != plane);
        if self.pending_planes.is_empty() {
            mem::take(&mut self.waiting)
        } else {
            Vec::new()
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.pending_planes.is_empty()
    }

    pub fn waiting(&self) -> &[TransactionId] {
        &self.waiting
    }
}

type LockerMap<W> = HashMap<BufferId, DmabufLocker<W>>;

/// Compositor-wide map from buffer to its locker.
///
/// Lockers are created lazily and erased by a destruction hook on their
/// buffer. The hook only holds a weak reference to the map.
#[derive(Debug)]
pub struct LockerRegistry<W> {
    lockers: Rc<RefCell<LockerMap<W>>>,
}

impl<W> Default for LockerRegistry<W> {
    fn default() -> Self {
        Self {
            lockers: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl<W: FenceWatch + 'static> LockerRegistry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gates `transaction` on `buffer`.
    ///
    /// Returns `true` if the transaction has to take a lock. Buffers without
    /// DMA-BUF planes never lock; neither do buffers whose fences the reactor
    /// refuses to watch.
    pub fn lock<R>(&self, buffer: &BufferRef, transaction: TransactionId, reactor: &mut R) -> bool
    where
        R: FenceReactor<Watch = W>,
    {
        let mut lockers = self.lockers.borrow_mut();
        let locker = match lockers.entry(buffer.id()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match DmabufLocker::new(buffer, reactor) {
                Ok(Some(locker)) => {
                    self.install_destruction_hook(buffer);
                    entry.insert(locker)
                }
                Ok(None) => return false,
                Err(err) => {
                    tracing::warn!(
                        "Cannot watch fences of {}, committing it unfenced: {}",
                        buffer.id(),
                        err
                    );
                    return false;
                }
            },
        };
        let locked = locker.add(transaction, buffer);
        if locked {
            tracing::debug!("{} waits for {} to become idle", transaction, buffer.id());
        }
        locked
    }

    /// Routes a fence signal to its locker. Returns the transactions to unlock.
    pub fn plane_ready(&self, key: PlaneKey) -> Vec<TransactionId> {
        let mut lockers = self.lockers.borrow_mut();
        match lockers.get_mut(&key.buffer) {
            Some(locker) => locker.plane_ready(key.plane),
            None => {
                tracing::trace!("Ignoring readiness for {}, buffer is gone", key);
                Vec::new()
            }
        }
    }

    pub fn contains(&self, buffer: BufferId) -> bool {
        self.lockers.borrow().contains_key(&buffer)
    }

    pub fn len(&self) -> usize {
        self.lockers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lockers.borrow().is_empty()
    }

    fn install_destruction_hook(&self, buffer: &Buffer) {
        let registry: Weak<RefCell<LockerMap<W>>> = Rc::downgrade(&self.lockers);
        buffer.add_destruction_hook(move |id| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = match registry.try_borrow_mut() {
                Ok(mut lockers) => lockers.remove(&id),
                Err(_) => {
                    tracing::error!("Locker registry busy while destroying {}", id);
                    return;
                }
            };
            // Dropping the locker unregisters its watches; do it with the map released.
            drop(removed);
        });
    }
}
