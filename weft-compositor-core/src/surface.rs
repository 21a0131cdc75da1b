//! Surfaces and the state snapshots that flow through transactions.
//!
//! Every surface carries two [`SurfaceState`] values: the *pending* state the
//! client is currently building, and the *current* state that is visible on
//! screen. Pending state never becomes current directly. It is snapshotted
//! into a [`Transaction`](crate::transaction::Transaction) which applies it
//! once all ordering and readiness constraints are satisfied.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use weft_buffer_manager::BufferRef;

use crate::region::{Rectangle, Region};
use crate::subcompositor::SubsurfaceState;
use crate::transaction::TransactionId;

pub mod surface_registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub fn new_unique() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SurfaceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// `wl_output.transform` applied to buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputTransform {
    #[default]
    Normal,
    Rotated90,
    Rotated180,
    Rotated270,
    Flipped,
    FlippedRotated90,
    FlippedRotated180,
    FlippedRotated270,
}

bitflags! {
    /// Which attributes of a [`SurfaceState`] were explicitly set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFields: u32 {
        const BUFFER = 1 << 0;
        const OFFSET = 1 << 1;
        const DAMAGE = 1 << 2;
        const BUFFER_DAMAGE = 1 << 3;
        const OPAQUE_REGION = 1 << 4;
        const INPUT_REGION = 1 << 5;
        const BUFFER_SCALE = 1 << 6;
        const BUFFER_TRANSFORM = 1 << 7;
        const FRAME_CALLBACKS = 1 << 8;
        const SUBSURFACE_POSITIONS = 1 << 9;
    }
}

/// A bundle of surface attributes.
///
/// Only the attributes flagged in `committed` carry meaning. Everything else
/// holds defaults and is ignored when the state is merged or applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceState {
    /// Sequence number identifying this state among the surface's commits.
    pub serial: u32,
    pub committed: StateFields,
    /// The attached buffer. `None` with [`StateFields::BUFFER`] set detaches.
    pub buffer: Option<BufferRef>,
    pub offset: (i32, i32),
    pub damage: Vec<Rectangle>,
    pub buffer_damage: Vec<Rectangle>,
    /// `None` means the whole surface.
    pub opaque_region: Option<Region>,
    /// `None` means the whole surface.
    pub input_region: Option<Region>,
    pub buffer_scale: i32,
    pub buffer_transform: OutputTransform,
    pub frame_callbacks: Vec<u32>,
    /// Positions of direct children queued with `wl_subsurface.set_position`.
    /// They take effect when this state applies.
    pub subsurface_positions: Vec<(SurfaceId, (i32, i32))>,
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self {
            serial: 0,
            committed: StateFields::empty(),
            buffer: None,
            offset: (0, 0),
            damage: Vec::new(),
            buffer_damage: Vec::new(),
            opaque_region: None,
            input_region: None,
            buffer_scale: 1,
            buffer_transform: OutputTransform::Normal,
            frame_callbacks: Vec::new(),
            subsurface_positions: Vec::new(),
        }
    }
}

impl SurfaceState {
    /// Returns `true` if this state attaches a buffer (or detaches one).
    pub fn buffer_is_set(&self) -> bool {
        self.committed.contains(StateFields::BUFFER)
    }

    /// Folds every committed attribute of `self` into `target`.
    ///
    /// Damage and frame callbacks accumulate, every other attribute replaces
    /// the target's. `target` takes over the serial. `self` is then reset to an
    /// empty state carrying the next serial.
    pub fn merge_into(&mut self, target: &mut SurfaceState) {
        let committed = self.committed;
        if committed.contains(StateFields::BUFFER) {
            target.buffer = self.buffer.take();
        }
        if committed.contains(StateFields::OFFSET) {
            target.offset = self.offset;
        }
        if committed.contains(StateFields::DAMAGE) {
            target.damage.append(&mut self.damage);
        }
        if committed.contains(StateFields::BUFFER_DAMAGE) {
            target.buffer_damage.append(&mut self.buffer_damage);
        }
        if committed.contains(StateFields::OPAQUE_REGION) {
            target.opaque_region = self.opaque_region.take();
        }
        if committed.contains(StateFields::INPUT_REGION) {
            target.input_region = self.input_region.take();
        }
        if committed.contains(StateFields::BUFFER_SCALE) {
            target.buffer_scale = self.buffer_scale;
        }
        if committed.contains(StateFields::BUFFER_TRANSFORM) {
            target.buffer_transform = self.buffer_transform;
        }
        if committed.contains(StateFields::FRAME_CALLBACKS) {
            target.frame_callbacks.append(&mut self.frame_callbacks);
        }
        if committed.contains(StateFields::SUBSURFACE_POSITIONS) {
            for (child, position) in self.subsurface_positions.drain(..) {
                match target.subsurface_positions.iter_mut().find(|(id, _)| *id == child) {
                    Some(queued) => queued.1 = position,
                    None => target.subsurface_positions.push((child, position)),
                }
            }
        }
        target.committed |= committed;
        target.serial = self.serial;

        *self = SurfaceState {
            serial: self.serial.wrapping_add(1),
            ..SurfaceState::default()
        };
    }
}

#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    pending: SurfaceState,
    current: SurfaceState,
    pub(crate) subsurface: Option<SubsurfaceState>,
    pub(crate) parent: Option<SurfaceId>,
    pub(crate) children: Vec<SurfaceId>,
    first_transaction: Option<TransactionId>,
    last_transaction: Option<TransactionId>,
}

impl Surface {
    pub(crate) fn new() -> Self {
        Self {
            id: SurfaceId::new_unique(),
            pending: SurfaceState::default(),
            current: SurfaceState::default(),
            subsurface: None,
            parent: None,
            children: Vec::new(),
            first_transaction: None,
            last_transaction: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// The state being assembled by the client, not yet staged anywhere.
    pub fn pending(&self) -> &SurfaceState {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut SurfaceState {
        &mut self.pending
    }

    /// The state currently visible on screen.
    pub fn current(&self) -> &SurfaceState {
        &self.current
    }

    pub fn current_buffer(&self) -> Option<&BufferRef> {
        self.current.buffer.as_ref()
    }

    pub fn subsurface(&self) -> Option<&SubsurfaceState> {
        self.subsurface.as_ref()
    }

    pub fn parent(&self) -> Option<SurfaceId> {
        self.parent
    }

    pub fn children(&self) -> &[SurfaceId] {
        &self.children
    }

    /// Oldest committed transaction touching this surface that has not applied yet.
    pub fn first_transaction(&self) -> Option<TransactionId> {
        self.first_transaction
    }

    /// Most recently committed transaction touching this surface.
    pub fn last_transaction(&self) -> Option<TransactionId> {
        self.last_transaction
    }

    pub(crate) fn set_first_transaction(&mut self, transaction: Option<TransactionId>) {
        self.first_transaction = transaction;
    }

    pub(crate) fn set_last_transaction(&mut self, transaction: Option<TransactionId>) {
        self.last_transaction = transaction;
    }

    /// `wl_surface.attach`. `None` detaches the current buffer on the next apply.
    pub fn attach(&mut self, buffer: Option<BufferRef>, dx: i32, dy: i32) {
        self.pending.buffer = buffer;
        self.pending.offset = (dx, dy);
        self.pending.committed |= StateFields::BUFFER | StateFields::OFFSET;
    }

    /// `wl_surface.damage`, in surface-local coordinates.
    pub fn damage(&mut self, rect: Rectangle) {
        if rect.is_empty() {
            return;
        }
        self.pending.damage.push(rect);
        self.pending.committed |= StateFields::DAMAGE;
    }

    /// `wl_surface.damage_buffer`, in buffer coordinates.
    pub fn damage_buffer(&mut self, rect: Rectangle) {
        if rect.is_empty() {
            return;
        }
        self.pending.buffer_damage.push(rect);
        self.pending.committed |= StateFields::BUFFER_DAMAGE;
    }

    pub fn set_opaque_region(&mut self, region: Option<Region>) {
        self.pending.opaque_region = region;
        self.pending.committed |= StateFields::OPAQUE_REGION;
    }

    pub fn set_input_region(&mut self, region: Option<Region>) {
        self.pending.input_region = region;
        self.pending.committed |= StateFields::INPUT_REGION;
    }

    pub fn set_buffer_scale(&mut self, scale: i32) {
        self.pending.buffer_scale = scale;
        self.pending.committed |= StateFields::BUFFER_SCALE;
    }

    pub fn set_buffer_transform(&mut self, transform: OutputTransform) {
        self.pending.buffer_transform = transform;
        self.pending.committed |= StateFields::BUFFER_TRANSFORM;
    }

    /// `wl_surface.frame`: requests a callback once the next state is shown.
    pub fn frame(&mut self, callback_id: u32) {
        self.pending.frame_callbacks.push(callback_id);
        self.pending.committed |= StateFields::FRAME_CALLBACKS;
    }

    /// Hands the frame callbacks of the visible state to the renderer.
    pub fn take_frame_callbacks(&mut self) -> Vec<u32> {
        mem::take(&mut self.current.frame_callbacks)
    }

    /// Hands the surface damage accumulated since the last call to the renderer.
    pub fn take_damage(&mut self) -> Vec<Rectangle> {
        mem::take(&mut self.current.damage)
    }

    /// Like [`take_damage`](Self::take_damage), for buffer-coordinate damage.
    pub fn take_buffer_damage(&mut self) -> Vec<Rectangle> {
        mem::take(&mut self.current.buffer_damage)
    }

    /// Makes `next` the visible state of this surface.
    ///
    /// Attributes `next` did not set keep their current values. Damage and
    /// frame callbacks accumulate until the renderer takes them. Replacing the
    /// buffer drops the surface's reference on the old one.
    ///
    /// Returns the child positions carried by `next`; they belong to other
    /// surfaces and are written by the caller.
    pub(crate) fn apply_state(&mut self, mut next: SurfaceState) -> Vec<(SurfaceId, (i32, i32))> {
        let committed = next.committed;
        let current = &mut self.current;

        if committed.contains(StateFields::BUFFER) {
            current.buffer = next.buffer.take();
        }
        if committed.contains(StateFields::OFFSET) {
            current.offset = next.offset;
        }
        if committed.contains(StateFields::DAMAGE) {
            current.damage.append(&mut next.damage);
        }
        if committed.contains(StateFields::BUFFER_DAMAGE) {
            current.buffer_damage.append(&mut next.buffer_damage);
        }
        if committed.contains(StateFields::OPAQUE_REGION) {
            current.opaque_region = next.opaque_region.take();
        }
        if committed.contains(StateFields::INPUT_REGION) {
            current.input_region = next.input_region.take();
        }
        if committed.contains(StateFields::BUFFER_SCALE) {
            current.buffer_scale = next.buffer_scale;
        }
        if committed.contains(StateFields::BUFFER_TRANSFORM) {
            current.buffer_transform = next.buffer_transform;
        }
        if committed.contains(StateFields::FRAME_CALLBACKS) {
            current.frame_callbacks.append(&mut next.frame_callbacks);
        }
        current.committed = committed;
        current.serial = next.serial;
        mem::take(&mut next.subsurface_positions)
    }
}
