//! Atomic, ordered application of surface state.
//!
//! A [`Transaction`] groups one state snapshot per surface. Once committed to
//! the [`TransactionEngine`](engine::TransactionEngine) it applies as a whole,
//! but only after:
//!
//! - its lock count has dropped to zero (every new DMA-BUF it carries is idle),
//! - it is the oldest unapplied transaction of every surface it touches.
//!
//! The second rule threads transactions into per-surface FIFO chains: each
//! surface remembers the first and last transaction touching it, and every
//! entry records the transaction that follows it on that surface. Applying a
//! transaction advances those chains and retries whatever comes next.

use std::cmp::Reverse;
use std::fmt;
use std::mem;
use std::time::Instant;

use weft_buffer_manager::BufferRef;

use crate::subcompositor;
use crate::surface::surface_registry::SurfaceRegistry;
use crate::surface::{Surface, SurfaceId, SurfaceState};

pub mod engine;
pub mod locker;

/// Identity of a committed transaction. Ids grow with commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction#{}", self.0)
    }
}

/// Observer of state flowing through transactions.
pub trait TransactionListener {
    /// A committed state could not be applied right away and is now waiting.
    fn state_stashed(&mut self, _surface: SurfaceId, _serial: u32) {}

    /// A state became the surface's current state.
    fn state_applied(&mut self, _surface: SurfaceId, _serial: u32) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl TransactionListener for NoopListener {}

/// One surface's part of a transaction.
#[derive(Debug)]
pub struct TransactionEntry {
    /// Cleared when the surface is destroyed before the entry applies.
    pub surface: Option<SurfaceId>,
    /// Keeps the attached buffer alive until the entry applies.
    pub buffer: Option<BufferRef>,
    pub state: SurfaceState,
    /// The transaction queued after this one on `surface`.
    pub next_transaction: Option<TransactionId>,
}

impl TransactionEntry {
    fn new(surface: SurfaceId, state: SurfaceState) -> Self {
        Self {
            surface: Some(surface),
            buffer: state.buffer.clone(),
            state,
            next_transaction: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Transaction {
    entries: Vec<TransactionEntry>,
    lock_count: u32,
    committed_at: Option<Instant>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages the pending state of `surface`.
    ///
    /// The surface's pending state is moved out, leaving it empty for the
    /// client to fill again. Staging a surface twice coalesces into the
    /// existing entry: newer attributes win and damage accumulates.
    pub fn add(&mut self, surface: &mut Surface) {
        let id = surface.id();
        let sets_buffer = surface.pending().buffer_is_set();

        if let Some(entry) = self.entry_mut(id) {
            surface.pending_mut().merge_into(&mut entry.state);
            if sets_buffer {
                entry.buffer = entry.state.buffer.clone();
            }
            return;
        }

        let mut state = SurfaceState::default();
        surface.pending_mut().merge_into(&mut state);
        self.entries.push(TransactionEntry::new(id, state));
    }

    /// Edits the staged state of `surface` in place. Does nothing if the
    /// surface has no entry.
    pub fn amend<F>(&mut self, surface: SurfaceId, mutator: F)
    where
        F: FnOnce(&mut SurfaceState),
    {
        if let Some(entry) = self.entry_mut(surface) {
            mutator(&mut entry.state);
            if entry.state.buffer_is_set() {
                entry.buffer = entry.state.buffer.clone();
            }
        }
    }

    /// Moves every entry of `other` into this transaction, leaving `other`
    /// empty.
    ///
    /// An incoming entry for a surface this transaction already stages is
    /// folded into the existing entry the same way [`add`](Self::add) does.
    pub fn merge(&mut self, other: &mut Transaction) {
        for mut incoming in mem::take(&mut other.entries) {
            let existing = incoming
                .surface
                .and_then(|surface| self.entries.iter().position(|e| e.surface == Some(surface)));
            match existing {
                Some(index) => {
                    let entry = &mut self.entries[index];
                    let sets_buffer = incoming.state.buffer_is_set();
                    incoming.state.merge_into(&mut entry.state);
                    if sets_buffer {
                        entry.buffer = entry.state.buffer.clone();
                    }
                }
                None => self.entries.push(incoming),
            }
        }
        self.lock_count += mem::take(&mut other.lock_count);
    }

    /// The transaction queued after this one on `surface`.
    pub fn next(&self, surface: SurfaceId) -> Option<TransactionId> {
        self.entry(surface).and_then(|entry| entry.next_transaction)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Staged surfaces, in staging order.
    pub fn surfaces(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.entries.iter().filter_map(|entry| entry.surface)
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn committed_at(&self) -> Option<Instant> {
        self.committed_at
    }

    fn entry(&self, surface: SurfaceId) -> Option<&TransactionEntry> {
        self.entries.iter().find(|entry| entry.surface == Some(surface))
    }

    fn entry_mut(&mut self, surface: SurfaceId) -> Option<&mut TransactionEntry> {
        self.entries.iter_mut().find(|entry| entry.surface == Some(surface))
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [TransactionEntry] {
        &mut self.entries
    }

    pub(crate) fn mark_committed(&mut self, at: Instant) {
        self.committed_at = Some(at);
    }

    pub(crate) fn lock(&mut self) {
        self.lock_count += 1;
    }

    /// Returns `false` if the count already was zero.
    pub(crate) fn unlock(&mut self) -> bool {
        match self.lock_count.checked_sub(1) {
            Some(count) => {
                self.lock_count = count;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_next(&mut self, surface: SurfaceId, next: TransactionId) {
        if let Some(entry) = self.entry_mut(surface) {
            entry.next_transaction = Some(next);
        }
    }

    /// Forgets `surface`. Its entry stays but will be skipped on apply.
    pub(crate) fn detach_surface(&mut self, surface: SurfaceId) {
        for entry in self.entries.iter_mut().filter(|e| e.surface == Some(surface)) {
            entry.surface = None;
        }
    }

    /// Makes every staged state current and advances the surface chains.
    ///
    /// Descendants are applied before their ancestors so a parent never
    /// shows up referencing child content that is not there yet. Returns the
    /// transactions queued behind this one, which may have become ready.
    pub(crate) fn apply(
        self,
        id: TransactionId,
        surfaces: &mut SurfaceRegistry,
        listener: &mut dyn TransactionListener,
    ) -> Vec<TransactionId> {
        let mut entries = self.entries;
        entries.sort_by_cached_key(|entry| {
            entry.surface.map(|surface| {
                (
                    subcompositor::main_surface(surface, surfaces),
                    Reverse(subcompositor::depth(surface, surfaces)),
                )
            })
        });

        tracing::debug!("Applying {} ({} entries)", id, entries.len());

        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(surface_id) = entry.surface else {
                continue;
            };
            let Some(surface) = surfaces.get_surface_mut(surface_id) else {
                tracing::error!("{} references unknown surface {:?}", id, surface_id);
                continue;
            };
            let serial = entry.state.serial;
            for (child, position) in surface.apply_state(entry.state) {
                subcompositor::apply_position(surface_id, child, position, surfaces);
            }
            applied.push((surface_id, serial, entry.next_transaction));
        }

        let mut successors = Vec::new();
        for (surface_id, serial, next) in applied {
            if let Some(surface) = surfaces.get_surface_mut(surface_id) {
                debug_assert_eq!(surface.first_transaction(), Some(id));
                if surface.last_transaction() == Some(id) {
                    surface.set_first_transaction(None);
                    surface.set_last_transaction(None);
                } else {
                    surface.set_first_transaction(next);
                }
            }
            listener.state_applied(surface_id, serial);
            if let Some(next) = next {
                if !successors.contains(&next) {
                    successors.push(next);
                }
            }
        }
        successors
    }
}
