//! The transaction engine.
//!
//! Owns the surfaces, every committed-but-unapplied transaction, the locker
//! registry and the fence reactor. Everything runs on one thread: commits
//! return immediately and deferred transactions are resumed either by a fence
//! signal ([`plane_ready`](TransactionEngine::plane_ready)) or by cascading
//! from another transaction's apply.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::locker::LockerRegistry;
use super::{NoopListener, Transaction, TransactionId, TransactionListener};
use crate::config::TransactionConfig;
use crate::error::TransactionError;
use crate::reactor::{FenceReactor, PlaneKey};
use crate::subcompositor::{self, SubsurfaceSyncMode};
use crate::surface::surface_registry::SurfaceRegistry;
use crate::surface::{StateFields, Surface, SurfaceId, SurfaceState};

/// Result of [`TransactionEngine::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Applied before `commit` returned.
    Applied,
    /// Waiting for fences or for older transactions on the same surfaces.
    Pending(TransactionId),
}

/// Result of [`TransactionEngine::commit_surface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceCommit {
    /// The surface is a synchronized subsurface; its state waits for the parent.
    Cached,
    Committed(CommitOutcome),
}

/// A transaction that has been pending longer than the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledTransaction {
    pub id: TransactionId,
    pub age: Duration,
    pub lock_count: u32,
    pub surfaces: Vec<SurfaceId>,
}

pub struct TransactionEngine<R: FenceReactor> {
    config: TransactionConfig,
    surfaces: SurfaceRegistry,
    pending: HashMap<TransactionId, Transaction>,
    /// State of synchronized subsurfaces waiting for their parent's commit.
    cached: HashMap<SurfaceId, Transaction>,
    lockers: LockerRegistry<R::Watch>,
    reactor: R,
    listener: Box<dyn TransactionListener>,
    next_id: u64,
}

impl<R: FenceReactor> TransactionEngine<R> {
    pub fn new(reactor: R, config: TransactionConfig) -> Self {
        Self {
            config,
            surfaces: SurfaceRegistry::new(),
            pending: HashMap::new(),
            cached: HashMap::new(),
            lockers: LockerRegistry::new(),
            reactor,
            listener: Box::new(NoopListener),
            next_id: 1,
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn TransactionListener>) {
        self.listener = listener;
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn lockers(&self) -> &LockerRegistry<R::Watch> {
        &self.lockers
    }

    // Surfaces.

    pub fn create_surface(&mut self) -> SurfaceId {
        self.surfaces.register_new_surface()
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get_surface(id)
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_surface_mut(id)
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }

    pub fn create_subsurface(&mut self, surface: SurfaceId, parent: SurfaceId) -> Result<(), TransactionError> {
        subcompositor::get_subsurface(surface, parent, &mut self.surfaces)?;
        Ok(())
    }

    pub fn set_subsurface_position(&mut self, surface: SurfaceId, x: i32, y: i32) -> Result<(), TransactionError> {
        subcompositor::set_position(surface, x, y, &mut self.surfaces)?;
        Ok(())
    }

    /// Switches a subsurface between synchronized and desynchronized mode.
    ///
    /// Cached state of surfaces in the subtree that are no longer effectively
    /// synchronized is committed right away.
    pub fn set_subsurface_sync(&mut self, surface: SurfaceId, mode: SubsurfaceSyncMode) -> Result<(), TransactionError> {
        subcompositor::set_sync_mode(surface, mode, &mut self.surfaces)?;
        if mode == SubsurfaceSyncMode::Desynchronized {
            self.flush_unsynchronized(surface);
        }
        Ok(())
    }

    /// `wl_subsurface.destroy`.
    ///
    /// The surface stays alive as a standalone surface. State it cached while
    /// synchronized is committed right away, and so is the cached state of
    /// descendants that were only synchronized through it.
    pub fn destroy_subsurface(&mut self, surface: SurfaceId) -> Result<(), TransactionError> {
        subcompositor::destroy_subsurface_role(surface, &mut self.surfaces)?;
        self.flush_unsynchronized(surface);
        Ok(())
    }

    /// Commits the cached state of every surface in the subtree of `root`
    /// that is no longer effectively synchronized.
    fn flush_unsynchronized(&mut self, root: SurfaceId) {
        let mut subtree = vec![root];
        subtree.extend(subcompositor::descendants(root, &self.surfaces));
        for id in subtree {
            if subcompositor::is_effectively_synchronized(id, &self.surfaces) {
                continue;
            }
            if let Some(transaction) = self.cached.remove(&id) {
                tracing::debug!("Flushing cached state of {:?}", id);
                self.commit(transaction);
            }
        }
    }

    /// Destroys a surface.
    ///
    /// Outstanding transactions forget the surface, which may unblock
    /// transactions that were queued behind it; those are retried in commit
    /// order.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> Result<(), TransactionError> {
        let surface = self
            .surfaces
            .unregister_surface(id)
            .ok_or(TransactionError::UnknownSurface(id))?;

        self.cached.remove(&id);
        for transaction in self.cached.values_mut() {
            transaction.detach_surface(id);
        }
        for transaction in self.pending.values_mut() {
            transaction.detach_surface(id);
        }
        tracing::debug!(
            "Destroyed surface {:?} (chain {:?}..{:?})",
            id,
            surface.first_transaction(),
            surface.last_transaction()
        );
        drop(surface);

        let mut queued: Vec<TransactionId> = self.pending.keys().copied().collect();
        queued.sort_unstable();
        for transaction in queued {
            self.try_apply(transaction);
        }
        Ok(())
    }

    // Commit.

    /// Stages the pending state of `surface` into `transaction`.
    pub fn stage(&mut self, transaction: &mut Transaction, surface: SurfaceId) -> Result<(), TransactionError> {
        let surface = self
            .surfaces
            .get_surface_mut(surface)
            .ok_or(TransactionError::UnknownSurface(surface))?;
        transaction.add(surface);
        Ok(())
    }

    /// `wl_surface.commit`.
    ///
    /// Stages the surface together with the cached state of its synchronized
    /// subsurfaces and any subsurface positions set since the last commit.
    /// Synchronized subsurfaces keep the result cached until their parent
    /// commits; everything else is committed.
    pub fn commit_surface(&mut self, id: SurfaceId) -> Result<SurfaceCommit, TransactionError> {
        let mut transaction = self.cached.remove(&id).unwrap_or_default();
        self.stage(&mut transaction, id)?;

        for descendant in subcompositor::descendants(id, &self.surfaces) {
            if let Some(mut cached) = self.cached.remove(&descendant) {
                transaction.merge(&mut cached);
            }
        }
        let positions = subcompositor::take_pending_positions(id, &mut self.surfaces);
        if !positions.is_empty() {
            // Carried by the parent entry; the children stay off this transaction.
            transaction.amend(id, |state| {
                let mut queued = SurfaceState {
                    committed: StateFields::SUBSURFACE_POSITIONS,
                    subsurface_positions: positions,
                    ..SurfaceState::default()
                };
                let serial = state.serial;
                queued.merge_into(state);
                state.serial = serial;
            });
        }

        if subcompositor::is_effectively_synchronized(id, &self.surfaces) {
            tracing::trace!("Caching commit of synchronized subsurface {:?}", id);
            self.cached.insert(id, transaction);
            return Ok(SurfaceCommit::Cached);
        }
        Ok(SurfaceCommit::Committed(self.commit(transaction)))
    }

    /// Commits a transaction.
    ///
    /// New DMA-BUFs that are still busy lock the transaction, then it is
    /// appended to the chain of every surface it touches. If nothing holds it
    /// back it applies before this returns.
    pub fn commit(&mut self, mut transaction: Transaction) -> CommitOutcome {
        let id = TransactionId::new(self.next_id);
        self.next_id += 1;
        transaction.mark_committed(Instant::now());

        if self.config.fence_locking {
            let mut locks = 0;
            for entry in transaction.entries() {
                if !entry.state.buffer_is_set() {
                    continue;
                }
                if let Some(buffer) = &entry.buffer {
                    if self.lockers.lock(buffer, id, &mut self.reactor) {
                        locks += 1;
                    }
                }
            }
            for _ in 0..locks {
                transaction.lock();
            }
        }

        for entry in transaction.entries_mut() {
            let Some(surface_id) = entry.surface else {
                continue;
            };
            let Some(surface) = self.surfaces.get_surface_mut(surface_id) else {
                tracing::debug!("{} stages unknown surface {:?}, skipping it", id, surface_id);
                entry.surface = None;
                continue;
            };
            match surface.last_transaction() {
                Some(tail) => match self.pending.get_mut(&tail) {
                    Some(previous) => previous.set_next(surface_id, id),
                    None => {
                        tracing::error!("Chain tail {} of {:?} is not pending", tail, surface_id);
                        surface.set_first_transaction(Some(id));
                    }
                },
                None => surface.set_first_transaction(Some(id)),
            }
            surface.set_last_transaction(Some(id));
        }

        tracing::debug!(
            "Committed {} ({} entries, {} locks)",
            id,
            transaction.len(),
            transaction.lock_count()
        );
        self.pending.insert(id, transaction);

        if self.try_apply(id) {
            return CommitOutcome::Applied;
        }
        if let Some(transaction) = self.pending.get(&id) {
            for entry in transaction.entries() {
                if let Some(surface) = entry.surface {
                    self.listener.state_stashed(surface, entry.state.serial);
                }
            }
        }
        CommitOutcome::Pending(id)
    }

    // Locking.

    pub fn lock(&mut self, id: TransactionId) -> Result<(), TransactionError> {
        let transaction = self
            .pending
            .get_mut(&id)
            .ok_or(TransactionError::UnknownTransaction(id))?;
        transaction.lock();
        Ok(())
    }

    /// Drops one lock. Reaching zero tries to apply the transaction.
    pub fn unlock(&mut self, id: TransactionId) -> Result<(), TransactionError> {
        let transaction = self
            .pending
            .get_mut(&id)
            .ok_or(TransactionError::UnknownTransaction(id))?;
        if !transaction.unlock() {
            tracing::error!("Unlocking {} which holds no locks", id);
            return Ok(());
        }
        if transaction.lock_count() == 0 {
            self.try_apply(id);
        }
        Ok(())
    }

    /// Unlocked and first in line on every surface it touches.
    pub fn is_ready(&self, id: TransactionId) -> bool {
        let Some(transaction) = self.pending.get(&id) else {
            return false;
        };
        if transaction.lock_count() > 0 {
            return false;
        }
        transaction.surfaces().all(|surface| {
            self.surfaces
                .get_surface(surface)
                .map_or(true, |surface| surface.first_transaction() == Some(id))
        })
    }

    /// Applies `id` if it is ready, then keeps applying whatever became ready
    /// behind it. Returns `true` if `id` itself was applied.
    pub fn try_apply(&mut self, id: TransactionId) -> bool {
        let mut queue = VecDeque::from([id]);
        let mut applied = false;
        while let Some(candidate) = queue.pop_front() {
            if !self.is_ready(candidate) {
                continue;
            }
            let Some(transaction) = self.pending.remove(&candidate) else {
                continue;
            };
            let successors = transaction.apply(candidate, &mut self.surfaces, self.listener.as_mut());
            if candidate == id {
                applied = true;
            } else {
                tracing::debug!("{} cascaded into {}", id, candidate);
            }
            queue.extend(successors);
        }
        applied
    }

    /// The transaction queued after `id` on `surface`.
    pub fn next(&self, id: TransactionId, surface: SurfaceId) -> Option<TransactionId> {
        self.pending.get(&id).and_then(|transaction| transaction.next(surface))
    }

    /// A plane fence signalled.
    pub fn plane_ready(&mut self, key: PlaneKey) {
        tracing::trace!("{} became idle", key);
        for id in self.lockers.plane_ready(key) {
            if let Err(err) = self.unlock(id) {
                tracing::error!("Fence release for {} failed: {}", key, err);
            }
        }
    }

    // Inspection.

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: TransactionId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn lock_count(&self, id: TransactionId) -> Option<u32> {
        self.pending.get(&id).map(Transaction::lock_count)
    }

    /// Whether `surface` has a commit cached until its parent commits.
    pub fn has_cached_state(&self, surface: SurfaceId) -> bool {
        self.cached.contains_key(&surface)
    }

    /// Pending transactions older than the configured stall threshold, oldest first.
    pub fn stalled_transactions(&self, now: Instant) -> Vec<StalledTransaction> {
        let Some(threshold) = self.config.stall_warning() else {
            return Vec::new();
        };
        let mut stalled: Vec<StalledTransaction> = self
            .pending
            .iter()
            .filter_map(|(&id, transaction)| {
                let age = now.saturating_duration_since(transaction.committed_at()?);
                (age >= threshold).then(|| StalledTransaction {
                    id,
                    age,
                    lock_count: transaction.lock_count(),
                    surfaces: transaction.surfaces().collect(),
                })
            })
            .collect();
        stalled.sort_by_key(|stalled| stalled.id);
        stalled
    }

    /// Logs every stalled transaction. Returns how many there were.
    pub fn report_stalls(&self, now: Instant) -> usize {
        let stalled = self.stalled_transactions(now);
        for transaction in &stalled {
            tracing::warn!(
                "{} pending for {:?} ({} locks, surfaces {:?})",
                transaction.id,
                transaction.age,
                transaction.lock_count,
                transaction.surfaces
            );
        }
        stalled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ManualReactor;

    fn engine() -> TransactionEngine<ManualReactor> {
        TransactionEngine::new(ManualReactor::new(), TransactionConfig::default())
    }

    #[test]
    fn test_empty_transaction_applies_immediately() {
        let mut engine = engine();
        assert_eq!(engine.commit(Transaction::new()), CommitOutcome::Applied);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_manual_lock_holds_transaction_back() {
        let mut engine = engine();
        let surface = engine.create_surface();
        let mut transaction = Transaction::new();
        engine.stage(&mut transaction, surface).unwrap();
        transaction.lock();

        let CommitOutcome::Pending(id) = engine.commit(transaction) else {
            panic!("a locked transaction must not apply");
        };
        assert!(!engine.is_ready(id));
        assert_eq!(engine.lock_count(id), Some(1));
        assert_eq!(engine.surface(surface).unwrap().first_transaction(), Some(id));

        engine.lock(id).unwrap();
        engine.unlock(id).unwrap();
        assert!(engine.is_pending(id));
        engine.unlock(id).unwrap();
        assert!(!engine.is_pending(id));
        assert!(engine.surface(surface).unwrap().first_transaction().is_none());
        assert!(engine.surface(surface).unwrap().last_transaction().is_none());

        assert!(matches!(
            engine.unlock(id),
            Err(TransactionError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_stage_unknown_surface() {
        let mut engine = engine();
        let mut transaction = Transaction::new();
        let unknown = SurfaceId::new_unique();
        assert!(matches!(
            engine.stage(&mut transaction, unknown),
            Err(TransactionError::UnknownSurface(id)) if id == unknown
        ));
    }

    #[test]
    fn test_stalled_transactions() {
        let mut engine = engine();
        let surface = engine.create_surface();
        let mut transaction = Transaction::new();
        engine.stage(&mut transaction, surface).unwrap();
        transaction.lock();
        let CommitOutcome::Pending(id) = engine.commit(transaction) else {
            panic!("expected a pending transaction");
        };

        let now = Instant::now();
        assert!(engine.stalled_transactions(now).is_empty());

        let later = now + Duration::from_secs(5);
        let stalled = engine.stalled_transactions(later);
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, id);
        assert_eq!(stalled[0].lock_count, 1);
        assert_eq!(stalled[0].surfaces, vec![surface]);
        assert_eq!(engine.report_stalls(later), 1);
    }

    #[test]
    fn test_stall_reporting_can_be_disabled() {
        let config = TransactionConfig {
            stall_warning_ms: None,
            ..TransactionConfig::default()
        };
        let mut engine = TransactionEngine::new(ManualReactor::new(), config);
        let mut transaction = Transaction::new();
        transaction.lock();
        engine.commit(transaction);
        assert!(engine
            .stalled_transactions(Instant::now() + Duration::from_secs(60))
            .is_empty());
    }
}
