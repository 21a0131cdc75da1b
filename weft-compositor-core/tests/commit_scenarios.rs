//! End-to-end commit behaviour of the transaction engine, driven through
//! the manual reactor.

use std::cell::{Cell, RefCell};
use std::os::fd::BorrowedFd;
use std::rc::Rc;

use weft_buffer_manager::{
    BufferFormat, BufferManager, BufferRef, DmabufAttributes, DmabufPlane, PlaneFence,
};
use weft_compositor_core::logging::init_test_logging;
use weft_compositor_core::region::Rectangle;
use weft_compositor_core::subcompositor::SubsurfaceSyncMode;
use weft_compositor_core::{
    CommitOutcome, ManualReactor, PlaneKey, SurfaceCommit, SurfaceId, Transaction,
    TransactionConfig, TransactionEngine, TransactionListener,
};

#[derive(Debug)]
struct TestFence(Rc<Cell<bool>>);

impl PlaneFence for TestFence {
    fn is_idle(&self) -> bool {
        self.0.get()
    }

    fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Stashed(SurfaceId, u32),
    Applied(SurfaceId, u32),
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<Event>>>);

impl Recorder {
    fn applied(&self) -> Vec<SurfaceId> {
        self.0
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Applied(surface, _) => Some(*surface),
                Event::Stashed(..) => None,
            })
            .collect()
    }

    fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }
}

impl TransactionListener for Recorder {
    fn state_stashed(&mut self, surface: SurfaceId, serial: u32) {
        self.0.borrow_mut().push(Event::Stashed(surface, serial));
    }

    fn state_applied(&mut self, surface: SurfaceId, serial: u32) {
        self.0.borrow_mut().push(Event::Applied(surface, serial));
    }
}

struct Harness {
    engine: TransactionEngine<ManualReactor>,
    reactor: ManualReactor,
    buffers: BufferManager,
    recorder: Recorder,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(TransactionConfig::default())
    }

    fn with_config(config: TransactionConfig) -> Self {
        init_test_logging();
        let reactor = ManualReactor::new();
        let mut engine = TransactionEngine::new(reactor.clone(), config);
        let recorder = Recorder::default();
        engine.set_listener(Box::new(recorder.clone()));
        Self {
            engine,
            reactor,
            buffers: BufferManager::new(),
            recorder,
        }
    }

    fn shm(&mut self) -> BufferRef {
        self.buffers
            .register_shm_buffer(64, 64, 256, BufferFormat::Argb8888, None)
            .unwrap()
    }

    /// A DMA-BUF with one plane per flag; `true` means idle.
    fn dmabuf(&mut self, idle: &[bool]) -> (BufferRef, Vec<Rc<Cell<bool>>>) {
        let flags: Vec<_> = idle.iter().map(|&idle| Rc::new(Cell::new(idle))).collect();
        let planes = flags
            .iter()
            .map(|flag| DmabufPlane::with_fence(Box::new(TestFence(flag.clone())), 0, 256))
            .collect();
        let attributes = DmabufAttributes::new(0, planes).unwrap();
        let buffer = self
            .buffers
            .import_dmabuf(64, 64, BufferFormat::Xrgb8888, attributes, None)
            .unwrap();
        (buffer, flags)
    }

    fn attach(&mut self, surface: SurfaceId, buffer: &BufferRef) {
        self.engine
            .surface_mut(surface)
            .unwrap()
            .attach(Some(buffer.clone()), 0, 0);
    }

    fn signal(&mut self, buffer: &BufferRef, flags: &[Rc<Cell<bool>>], plane: usize) {
        flags[plane].set(true);
        self.engine.plane_ready(PlaneKey {
            buffer: buffer.id(),
            plane,
        });
    }

    fn current_buffer(&self, surface: SurfaceId) -> Option<BufferRef> {
        self.engine.surface(surface).unwrap().current_buffer().cloned()
    }
}

fn pending_id(outcome: SurfaceCommit) -> weft_compositor_core::TransactionId {
    match outcome {
        SurfaceCommit::Committed(CommitOutcome::Pending(id)) => id,
        other => panic!("expected a pending commit, got {other:?}"),
    }
}

#[test]
fn shm_commit_applies_before_returning() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let buffer = h.shm();
    h.attach(surface, &buffer);

    let outcome = h.engine.commit_surface(surface).unwrap();

    assert_eq!(outcome, SurfaceCommit::Committed(CommitOutcome::Applied));
    assert_eq!(h.current_buffer(surface), Some(buffer));
    assert_eq!(h.engine.pending_count(), 0);
    assert_eq!(h.recorder.events(), vec![Event::Applied(surface, 0)]);
    assert!(h.engine.lockers().is_empty(), "SHM buffers never get a locker.");
}

#[test]
fn busy_plane_defers_apply_until_signalled() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (buffer, flags) = h.dmabuf(&[true, false]);
    h.attach(surface, &buffer);

    let id = pending_id(h.engine.commit_surface(surface).unwrap());

    assert_eq!(h.engine.lock_count(id), Some(1));
    assert!(h.current_buffer(surface).is_none(), "Nothing may be visible yet.");
    assert_eq!(
        h.reactor.enabled_watches(),
        vec![PlaneKey { buffer: buffer.id(), plane: 1 }],
        "Only the busy plane is watched."
    );
    assert_eq!(h.recorder.events(), vec![Event::Stashed(surface, 0)]);

    h.signal(&buffer, &flags, 1);

    assert!(!h.engine.is_pending(id));
    assert_eq!(h.current_buffer(surface), Some(buffer));
    assert!(h.reactor.enabled_watches().is_empty());
    assert_eq!(
        h.recorder.events(),
        vec![Event::Stashed(surface, 0), Event::Applied(surface, 0)]
    );
}

#[test]
fn idle_dmabuf_takes_the_fast_path() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (buffer, _flags) = h.dmabuf(&[true, true]);
    h.attach(surface, &buffer);

    let outcome = h.engine.commit_surface(surface).unwrap();

    assert_eq!(outcome, SurfaceCommit::Committed(CommitOutcome::Applied));
    assert_eq!(h.current_buffer(surface), Some(buffer));
}

#[test]
fn later_commit_waits_for_earlier_one_on_same_surface() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (fenced, flags) = h.dmabuf(&[false]);
    let plain = h.shm();

    h.attach(surface, &fenced);
    let first = pending_id(h.engine.commit_surface(surface).unwrap());
    h.attach(surface, &plain);
    let second = pending_id(h.engine.commit_surface(surface).unwrap());

    assert_eq!(h.engine.lock_count(second), Some(0), "The second commit holds no lock of its own.");
    assert!(!h.engine.is_ready(second));
    assert_eq!(h.engine.next(first, surface), Some(second));
    let chain = h.engine.surface(surface).unwrap();
    assert_eq!(chain.first_transaction(), Some(first));
    assert_eq!(chain.last_transaction(), Some(second));

    h.signal(&fenced, &flags, 0);

    assert_eq!(h.engine.pending_count(), 0);
    assert_eq!(h.current_buffer(surface), Some(plain));
    assert_eq!(
        h.recorder.events(),
        vec![
            Event::Stashed(surface, 0),
            Event::Stashed(surface, 1),
            Event::Applied(surface, 0),
            Event::Applied(surface, 1),
        ]
    );
    assert!(h.engine.surface(surface).unwrap().first_transaction().is_none());
}

#[test]
fn unrelated_surfaces_do_not_wait_for_each_other() {
    let mut h = Harness::new();
    let blocked = h.engine.create_surface();
    let free = h.engine.create_surface();
    let (fenced, _flags) = h.dmabuf(&[false]);
    let plain = h.shm();

    h.attach(blocked, &fenced);
    pending_id(h.engine.commit_surface(blocked).unwrap());
    h.attach(free, &plain);

    assert_eq!(
        h.engine.commit_surface(free).unwrap(),
        SurfaceCommit::Committed(CommitOutcome::Applied)
    );
}

#[test]
fn all_planes_must_signal_in_any_order() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (buffer, flags) = h.dmabuf(&[false, false, false]);
    h.attach(surface, &buffer);
    let id = pending_id(h.engine.commit_surface(surface).unwrap());

    h.signal(&buffer, &flags, 2);
    assert!(h.engine.is_pending(id));
    h.signal(&buffer, &flags, 0);
    assert!(h.engine.is_pending(id));
    assert!(h.current_buffer(surface).is_none());

    h.signal(&buffer, &flags, 1);
    assert!(!h.engine.is_pending(id));
    assert_eq!(h.current_buffer(surface), Some(buffer));
}

#[test]
fn applied_state_is_the_snapshot_taken_at_commit() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (buffer, flags) = h.dmabuf(&[false]);
    h.attach(surface, &buffer);
    h.engine.surface_mut(surface).unwrap().set_buffer_scale(2);
    h.engine.commit_surface(surface).unwrap();

    // Staged after the commit; must not leak into the pending transaction.
    h.engine.surface_mut(surface).unwrap().set_buffer_scale(3);
    h.signal(&buffer, &flags, 0);

    let current = h.engine.surface(surface).unwrap().current();
    assert_eq!(current.buffer_scale, 2);
    assert_eq!(h.engine.surface(surface).unwrap().pending().buffer_scale, 3);
}

#[test]
fn subsurface_applies_before_its_parent() {
    let mut h = Harness::new();
    let parent = h.engine.create_surface();
    let child = h.engine.create_surface();
    let grandchild = h.engine.create_surface();
    h.engine.create_subsurface(child, parent).unwrap();
    h.engine.create_subsurface(grandchild, child).unwrap();

    let mut transaction = Transaction::new();
    h.engine.stage(&mut transaction, parent).unwrap();
    h.engine.stage(&mut transaction, child).unwrap();
    h.engine.stage(&mut transaction, grandchild).unwrap();
    assert_eq!(h.engine.commit(transaction), CommitOutcome::Applied);

    assert_eq!(h.recorder.applied(), vec![grandchild, child, parent]);
}

#[test]
fn merge_coalesces_shared_surfaces() {
    let mut h = Harness::new();
    let a = h.engine.create_surface();
    let b = h.engine.create_surface();
    let c = h.engine.create_surface();
    let first_buffer = h.shm();
    let second_buffer = h.shm();

    let mut t1 = Transaction::new();
    h.engine.stage(&mut t1, a).unwrap();
    h.attach(b, &first_buffer);
    h.engine.stage(&mut t1, b).unwrap();

    let mut t2 = Transaction::new();
    h.attach(b, &second_buffer);
    h.engine.stage(&mut t2, b).unwrap();
    h.engine.stage(&mut t2, c).unwrap();

    t1.merge(&mut t2);
    assert!(t2.is_empty());
    assert_eq!(t1.surfaces().collect::<Vec<_>>(), vec![a, b, c]);

    assert_eq!(h.engine.commit(t1), CommitOutcome::Applied);
    assert_eq!(h.current_buffer(b), Some(second_buffer), "The newer buffer wins.");
    assert_eq!(h.recorder.applied().iter().filter(|&&s| s == b).count(), 1);
}

#[test]
fn destroying_a_surface_unblocks_transactions_queued_behind_it() {
    let mut h = Harness::new();
    let doomed = h.engine.create_surface();
    let survivor = h.engine.create_surface();
    let (fenced, flags) = h.dmabuf(&[false]);

    h.attach(doomed, &fenced);
    let first = pending_id(h.engine.commit_surface(doomed).unwrap());

    let mut transaction = Transaction::new();
    h.engine.stage(&mut transaction, doomed).unwrap();
    h.engine.stage(&mut transaction, survivor).unwrap();
    let CommitOutcome::Pending(second) = h.engine.commit(transaction) else {
        panic!("second transaction must queue behind the first");
    };

    h.engine.destroy_surface(doomed).unwrap();

    assert!(!h.engine.is_pending(second), "Only the destroyed surface held it back.");
    assert!(h.engine.is_pending(first), "Still waiting for its fence.");
    assert!(h.engine.surface(doomed).is_none());

    h.signal(&fenced, &flags, 0);
    assert_eq!(h.engine.pending_count(), 0);
    assert_eq!(h.recorder.applied(), vec![survivor]);
}

#[test]
fn synchronized_subsurface_waits_for_parent_commit() {
    let mut h = Harness::new();
    let parent = h.engine.create_surface();
    let child = h.engine.create_surface();
    h.engine.create_subsurface(child, parent).unwrap();
    let buffer = h.shm();

    h.attach(child, &buffer);
    assert_eq!(h.engine.commit_surface(child).unwrap(), SurfaceCommit::Cached);
    assert!(h.engine.has_cached_state(child));
    assert!(h.current_buffer(child).is_none());

    h.engine.set_subsurface_position(child, 5, 6).unwrap();
    assert_eq!(
        h.engine.commit_surface(parent).unwrap(),
        SurfaceCommit::Committed(CommitOutcome::Applied)
    );

    assert!(!h.engine.has_cached_state(child));
    assert_eq!(h.current_buffer(child), Some(buffer));
    let subsurface = h.engine.surface(child).unwrap().subsurface().unwrap();
    assert_eq!(subsurface.current_position, (5, 6));
    assert_eq!(h.recorder.applied(), vec![child, parent]);
}

#[test]
fn switching_to_desync_flushes_cached_state() {
    let mut h = Harness::new();
    let parent = h.engine.create_surface();
    let child = h.engine.create_surface();
    h.engine.create_subsurface(child, parent).unwrap();
    let buffer = h.shm();

    h.attach(child, &buffer);
    assert_eq!(h.engine.commit_surface(child).unwrap(), SurfaceCommit::Cached);

    h.engine
        .set_subsurface_sync(child, SubsurfaceSyncMode::Desynchronized)
        .unwrap();

    assert!(!h.engine.has_cached_state(child));
    assert_eq!(h.current_buffer(child), Some(buffer));
}

#[test]
fn replaced_buffer_releases_its_locker() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (fenced, flags) = h.dmabuf(&[false]);
    let fenced_id = fenced.id();
    h.attach(surface, &fenced);
    h.engine.commit_surface(surface).unwrap();
    h.signal(&fenced, &flags, 0);
    assert!(h.engine.lockers().contains(fenced_id));
    drop(fenced);

    let plain = h.shm();
    h.attach(surface, &plain);
    h.engine.commit_surface(surface).unwrap();

    assert!(!h.engine.lockers().contains(fenced_id), "Last reference gone, locker erased.");
    assert_eq!(h.reactor.watch_count(), 0);
    assert!(h.buffers.get_buffer(fenced_id).is_none());
}

#[test]
fn fence_locking_can_be_turned_off() {
    let config = TransactionConfig {
        fence_locking: false,
        ..TransactionConfig::default()
    };
    let mut h = Harness::with_config(config);
    let surface = h.engine.create_surface();
    let (buffer, _flags) = h.dmabuf(&[false]);
    h.attach(surface, &buffer);

    assert_eq!(
        h.engine.commit_surface(surface).unwrap(),
        SurfaceCommit::Committed(CommitOutcome::Applied)
    );
    assert_eq!(h.reactor.watch_count(), 0);
}

#[test]
fn fifo_order_carries_across_multi_surface_transactions() {
    let mut h = Harness::new();
    let a = h.engine.create_surface();
    let b = h.engine.create_surface();
    let (fenced, flags) = h.dmabuf(&[false]);
    let middle = h.shm();
    let last = h.shm();

    h.attach(a, &fenced);
    let t1 = pending_id(h.engine.commit_surface(a).unwrap());

    let mut transaction = Transaction::new();
    h.engine.stage(&mut transaction, a).unwrap();
    h.attach(b, &middle);
    h.engine.stage(&mut transaction, b).unwrap();
    let CommitOutcome::Pending(t2) = h.engine.commit(transaction) else {
        panic!("t2 must queue behind t1 on the shared surface");
    };

    h.attach(b, &last);
    let t3 = pending_id(h.engine.commit_surface(b).unwrap());

    assert!(!h.engine.is_ready(t3), "b is held back by a's fence through t2.");
    assert_eq!(h.engine.next(t1, a), Some(t2));
    assert_eq!(h.engine.next(t2, b), Some(t3));
    assert!(h.current_buffer(b).is_none());

    h.signal(&fenced, &flags, 0);

    assert_eq!(h.engine.pending_count(), 0);
    assert_eq!(h.current_buffer(b), Some(last));
    assert_eq!(
        h.recorder.events(),
        vec![
            Event::Stashed(a, 0),
            Event::Stashed(a, 1),
            Event::Stashed(b, 0),
            Event::Stashed(b, 1),
            Event::Applied(a, 0),
            Event::Applied(a, 1),
            Event::Applied(b, 0),
            Event::Applied(b, 1),
        ]
    );
}

#[test]
fn parent_commit_does_not_wait_for_desync_child_fence() {
    let mut h = Harness::new();
    let parent = h.engine.create_surface();
    let child = h.engine.create_surface();
    h.engine.create_subsurface(child, parent).unwrap();
    h.engine
        .set_subsurface_sync(child, SubsurfaceSyncMode::Desynchronized)
        .unwrap();
    let (fenced, flags) = h.dmabuf(&[false]);
    let plain = h.shm();

    h.attach(child, &fenced);
    let child_commit = pending_id(h.engine.commit_surface(child).unwrap());

    h.engine.set_subsurface_position(child, 7, 8).unwrap();
    h.attach(parent, &plain);
    assert_eq!(
        h.engine.commit_surface(parent).unwrap(),
        SurfaceCommit::Committed(CommitOutcome::Applied)
    );

    assert_eq!(h.current_buffer(parent), Some(plain));
    let child_surface = h.engine.surface(child).unwrap();
    assert_eq!(child_surface.subsurface().unwrap().current_position, (7, 8));
    assert_eq!(child_surface.first_transaction(), Some(child_commit));
    assert!(h.current_buffer(child).is_none());

    h.signal(&fenced, &flags, 0);

    assert_eq!(h.current_buffer(child), Some(fenced));
    // The position is not a child commit, so the child's serial applies once.
    assert_eq!(
        h.recorder.events(),
        vec![
            Event::Stashed(child, 0),
            Event::Applied(parent, 0),
            Event::Applied(child, 0),
        ]
    );
}

#[test]
fn destroying_the_subsurface_role_commits_cached_state() {
    let mut h = Harness::new();
    let parent = h.engine.create_surface();
    let child = h.engine.create_surface();
    let grandchild = h.engine.create_surface();
    h.engine.create_subsurface(child, parent).unwrap();
    h.engine.create_subsurface(grandchild, child).unwrap();
    h.engine
        .set_subsurface_sync(grandchild, SubsurfaceSyncMode::Desynchronized)
        .unwrap();
    let child_buffer = h.shm();
    let grandchild_buffer = h.shm();

    h.attach(child, &child_buffer);
    assert_eq!(h.engine.commit_surface(child).unwrap(), SurfaceCommit::Cached);
    h.attach(grandchild, &grandchild_buffer);
    assert_eq!(
        h.engine.commit_surface(grandchild).unwrap(),
        SurfaceCommit::Cached,
        "Synchronized through its parent."
    );

    h.engine.destroy_subsurface(child).unwrap();

    assert!(!h.engine.has_cached_state(child));
    assert!(!h.engine.has_cached_state(grandchild));
    assert_eq!(h.current_buffer(child), Some(child_buffer));
    assert_eq!(h.current_buffer(grandchild), Some(grandchild_buffer));
    assert!(h.engine.surface(child).unwrap().subsurface().is_none());
    assert!(h.engine.surface(parent).unwrap().children().is_empty());
    assert_eq!(h.engine.surface(grandchild).unwrap().parent(), Some(child));

    // The role is gone; destroying it again changes nothing.
    h.engine.destroy_subsurface(child).unwrap();
    assert!(h.engine.destroy_subsurface(SurfaceId::new_unique()).is_err());
}

#[test]
fn cascaded_applies_keep_all_damage_until_taken() {
    let mut h = Harness::new();
    let surface = h.engine.create_surface();
    let (fenced, flags) = h.dmabuf(&[false]);
    let plain = h.shm();

    h.attach(surface, &fenced);
    h.engine.surface_mut(surface).unwrap().damage(Rectangle::new(0, 0, 8, 8));
    h.engine.commit_surface(surface).unwrap();
    h.attach(surface, &plain);
    h.engine.surface_mut(surface).unwrap().damage(Rectangle::new(32, 32, 8, 8));
    h.engine.commit_surface(surface).unwrap();

    h.signal(&fenced, &flags, 0);

    let surface = h.engine.surface_mut(surface).unwrap();
    assert_eq!(
        surface.take_damage(),
        vec![Rectangle::new(0, 0, 8, 8), Rectangle::new(32, 32, 8, 8)]
    );
    assert!(surface.take_damage().is_empty());
}
