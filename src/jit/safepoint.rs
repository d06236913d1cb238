//! Stop-the-world coordination for code patching and heap walks.
//!
//! One thread at a time holds the barrier. Acquiring it:
//! 1. Takes the coordinator lock (waiting for any current holder)
//! 2. Raises the request flag that mutators check at safe points
//! 3. Waits until every other registered mutator is parked
//!
//! A mutator is parked while it sits in [`MutatorHandle::poll`], runs inside
//! [`MutatorHandle::blocking`], or waits to acquire the barrier itself.
//! Acquisition is reentrant through a per-thread [`LockDepth`] and never
//! times out.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointState {
    /// Nobody holds the barrier.
    Idle,
    /// A holder is waiting for mutators to park.
    BarrierRequested,
    /// Every other mutator is parked; the holder has exclusive access.
    AllParked,
}

#[derive(Debug)]
struct Inner {
    owner: Option<ThreadId>,
    state: SafepointState,
    mutators: Vec<ThreadId>,
    parked: usize,
}

impl Inner {
    fn held_by_other(&self, me: ThreadId) -> bool {
        self.owner.is_some_and(|owner| owner != me)
    }
}

/// Reentrancy counter for one thread's barrier acquisitions.
///
/// Owned by the acquiring thread and never shared.
#[derive(Debug, Default)]
pub struct LockDepth {
    depth: u32,
    _not_send: PhantomData<*const ()>,
}

impl LockDepth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.depth
    }
}

// =============================================================================
// SafepointCoordinator
// =============================================================================

#[derive(Debug)]
pub struct SafepointCoordinator {
    inner: Mutex<Inner>,
    cond: Condvar,
    /// Fast-path flag read by `poll`.
    requested: AtomicBool,
}

impl SafepointCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                owner: None,
                state: SafepointState::Idle,
                mutators: Vec::new(),
                parked: 0,
            }),
            cond: Condvar::new(),
            requested: AtomicBool::new(false),
        }
    }

    /// Acquire the barrier, or deepen an acquisition this thread already
    /// holds. On return every other registered mutator is parked.
    pub fn acquire_and_barrier(&self, depth: &mut LockDepth) {
        if depth.depth > 0 {
            depth.depth += 1;
            return;
        }

        let me = thread::current().id();
        let mut inner = self.inner.lock();
        let registered = inner.mutators.contains(&me);

        // A registered mutator waiting here is as good as parked.
        if registered {
            inner.parked += 1;
            self.cond.notify_all();
        }
        while inner.owner.is_some() {
            self.cond.wait(&mut inner);
        }
        if registered {
            inner.parked -= 1;
        }

        inner.owner = Some(me);
        inner.state = SafepointState::BarrierRequested;
        self.requested.store(true, Ordering::Release);
        trace!(target: "jitcore::jit", "safepoint barrier requested");

        loop {
            let others = inner.mutators.len() - usize::from(registered);
            if inner.parked >= others {
                break;
            }
            self.cond.wait(&mut inner);
        }
        inner.state = SafepointState::AllParked;
        depth.depth = 1;
    }

    /// Undo one acquisition. The outermost release resumes the mutators.
    pub fn release(&self, depth: &mut LockDepth) {
        assert!(depth.depth > 0, "safepoint released without being held");
        depth.depth -= 1;
        if depth.depth > 0 {
            return;
        }

        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.owner, Some(thread::current().id()));
        inner.owner = None;
        inner.state = SafepointState::Idle;
        self.requested.store(false, Ordering::Release);
        self.cond.notify_all();
        trace!(target: "jitcore::jit", "safepoint barrier released");
    }

    /// Acquire the barrier for the life of the returned guard.
    pub fn enter<'a>(&'a self, depth: &'a mut LockDepth) -> SafepointGuard<'a> {
        self.acquire_and_barrier(depth);
        SafepointGuard {
            coordinator: self,
            depth,
        }
    }

    /// Register the calling thread as a mutator. It must then call
    /// [`MutatorHandle::poll`] regularly.
    pub fn register_mutator(self: &Arc<Self>) -> MutatorHandle {
        let me = thread::current().id();
        let mut inner = self.inner.lock();
        // Joining while others are stopped would break the holder's view.
        while inner.held_by_other(me) {
            self.cond.wait(&mut inner);
        }
        inner.mutators.push(me);
        MutatorHandle {
            coordinator: Arc::clone(self),
            thread: me,
            _not_send: PhantomData,
        }
    }

    pub fn state(&self) -> SafepointState {
        self.inner.lock().state
    }

    /// Whether the calling thread holds the barrier.
    pub fn is_held(&self) -> bool {
        self.inner.lock().owner == Some(thread::current().id())
    }

    /// Number of registered mutators currently parked.
    pub fn parked_count(&self) -> usize {
        self.inner.lock().parked
    }

    pub fn mutator_count(&self) -> usize {
        self.inner.lock().mutators.len()
    }

    /// Count this thread as parked and wait out any barrier held by another
    /// thread.
    fn park(&self, me: ThreadId) {
        let mut inner = self.inner.lock();
        if !inner.held_by_other(me) {
            return;
        }
        inner.parked += 1;
        self.cond.notify_all();
        self.wait_unparked(&mut inner, me);
    }

    fn wait_unparked(&self, inner: &mut MutexGuard<'_, Inner>, me: ThreadId) {
        while inner.held_by_other(me) {
            self.cond.wait(inner);
        }
        inner.parked -= 1;
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SafepointGuard
// =============================================================================

/// Proof that the current thread holds the barrier. Releases one level on
/// drop.
pub struct SafepointGuard<'a> {
    coordinator: &'a SafepointCoordinator,
    depth: &'a mut LockDepth,
}

impl SafepointGuard<'_> {
    /// Acquire again from inside the held barrier.
    pub fn nest(&mut self) -> SafepointGuard<'_> {
        self.coordinator.acquire_and_barrier(self.depth);
        SafepointGuard {
            coordinator: self.coordinator,
            depth: &mut *self.depth,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth.depth
    }

    pub fn coordinator(&self) -> &SafepointCoordinator {
        self.coordinator
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.depth);
    }
}

// =============================================================================
// MutatorHandle
// =============================================================================

/// Registration of one mutator thread. Unregisters on drop.
pub struct MutatorHandle {
    coordinator: Arc<SafepointCoordinator>,
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl MutatorHandle {
    /// Safe point: park here while another thread holds the barrier.
    #[inline]
    pub fn poll(&self) {
        if self.coordinator.requested.load(Ordering::Acquire) {
            self.coordinator.park(self.thread);
        }
    }

    /// Run `f` as parked, e.g. around blocking I/O. On return the thread
    /// waits for any barrier in progress before resuming managed work.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Unblock<'a>(&'a SafepointCoordinator, ThreadId);

        impl Drop for Unblock<'_> {
            fn drop(&mut self) {
                let mut inner = self.0.inner.lock();
                self.0.wait_unparked(&mut inner, self.1);
            }
        }

        {
            let mut inner = self.coordinator.inner.lock();
            inner.parked += 1;
            self.coordinator.cond.notify_all();
        }
        let _unblock = Unblock(&self.coordinator, self.thread);
        f()
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        let mut inner = self.coordinator.inner.lock();
        if let Some(pos) = inner.mutators.iter().position(|t| *t == self.thread) {
            inner.mutators.swap_remove(pos);
        }
        self.coordinator.cond.notify_all();
    }
}
