//! State mutexes and the per-thread drain point.
//!
//! A *state mutex* guards mutable state whose updates may drop the last
//! strong reference to an object. Destructors must never run while such a
//! mutex is held, so every thread keeps a lock-depth counter and a queue of
//! pending destructions. When the depth returns to zero the queue is
//! drained, and the thread's attached [`DeferredProcessor`] runs right
//! after it.
//!
//! [`DeferredProcessor`]: crate::deferred::DeferredProcessor

use crate::sync::{Mutex, MutexGuard};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Weak;

/// A destruction that could not run at the point the refcount hit zero.
///
/// Type-erased so the queue does not allocate per entry; `resume` re-enters
/// the object module's teardown with the header pointer.
pub(crate) struct PendingDelete {
    pub(crate) ptr: NonNull<()>,
    pub(crate) resume: unsafe fn(NonNull<()>),
}

/// Hook run at the drain point, after the deletion queue. Implemented by
/// the deferred processor attached to this thread.
pub(crate) trait DrainHook: Send + Sync {
    fn drain_deferred(&self) -> bool;
}

struct ThreadState {
    mutex_depth: Cell<u32>,
    deletions: RefCell<VecDeque<PendingDelete>>,
    draining: Cell<bool>,
    drain_hook: RefCell<Option<Weak<dyn DrainHook>>>,
}

thread_local! {
    static TLOCAL: ThreadState = ThreadState {
        mutex_depth: Cell::new(0),
        deletions: RefCell::new(VecDeque::new()),
        draining: Cell::new(false),
        drain_hook: RefCell::new(None),
    };
}

/// True while the current thread holds at least one state mutex.
pub(crate) fn state_mutex_held() -> bool {
    TLOCAL.with(|t| t.mutex_depth.get() > 0)
}

/// Queues a teardown to run when the current thread releases its last
/// state mutex. Only call when [`state_mutex_held`] is true.
pub(crate) fn queue_deletion(pending: PendingDelete) {
    TLOCAL.with(|t| t.deletions.borrow_mut().push_back(pending));
}

/// Attaches `hook` as the current thread's deferred-drain target,
/// replacing any previous one.
pub(crate) fn set_drain_hook(hook: Weak<dyn DrainHook>) {
    TLOCAL.with(|t| *t.drain_hook.borrow_mut() = Some(hook));
}

fn enter_state_mutex() {
    TLOCAL.with(|t| t.mutex_depth.set(t.mutex_depth.get() + 1));
}

fn exit_state_mutex() {
    TLOCAL.with(|t| {
        let depth = t.mutex_depth.get() - 1;
        t.mutex_depth.set(depth);
        if depth == 0 {
            drain_thread(t);
        }
    });
}

/// Runs queued destructions, then the thread's deferred processor, then any
/// destructions the deferred tasks produced. The flag stops the nested
/// drains that destructors cause by taking and releasing state mutexes of
/// their own.
fn drain_thread(t: &ThreadState) {
    if t.draining.get() {
        return;
    }
    t.draining.set(true);

    drain_deletions(t);

    let hook = t.drain_hook.borrow().as_ref().and_then(Weak::upgrade);
    if let Some(hook) = hook {
        hook.drain_deferred();
        drain_deletions(t);
    }

    t.draining.set(false);
}

fn drain_deletions(t: &ThreadState) {
    loop {
        let pending = t.deletions.borrow_mut().pop_front();
        let Some(pending) = pending else { break };
        // SAFETY: the entry was queued by do_delete with a pointer to a
        // live header whose teardown is suspended; resuming consumes it.
        unsafe { (pending.resume)(pending.ptr) };
    }
}

/// Mutex participating in the deferred-destruction protocol.
///
/// Locking bumps the thread's state-mutex depth; the guard's drop releases
/// the inner lock first and only then, if the depth returned to zero,
/// drains the thread's queues. Use this for any state from which an object
/// teardown can be reached; use a plain mutex everywhere else.
pub struct StateMutex<T: ?Sized> {
    inner: Mutex<T>,
}

impl<T> StateMutex<T> {
    pub fn new(value: T) -> Self {
        StateMutex {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> StateMutexGuard<'_, T> {
        enter_state_mutex();
        StateMutexGuard {
            inner: ManuallyDrop::new(self.inner.lock()),
        }
    }
}

pub struct StateMutexGuard<'a, T: ?Sized> {
    inner: ManuallyDrop<MutexGuard<'a, T>>,
}

impl<T: ?Sized> Deref for StateMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for StateMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized> Drop for StateMutexGuard<'_, T> {
    fn drop(&mut self) {
        // The inner lock must be gone before destructors run.
        // SAFETY: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        exit_state_mutex();
    }
}
