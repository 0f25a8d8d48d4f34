//! Reference-counted objects that cooperate with weak references and
//! deletion subscriptions while being torn down.
//!
//! Every tracked value lives in an `ObjBox`-shaped allocation: a header
//! holding the strong count, the lazily created *shadow* record shared with
//! weak handles, and the deletion-subscription table, followed by the value
//! itself. [`Ref<T>`] and the type-erased [`ObjRef`] are strong handles;
//! [`WeakRef<T>`] and [`ObjWeak`] hold only the shadow and never keep the
//! value alive.
//!
//! The interesting part is the teardown handshake in `last_unref`: a weak
//! upgrade can race the final strong drop, so the drop re-checks the count
//! under the shadow mutex and walks away if the object was resurrected.
//! Once the shadow's object pointer is nullified no external entry point
//! can reach the object again, which is what makes the subscription drain
//! in `do_delete` safe to run without its own lock held.

use crate::state::{self, PendingDelete};
use crate::sync::{AtomicUsize, Mutex, Ordering, fence};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

/// A soft limit on the number of strong handles per object. Going past it
/// aborts, same as `alloc::sync::Arc`.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Handle to a deletion subscription, returned by
/// [`ObjRef::add_deletion_callback`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeletionKey(u64);

/// Record shared between an object and its weak handles.
///
/// Outlives the object whenever a weak handle does. `object` doubles as the
/// liveness flag: upgrades succeed exactly while it is `Some`.
pub(crate) struct Shadow {
    state: Mutex<ShadowState>,
}

struct ShadowState {
    object: Option<NonNull<Header>>,
    /// Pending `last_unref` duties: 1 at shadow creation, +1 for every weak
    /// upgrade that observes a zero strong count, -1 when a `last_unref`
    /// call completes. The call that takes it to zero deletes the object.
    lastref_count: usize,
}

// SAFETY: the header pointer is only dereferenced under the protocol below;
// the pointee is Send + Sync by construction.
unsafe impl Send for ShadowState {}
unsafe impl Sync for ShadowState {}

/// Per-object header; first field of every tracked allocation.
struct Header {
    strong: AtomicUsize,
    shadow: Mutex<Option<Arc<Shadow>>>,
    subscriptions: Mutex<SubscriptionTable>,
    drop_fn: unsafe fn(NonNull<Header>),
}

#[repr(C)]
struct ObjBox<T> {
    header: Header,
    value: T,
}

struct SubscriptionTable {
    next_key: u64,
    records: VecDeque<DeletionRecord>,
}

struct DeletionRecord {
    key: u64,
    guard: RecordGuard,
    action: DeletionAction,
}

enum RecordGuard {
    /// Fires unconditionally during the subject's teardown.
    None,
    /// Guarded by the subject itself; fires during teardown, no pin.
    Subject,
    /// Guarded by a distinct peer. `pinned` is populated when the subject's
    /// teardown commits, so the peer cannot die between the commit and the
    /// drain.
    Peer {
        weak: ObjWeak,
        mutual_key: Option<u64>,
        pinned: Option<ObjRef>,
    },
}

enum DeletionAction {
    Invoke(Box<dyn FnOnce() + Send>),
    /// Mirror half of a mutual pair: drop record `peer_key` from the peer.
    Unlink { peer_key: u64 },
}

impl SubscriptionTable {
    fn new() -> Self {
        SubscriptionTable {
            next_key: 1,
            records: VecDeque::new(),
        }
    }

    fn alloc_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn detach(&mut self, key: u64) -> Option<DeletionRecord> {
        let index = self.records.iter().position(|r| r.key == key)?;
        self.records.remove(index)
    }
}

unsafe fn drop_obj<T>(ptr: NonNull<Header>) {
    // SAFETY: `ptr` is the first field of a leaked `ObjBox<T>`; repr(C)
    // makes the cast exact, and the caller owns the allocation.
    drop(unsafe { Box::from_raw(ptr.cast::<ObjBox<T>>().as_ptr()) });
}

unsafe fn resume_delete(ptr: NonNull<()>) {
    do_delete(ptr.cast::<Header>());
}

/// Type-erased strong handle. Clone increments the strong count, drop
/// decrements it and runs the teardown protocol when it hits zero.
pub struct ObjRef {
    ptr: NonNull<Header>,
}

// SAFETY: the pointee is an ObjBox whose value was required to be
// Send + Sync + 'static at construction; the header itself is all atomics
// and mutexes.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

/// Type-erased weak handle; holds only the shadow.
pub struct ObjWeak {
    shadow: Arc<Shadow>,
}

impl ObjRef {
    fn header(&self) -> &Header {
        // SAFETY: a strong handle keeps the allocation alive.
        unsafe { self.ptr.as_ref() }
    }

    /// True when both handles point at the same object.
    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        self.ptr == other.ptr
    }

    /// Returns a weak handle, creating the shadow on first use.
    pub fn downgrade(&self) -> ObjWeak {
        let mut slot = self.header().shadow.lock();
        let shadow = slot.get_or_insert_with(|| {
            Arc::new(Shadow {
                state: Mutex::new(ShadowState {
                    object: Some(self.ptr),
                    lastref_count: 1,
                }),
            })
        });
        ObjWeak {
            shadow: shadow.clone(),
        }
    }

    /// Registers `cb` to fire when this object is torn down.
    ///
    /// With a `guard`, the callback only fires while the guard object is
    /// still alive, and the two objects are mutually subscribed: whichever
    /// dies first silently unhooks the other side. A guard equal to the
    /// subject itself is allowed and fires like an unguarded callback.
    pub fn add_deletion_callback<F>(&self, guard: Option<&ObjRef>, cb: F) -> DeletionKey
    where
        F: FnOnce() + Send + 'static,
    {
        let header = self.header();
        match guard {
            Some(peer) if !peer.ptr_eq(self) => {
                let key = header.subscriptions.lock().alloc_key();
                // The mirror goes in first; if the peer dies in the window
                // before our record lands, its Unlink is a no-op and the
                // stale mutual key is removed idempotently later.
                let mirror_key = peer.insert_record(
                    RecordGuard::Peer {
                        weak: self.downgrade(),
                        mutual_key: None,
                        pinned: None,
                    },
                    DeletionAction::Unlink { peer_key: key },
                );
                header.subscriptions.lock().records.push_back(DeletionRecord {
                    key,
                    guard: RecordGuard::Peer {
                        weak: peer.downgrade(),
                        mutual_key: Some(mirror_key),
                        pinned: None,
                    },
                    action: DeletionAction::Invoke(Box::new(cb)),
                });
                DeletionKey(key)
            }
            Some(_) => self.push_record(RecordGuard::Subject, Box::new(cb)),
            None => self.push_record(RecordGuard::None, Box::new(cb)),
        }
    }

    fn push_record(&self, guard: RecordGuard, cb: Box<dyn FnOnce() + Send>) -> DeletionKey {
        let mut table = self.header().subscriptions.lock();
        let key = table.alloc_key();
        table.records.push_back(DeletionRecord {
            key,
            guard,
            action: DeletionAction::Invoke(cb),
        });
        DeletionKey(key)
    }

    fn insert_record(&self, guard: RecordGuard, action: DeletionAction) -> u64 {
        let mut table = self.header().subscriptions.lock();
        let key = table.alloc_key();
        table.records.push_back(DeletionRecord { key, guard, action });
        key
    }

    /// Drops the subscription without firing it. Removes the mirror from a
    /// still-live peer. Idempotent; racing the peer's own teardown is
    /// resolved by the peer's drain taking ownership of the mirror.
    pub fn remove_deletion_callback(&self, key: DeletionKey) {
        let record = { self.header().subscriptions.lock().detach(key.0) };
        let Some(record) = record else { return };
        if let RecordGuard::Peer {
            weak,
            mutual_key: Some(mirror_key),
            ..
        } = &record.guard
        {
            if let Some(peer) = weak.upgrade() {
                peer.detach_record(*mirror_key);
            }
        }
    }

    /// Detach-and-drop without mutual bookkeeping; used for mirror halves.
    fn detach_record(&self, key: u64) {
        let _record = { self.header().subscriptions.lock().detach(key) };
    }

    /// Keeps this object alive until `master` is torn down.
    ///
    /// Binding an object to its own deletion is rejected with a warning.
    pub fn unref_on_deletion(&self, master: &ObjRef) {
        if master.ptr_eq(self) {
            log::warn!("unref_on_deletion: binding an object to its own deletion");
            return;
        }
        let held = self.clone();
        master.add_deletion_callback(Some(self), move || drop(held));
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.header().subscriptions.lock().records.len()
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        let old = self.header().strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        ObjRef { ptr: self.ptr }
    }
}

impl Drop for ObjRef {
    fn drop(&mut self) {
        if self.header().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        last_unref(self.ptr);
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.ptr)
    }
}

impl Clone for ObjWeak {
    fn clone(&self) -> Self {
        ObjWeak {
            shadow: self.shadow.clone(),
        }
    }
}

impl ObjWeak {
    /// Attempts to pin the object against teardown.
    ///
    /// Either the teardown has not committed yet — then the returned strong
    /// handle postpones it — or the shadow has been nullified and this
    /// returns `None`. There is no in-between.
    pub fn upgrade(&self) -> Option<ObjRef> {
        let mut shadow = self.shadow.state.lock();
        let ptr = shadow.object?;
        // SAFETY: while `object` is set, teardown has not started and the
        // header is live.
        let header = unsafe { ptr.as_ref() };
        let old = header.strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        if old == 0 {
            // Resurrected between a final drop and its shadow-mutex
            // acquisition; the pending last_unref will see the count and
            // this duty re-arms it.
            shadow.lastref_count += 1;
        }
        Some(ObjRef { ptr })
    }
}

impl fmt::Debug for ObjWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.shadow.state.lock().object.is_some();
        write!(f, "ObjWeak {{ live: {live} }}")
    }
}

/// Runs when a strong count hits zero. May be called several times for one
/// object when weak upgrades sneak in ref/unref pairs; the shadow's
/// `lastref_count` decides which call actually deletes.
fn last_unref(ptr: NonNull<Header>) {
    // SAFETY: the caller just observed the count drop to zero; the
    // allocation stays live until a last_unref call commits deletion, and
    // commitment is serialized below.
    let header = unsafe { ptr.as_ref() };

    let shadow = header.shadow.lock().clone();
    let Some(shadow) = shadow else {
        // No weak handle was ever taken, so no resurrection is possible.
        do_delete(ptr);
        return;
    };

    {
        let mut state = shadow.state.lock();
        if header.strong.load(Ordering::Acquire) > 0 {
            // Re-referenced through a weak handle before we took the shadow
            // mutex. The upgrade re-armed lastref_count; this call's duty
            // is complete.
            state.lastref_count -= 1;
            return;
        }

        // Commit: no weak upgrade can succeed from here on, and therefore
        // no external caller can reach this object again.
        state.object = None;

        debug_assert!(state.lastref_count > 0);
        state.lastref_count -= 1;
        if state.lastref_count > 0 {
            // More last_unref calls are still in flight from sneaked
            // ref/unref pairs; the final one continues the teardown.
            return;
        }
    }

    // Peers can no longer unhook themselves (their removals would need a
    // weak upgrade), so pin each one now: the drain below, which may be
    // deferred past this thread's state mutexes, must find them alive.
    pin_peers(header);

    // Release the shadow's self-reference; weak handles keep the record
    // alive on their own.
    *header.shadow.lock() = None;

    do_delete(ptr);
}

fn pin_peers(header: &Header) {
    let mut table = header.subscriptions.lock();
    for record in table.records.iter_mut() {
        if let RecordGuard::Peer { weak, pinned, .. } = &mut record.guard {
            *pinned = weak.upgrade();
        }
    }
}

/// Final teardown: drains deletion subscriptions and runs the destructor,
/// or parks the object on the thread's deletion queue when a state mutex
/// is held (the destructor must not run under one).
fn do_delete(ptr: NonNull<Header>) {
    if state::state_mutex_held() {
        state::queue_deletion(PendingDelete {
            ptr: ptr.cast(),
            resume: resume_delete,
        });
        return;
    }

    // SAFETY: teardown is committed and this call owns the allocation.
    let header = unsafe { ptr.as_ref() };

    // One record at a time: a callback may add further subscriptions on the
    // dying object and the drain must pick those up too.
    loop {
        let record = { header.subscriptions.lock().records.pop_front() };
        let Some(record) = record else { break };
        run_record(record);
    }

    log::trace!("object {:p}: destroyed", ptr);
    // SAFETY: subscriptions are drained and nothing else can reach the
    // allocation; drop_fn frees the ObjBox this header heads.
    unsafe { (header.drop_fn)(ptr) };
}

fn run_record(record: DeletionRecord) {
    match record.guard {
        RecordGuard::None | RecordGuard::Subject => {
            if let DeletionAction::Invoke(cb) = record.action {
                cb();
            }
        }
        RecordGuard::Peer {
            weak,
            mutual_key,
            pinned,
        } => {
            // `pinned` is set when the subject had a shadow at teardown;
            // otherwise no weak handle ever existed and the peer is pinned
            // here instead.
            let Some(peer) = pinned.or_else(|| weak.upgrade()) else {
                // Peer died first; its own drain disposed of the mirror.
                return;
            };
            if let Some(mirror_key) = mutual_key {
                peer.detach_record(mirror_key);
            }
            match record.action {
                DeletionAction::Invoke(cb) => cb(),
                DeletionAction::Unlink { peer_key } => peer.detach_record(peer_key),
            }
        }
    }
}

/// Strong handle to a `T` with the full lifecycle protocol attached.
pub struct Ref<T> {
    any: ObjRef,
    _marker: PhantomData<fn() -> T>,
}

/// Weak counterpart of [`Ref<T>`].
pub struct WeakRef<T> {
    any: ObjWeak,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Ref<T> {
    /// Moves `value` into a tracked allocation with a strong count of one.
    pub fn new(value: T) -> Ref<T> {
        let boxed = Box::new(ObjBox {
            header: Header {
                strong: AtomicUsize::new(1),
                shadow: Mutex::new(None),
                subscriptions: Mutex::new(SubscriptionTable::new()),
                drop_fn: drop_obj::<T>,
            },
            value,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        Ref {
            any: ObjRef { ptr: ptr.cast() },
            _marker: PhantomData,
        }
    }

    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef {
            any: self.any.downgrade(),
            _marker: PhantomData,
        }
    }

    /// Borrows the type-erased handle, e.g. to pass as a callback owner.
    pub fn as_obj(&self) -> &ObjRef {
        &self.any
    }

    /// Clones into a type-erased handle.
    pub fn erase(&self) -> ObjRef {
        self.any.clone()
    }

    pub fn add_deletion_callback<F>(&self, guard: Option<&ObjRef>, cb: F) -> DeletionKey
    where
        F: FnOnce() + Send + 'static,
    {
        self.any.add_deletion_callback(guard, cb)
    }

    pub fn remove_deletion_callback(&self, key: DeletionKey) {
        self.any.remove_deletion_callback(key)
    }

    pub fn unref_on_deletion(&self, master: &ObjRef) {
        self.any.unref_on_deletion(master)
    }
}

impl<T: Send + Sync + 'static> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the handle keeps the ObjBox<T> alive, and Ref<T> is only
        // ever constructed over an allocation of exactly that shape.
        unsafe { &self.any.ptr.cast::<ObjBox<T>>().as_ref().value }
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            any: self.any.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:?})", &**self)
    }
}

impl<T: Send + Sync + 'static> WeakRef<T> {
    pub fn upgrade(&self) -> Option<Ref<T>> {
        Some(Ref {
            any: self.any.upgrade()?,
            _marker: PhantomData,
        })
    }

    /// Clones into a type-erased weak handle.
    pub fn erase(&self) -> ObjWeak {
        self.any.clone()
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        WeakRef {
            any: self.any.clone(),
            _marker: PhantomData,
        }
    }
}
