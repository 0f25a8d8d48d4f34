//! Typed one-to-many event delivery with liveness-gated subscribers.
//!
//! An [`Informer<T>`] keeps an ordered list of [`Cb<T>`] subscriptions.
//! `T` is the per-subscriber payload: usually a struct of boxed callbacks
//! (a handler table), sometimes just a `fn` pointer type. Delivery walks
//! the list in subscription order, releases the informer's mutex around
//! every invocation, upgrades each subscriber's owner first and skips the
//! dead ones.
//!
//! Unsubscription is legal from inside a callback and from the owner's own
//! teardown: while a traversal is in progress entries are only marked
//! invalid, and the last traversal to finish sweeps them out.

use crate::cb::Cb;
use crate::object::{DeletionKey, ObjRef, ObjWeak};
use crate::state::StateMutex;
use std::sync::Arc;

/// Handle to one subscription, returned by [`Informer::subscribe`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SubscriptionKey(u64);

struct Entry<T: ?Sized> {
    key: u64,
    valid: bool,
    oneshot: bool,
    cb: Cb<T>,
    /// Deletion record registered on the owner; removed again when the
    /// subscription goes away first.
    owner_del: Option<(ObjWeak, DeletionKey)>,
}

struct InformerState<T: ?Sized> {
    next_key: u64,
    /// Number of `inform_all` walks currently inside the list. While
    /// nonzero the entry vector is append-only, which is what keeps the
    /// walks' indices stable.
    traversing: u32,
    entries: Vec<Entry<T>>,
}

struct Shared<T: ?Sized> {
    state: StateMutex<InformerState<T>>,
}

/// Multi-subscriber event hub. Cheap to clone; clones share the list.
pub struct Informer<T: ?Sized> {
    shared: Arc<Shared<T>>,
}

impl<T: ?Sized> Clone for Informer<T> {
    fn clone(&self) -> Self {
        Informer {
            shared: self.shared.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Informer<T> {
    pub fn new() -> Self {
        Informer {
            shared: Arc::new(Shared {
                state: StateMutex::new(InformerState {
                    next_key: 1,
                    traversing: 0,
                    entries: Vec::new(),
                }),
            }),
        }
    }

    /// Adds a subscription. Events informed after this returns are
    /// delivered to it, on whichever thread informs them, until the
    /// subscription is removed or its owner dies.
    pub fn subscribe(&self, cb: Cb<T>) -> SubscriptionKey {
        self.subscribe_with(cb, false)
    }

    /// Like [`subscribe`](Self::subscribe), but the subscription is
    /// dropped after its first delivery.
    pub fn subscribe_oneshot(&self, cb: Cb<T>) -> SubscriptionKey {
        self.subscribe_with(cb, true)
    }

    fn subscribe_with(&self, cb: Cb<T>, oneshot: bool) -> SubscriptionKey {
        let key = {
            let mut state = self.shared.state.lock();
            let key = state.next_key;
            state.next_key += 1;
            key
        };

        // Wire the owner's death to this entry before the entry can fire:
        // the callback owns nothing but a weak handle and the key, so
        // either side may disappear first.
        let owner_del = cb.owner().cloned().and_then(|weak| {
            let owner = weak.upgrade()?;
            let shared = Arc::downgrade(&self.shared);
            let del_key = owner.add_deletion_callback(None, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.invalidate(key);
                }
            });
            Some((weak, del_key))
        });

        self.shared.state.lock().entries.push(Entry {
            key,
            valid: true,
            oneshot,
            cb,
            owner_del,
        });
        SubscriptionKey(key)
    }

    /// Removes a subscription. Idempotent; callable from any thread and
    /// from inside a delivery callback.
    pub fn unsubscribe(&self, key: SubscriptionKey) {
        let owner_del = {
            let mut state = self.shared.state.lock();
            let Some(index) = state.entries.iter().position(|e| e.key == key.0) else {
                return;
            };
            if state.traversing > 0 {
                state.entries[index].valid = false;
                state.entries[index].owner_del.take()
            } else {
                let entry = state.entries.remove(index);
                entry.owner_del
            }
        };
        remove_owner_del(owner_del);
    }

    /// Delivers one event to every live subscriber, in subscription order.
    ///
    /// `inform` is called once per live entry with the entry's payload; the
    /// informer's mutex is not held during the call and the entry's owner
    /// is pinned. Subscribers added while the walk is in progress are
    /// reached by the same walk once it gets to them.
    pub fn inform_all(&self, mut inform: impl FnMut(&T)) {
        let mut retired_dels = Vec::new();

        let mut state = self.shared.state.lock();
        state.traversing += 1;
        let mut index = 0;
        while index < state.entries.len() {
            let entry = &state.entries[index];
            index += 1;
            if !entry.valid {
                continue;
            }
            let cb = entry.cb.clone();
            let oneshot = entry.oneshot;

            drop(state);
            let fired = cb.call(|payload| inform(payload)).is_some();
            state = self.shared.state.lock();

            if (fired && oneshot) || !fired {
                // Entries cannot move while traversing, so index - 1 still
                // names the same entry. A miss (`!fired`) means the owner
                // is gone; retire the entry instead of re-skipping it on
                // every future walk.
                let entry = &mut state.entries[index - 1];
                entry.valid = false;
                if let Some(del) = entry.owner_del.take() {
                    retired_dels.push(del);
                }
            }
        }
        state.traversing -= 1;
        if state.traversing == 0 {
            state.entries.retain(|e| e.valid);
        }
        drop(state);

        for del in retired_dels {
            remove_owner_del(Some(del));
        }
    }

    /// Number of live subscriptions; dead-but-unswept entries are not
    /// counted.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| e.valid)
            .count()
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for Informer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Shared<T> {
    /// Owner-death path: flag the entry down, sweep it right away when no
    /// walk is in progress. Runs outside every state mutex (deletion
    /// callbacks are dispatched from the teardown drain).
    fn invalidate(&self, key: u64) {
        let mut state = self.state.lock();
        let Some(index) = state.entries.iter().position(|e| e.key == key) else {
            return;
        };
        state.entries[index].valid = false;
        state.entries[index].owner_del = None;
        if state.traversing == 0 {
            state.entries.remove(index);
        }
    }
}

fn remove_owner_del(owner_del: Option<(ObjWeak, DeletionKey)>) {
    if let Some((weak, del_key)) = owner_del {
        if let Some(owner) = weak.upgrade() {
            owner.remove_deletion_callback(del_key);
        }
    }
}

// Convenience: subscribing an owner-guarded handler table.
impl<T: Send + Sync + 'static> Informer<T> {
    /// Shorthand for `subscribe(Cb::new(Arc::new(table), owner))`.
    pub fn subscribe_table(&self, table: T, owner: &ObjRef) -> SubscriptionKey {
        self.subscribe(Cb::new(Arc::new(table), owner))
    }
}
