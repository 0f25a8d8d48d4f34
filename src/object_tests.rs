use crate::state::StateMutex;
use crate::{Ref, WeakRef};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn live_upgrade_some() {
    let obj = Ref::new(42);
    let weak = obj.downgrade();

    let strong = weak.upgrade().unwrap();
    assert_eq!(*strong, 42);
}

#[test]
fn dead_upgrade_none() {
    let obj = Ref::new(42);
    let weak = obj.downgrade();
    drop(obj);

    assert!(weak.upgrade().is_none());
}

#[test]
fn upgrade_pins_against_teardown() {
    let dropped = Arc::new(AtomicBool::new(false));
    let obj = Ref::new(DropFlag(dropped.clone()));
    let weak = obj.downgrade();

    let pin = weak.upgrade().unwrap();
    drop(obj);
    assert!(!dropped.load(Ordering::SeqCst));

    drop(pin);
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn deletion_callback_fires_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let obj = Ref::new(());
    let fired2 = fired.clone();
    obj.add_deletion_callback(None, move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });

    let extra = obj.clone();
    drop(obj);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    drop(extra);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn removed_deletion_callback_does_not_fire() {
    let fired = Arc::new(AtomicBool::new(false));
    let obj = Ref::new(());
    let fired2 = fired.clone();
    let key = obj.add_deletion_callback(None, move || {
        fired2.store(true, Ordering::SeqCst);
    });
    obj.remove_deletion_callback(key);
    // Double removal is a no-op.
    obj.remove_deletion_callback(key);

    drop(obj);
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn self_guarded_callback_fires() {
    let fired = Arc::new(AtomicBool::new(false));
    let obj = Ref::new(());
    let fired2 = fired.clone();
    let guard = obj.erase();
    obj.add_deletion_callback(Some(&guard), move || {
        fired2.store(true, Ordering::SeqCst);
    });
    drop(guard);

    drop(obj);
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn mutual_deletion_unhooks_the_survivor() {
    // A watches B's deletion, guarded by A. Killing A first must scrub the
    // record off B without firing anything.
    let fired = Arc::new(AtomicBool::new(false));
    let a = Ref::new(());
    let b = Ref::new(());

    let fired2 = fired.clone();
    b.add_deletion_callback(Some(a.as_obj()), move || {
        fired2.store(true, Ordering::SeqCst);
    });
    assert_eq!(a.as_obj().subscription_count(), 1);
    assert_eq!(b.as_obj().subscription_count(), 1);

    drop(a);
    assert!(!fired.load(Ordering::SeqCst));
    assert_eq!(b.as_obj().subscription_count(), 0);

    drop(b);
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn guarded_callback_fires_while_peer_lives() {
    let fired = Arc::new(AtomicBool::new(false));
    let a = Ref::new(());
    let b = Ref::new(());

    let fired2 = fired.clone();
    b.add_deletion_callback(Some(a.as_obj()), move || {
        fired2.store(true, Ordering::SeqCst);
    });

    drop(b);
    assert!(fired.load(Ordering::SeqCst));
    // The mirror was cancelled on A during B's teardown.
    assert_eq!(a.as_obj().subscription_count(), 0);
}

#[test]
fn remove_mutual_callback_scrubs_both_sides() {
    let a = Ref::new(());
    let b = Ref::new(());

    let key = b.add_deletion_callback(Some(a.as_obj()), || {});
    b.remove_deletion_callback(key);

    assert_eq!(a.as_obj().subscription_count(), 0);
    assert_eq!(b.as_obj().subscription_count(), 0);
}

#[test]
fn unref_on_deletion_outlives_until_master_dies() {
    let obj = Ref::new(42);
    let weak = obj.downgrade();
    let master = Ref::new(());

    obj.unref_on_deletion(master.as_obj());
    drop(obj);
    assert_eq!(*weak.upgrade().unwrap(), 42);

    drop(master);
    assert!(weak.upgrade().is_none());
}

#[test]
fn unref_on_deletion_to_self_is_rejected() {
    let obj = Ref::new(());
    let weak = obj.downgrade();
    obj.unref_on_deletion(obj.as_obj());

    drop(obj);
    assert!(weak.upgrade().is_none());
}

#[test]
fn no_upgrade_from_inside_deletion_callback() {
    let saw_live = Arc::new(AtomicBool::new(false));
    let obj = Ref::new(());
    let weak: WeakRef<()> = obj.downgrade();
    let saw = saw_live.clone();
    obj.add_deletion_callback(None, move || {
        saw.store(weak.upgrade().is_some(), Ordering::SeqCst);
    });

    drop(obj);
    assert!(!saw_live.load(Ordering::SeqCst));
}

#[test]
fn destruction_deferred_while_state_mutex_held() {
    let dropped = Arc::new(AtomicBool::new(false));
    let mutex = StateMutex::new(());
    let obj = Ref::new(DropFlag(dropped.clone()));

    {
        let _guard = mutex.lock();
        drop(obj);
        // Still parked on the thread's deletion queue.
        assert!(!dropped.load(Ordering::SeqCst));
    }
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn deferred_destruction_runs_deletion_callbacks() {
    let fired = Arc::new(AtomicBool::new(false));
    let mutex = StateMutex::new(());
    let obj = Ref::new(());
    let fired2 = fired.clone();
    obj.add_deletion_callback(None, move || {
        fired2.store(true, Ordering::SeqCst);
    });

    {
        let _guard = mutex.lock();
        drop(obj);
        assert!(!fired.load(Ordering::SeqCst));
    }
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn resurrection_race_destroys_exactly_once() {
    for _ in 0..200 {
        let drops = Arc::new(AtomicUsize::new(0));
        let obj = Ref::new(DropCounter(drops.clone()));
        let weak = obj.downgrade();

        let dropper = thread::spawn(move || drop(obj));
        let upgrader = thread::spawn(move || {
            let mut wins = 0u32;
            for _ in 0..8 {
                if let Some(pin) = weak.upgrade() {
                    wins += 1;
                    drop(pin);
                }
            }
            wins
        });

        dropper.join().unwrap();
        upgrader.join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn concurrent_mutual_teardown_is_clean() {
    for _ in 0..100 {
        let a = Ref::new(());
        let b = Ref::new(());
        a.add_deletion_callback(Some(b.as_obj()), || {});
        b.add_deletion_callback(Some(a.as_obj()), || {});

        let ta = thread::spawn(move || drop(a));
        let tb = thread::spawn(move || drop(b));
        ta.join().unwrap();
        tb.join().unwrap();
    }
}
