use crate::deferred::DeferredProcessor;
use crate::state::StateMutex;
use crate::Ref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn tasks_run_in_first_schedule_order() {
    let processor = DeferredProcessor::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let order = order.clone();
            processor.task(move || {
                order.lock().unwrap().push(i);
                false
            })
        })
        .collect();

    for task in &tasks {
        task.schedule();
    }
    // Re-scheduling an already queued task must not move it.
    tasks[0].schedule();

    assert!(processor.process());
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn schedule_is_oneshot() {
    let processor = DeferredProcessor::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let task = processor.task(move || {
        runs2.fetch_add(1, Ordering::SeqCst);
        false
    });

    task.schedule();
    assert!(processor.process());
    assert!(!processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn unschedule_cancels_and_is_idempotent() {
    let processor = DeferredProcessor::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let task = processor.task(move || {
        runs2.fetch_add(1, Ordering::SeqCst);
        false
    });

    task.schedule();
    task.unschedule();
    task.unschedule();
    assert!(!processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // The task is still usable afterwards.
    task.schedule();
    assert!(processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn self_reschedule_lands_on_next_drain() {
    let processor = DeferredProcessor::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let task = processor.task(move || {
        // Reschedule exactly once.
        runs2.fetch_add(1, Ordering::SeqCst) == 0
    });

    task.schedule();
    assert!(processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!processor.process());
}

#[test]
fn guarded_task_skipped_after_owner_death() {
    let processor = DeferredProcessor::new();
    let owner = Ref::new(());
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let task = processor.task_guarded(
        move || {
            runs2.fetch_add(1, Ordering::SeqCst);
            false
        },
        owner.as_obj().downgrade(),
    );

    task.schedule();
    assert!(processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    drop(owner);
    task.schedule();
    assert!(!processor.process());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn drained_at_state_mutex_release() {
    let processor = DeferredProcessor::new();
    processor.attach_current_thread();
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let task = processor.task(move || {
        ran2.store(true, Ordering::SeqCst);
        false
    });

    let mutex = StateMutex::new(());
    {
        let _guard = mutex.lock();
        task.schedule();
        assert!(!ran.load(Ordering::SeqCst));
    }
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn cross_thread_schedule_invokes_wakeup() {
    let processor = DeferredProcessor::new();
    processor.attach_current_thread();
    let woken = Arc::new(AtomicBool::new(false));
    let woken2 = woken.clone();
    processor.set_wakeup(move || {
        woken2.store(true, Ordering::SeqCst);
    });

    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let task = processor.task(move || {
        ran2.store(true, Ordering::SeqCst);
        false
    });

    let task = Arc::new(task);
    let remote = task.clone();
    thread::spawn(move || remote.schedule()).join().unwrap();

    assert!(woken.load(Ordering::SeqCst));
    assert!(processor.process());
    assert!(ran.load(Ordering::SeqCst));
}
