//! One-shot tasks that run on a designated thread, outside all state
//! mutexes.
//!
//! A [`DeferredProcessor`] is drained at the top of every poll-group
//! iteration and whenever its thread releases its last state mutex. Tasks
//! scheduled from foreign threads travel through a lock-free side channel
//! and poke the processor's wakeup callback so a blocked readiness wait
//! notices them.

use crate::object::ObjWeak;
use crate::state::{self, DrainHook};
use crate::sync::{AtomicBool, Mutex, Ordering};
use crossbeam_queue::SegQueue;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

type TaskCallback = Box<dyn FnMut() -> bool + Send>;

struct TaskState {
    /// The task should run at the next drain.
    scheduled: bool,
    /// The task is physically linked into a queue. Stays true after an
    /// unschedule until the drain pops the entry, which keeps a
    /// re-schedule from linking it twice; the first schedule decides the
    /// task's position.
    queued: bool,
}

struct TaskInner {
    cb: Mutex<TaskCallback>,
    owner: Option<ObjWeak>,
    state: Mutex<TaskState>,
    processor: Weak<ProcessorInner>,
}

/// Handle to a registered task. Dropping it unschedules the task.
pub struct DeferredTask {
    inner: Arc<TaskInner>,
}

struct ProcessorInner {
    queue: Mutex<VecDeque<Arc<TaskInner>>>,
    /// Cross-thread schedules land here; merged into `queue` at each drain.
    incoming: SegQueue<Arc<TaskInner>>,
    wakeup: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    thread: Mutex<Option<ThreadId>>,
    processing: AtomicBool,
}

/// FIFO queue of one-shot callbacks bound to one event thread.
pub struct DeferredProcessor {
    inner: Arc<ProcessorInner>,
}

impl DeferredProcessor {
    pub fn new() -> Self {
        DeferredProcessor {
            inner: Arc::new(ProcessorInner {
                queue: Mutex::new(VecDeque::new()),
                incoming: SegQueue::new(),
                wakeup: Mutex::new(None),
                thread: Mutex::new(None),
                processing: AtomicBool::new(false),
            }),
        }
    }

    /// Binds the processor to the calling thread and registers it as that
    /// thread's drain hook, so it also runs when the thread releases its
    /// last state mutex.
    pub fn attach_current_thread(&self) {
        *self.inner.thread.lock() = Some(thread::current().id());
        state::set_drain_hook(Arc::downgrade(&self.inner) as Weak<dyn DrainHook>);
    }

    /// Installs the callback used to wake the owning thread when a task is
    /// scheduled from elsewhere. The poll group wires this to its trigger.
    pub fn set_wakeup(&self, wakeup: impl Fn() + Send + Sync + 'static) {
        *self.inner.wakeup.lock() = Some(Box::new(wakeup));
    }

    /// Registers `cb`. The task runs each time it is scheduled; returning
    /// `true` re-schedules it onto the *next* drain.
    pub fn task(&self, cb: impl FnMut() -> bool + Send + 'static) -> DeferredTask {
        self.new_task(Box::new(cb), None)
    }

    /// Like [`task`](Self::task), but delivery is skipped once `owner` is
    /// torn down; while the callback runs the owner is pinned.
    pub fn task_guarded(
        &self,
        cb: impl FnMut() -> bool + Send + 'static,
        owner: ObjWeak,
    ) -> DeferredTask {
        self.new_task(Box::new(cb), Some(owner))
    }

    fn new_task(&self, cb: TaskCallback, owner: Option<ObjWeak>) -> DeferredTask {
        DeferredTask {
            inner: Arc::new(TaskInner {
                cb: Mutex::new(cb),
                owner,
                state: Mutex::new(TaskState {
                    scheduled: false,
                    queued: false,
                }),
                processor: Arc::downgrade(&self.inner),
            }),
        }
    }

    /// Runs every task scheduled before this call. Returns whether any
    /// callback was invoked. Reentrant calls are no-ops.
    pub fn process(&self) -> bool {
        self.inner.process()
    }
}

impl Default for DeferredProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorInner {
    fn on_owner_thread(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    fn wake(&self) {
        let wakeup = self.wakeup.lock();
        if let Some(wakeup) = wakeup.as_ref() {
            wakeup();
        }
    }

    fn enqueue(self: &Arc<Self>, task: &Arc<TaskInner>) {
        if self.on_owner_thread() {
            self.queue.lock().push_back(task.clone());
        } else {
            self.incoming.push(task.clone());
            self.wake();
        }
    }

    fn process(&self) -> bool {
        if self.processing.swap(true, Ordering::Acquire) {
            return false;
        }

        while let Some(task) = self.incoming.pop() {
            self.queue.lock().push_back(task);
        }

        // Snapshot: tasks that re-schedule themselves go onto the live
        // queue and run at the next drain, not this one.
        let batch = mem::take(&mut *self.queue.lock());

        let mut ran_any = false;
        for task in batch {
            let runnable = {
                let mut state = task.state.lock();
                state.queued = false;
                mem::replace(&mut state.scheduled, false)
            };
            if !runnable {
                continue;
            }

            let again = match &task.owner {
                Some(weak) => match weak.upgrade() {
                    Some(pin) => {
                        let mut cb = task.cb.lock();
                        let again = (&mut **cb)();
                        drop(cb);
                        drop(pin);
                        Some(again)
                    }
                    None => None,
                },
                None => {
                    let mut cb = task.cb.lock();
                    Some((&mut **cb)())
                }
            };
            if again.is_some() {
                ran_any = true;
            }
            if again == Some(true) {
                task.reschedule();
            }
        }

        self.processing.store(false, Ordering::Release);
        ran_any
    }
}

impl DrainHook for ProcessorInner {
    fn drain_deferred(&self) -> bool {
        self.process()
    }
}

impl TaskInner {
    fn reschedule(self: &Arc<Self>) {
        let Some(processor) = self.processor.upgrade() else {
            return;
        };
        {
            let mut state = self.state.lock();
            state.scheduled = true;
            if state.queued {
                return;
            }
            state.queued = true;
        }
        processor.enqueue(self);
    }
}

impl DeferredTask {
    /// Queues the task for the next drain. Idempotent while already
    /// scheduled; a second schedule does not move the task's position.
    pub fn schedule(&self) {
        self.inner.reschedule();
    }

    /// Clears the scheduled flag. O(1); the queue entry, if any, is
    /// discarded when the drain reaches it. Safe from any thread and from
    /// inside the task's own callback.
    pub fn unschedule(&self) {
        self.inner.state.lock().scheduled = false;
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.unschedule();
    }
}
