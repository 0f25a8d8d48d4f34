//! Poll-based readiness group.
//!
//! A [`PollGroup`] owns a set of pollables keyed by file descriptor,
//! multiplexes them through `poll(2)` and dispatches readiness to each
//! pollable's event method with its owner pinned. A self-pipe lets any
//! thread interrupt a blocked wait ([`PollGroup::trigger`]).
//!
//! Interest is oneshot per delivery: once readiness for an entry has been
//! dispatched, its input/output interest is cleared and the pollable
//! re-arms itself through the [`PollFeedback`] handed to it at
//! registration. Error and hangup conditions are always watched.

use crate::cb::Cb;
use crate::deferred::DeferredProcessor;
use crate::error::{Error, Result};
use crate::state::StateMutex;
use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

bitflags::bitflags! {
    /// Readiness conditions delivered to [`Pollable::process_events`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const INPUT  = 0b0001;
        const OUTPUT = 0b0010;
        const ERROR  = 0b0100;
        const HUP    = 0b1000;
    }
}

/// An endpoint that can be registered with a [`PollGroup`].
pub trait Pollable: Send + Sync {
    fn fd(&self) -> RawFd;

    /// Called from the poll thread with the combined readiness flags for
    /// one wait cycle. The implementation re-arms interest through its
    /// feedback when it wants to be woken again.
    fn process_events(&self, events: PollEvents);

    /// Hands the pollable its re-arm channel; called once at registration.
    fn set_feedback(&self, feedback: PollFeedback);
}

/// Re-arm channel from a pollable back to its registration.
///
/// Safe to call from any thread and after removal (then it is a no-op);
/// calls from off the poll thread wake the group.
pub struct PollFeedback {
    entry: Weak<PollEntry>,
}

impl PollFeedback {
    pub fn request_input(&self) {
        self.arm(|entry| &entry.need_input);
    }

    pub fn request_output(&self) {
        self.arm(|entry| &entry.need_output);
    }

    fn arm(&self, flag: impl FnOnce(&PollEntry) -> &AtomicBool) {
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        flag(&entry).store(true, Ordering::Release);
        if let Some(group) = entry.group.upgrade() {
            if !group.on_poll_thread() {
                // A blocked wait must rebuild its interest set.
                let _ = group.trigger();
            }
        }
    }
}

impl Clone for PollFeedback {
    fn clone(&self) -> Self {
        PollFeedback {
            entry: self.entry.clone(),
        }
    }
}

/// Handle for [`PollGroup::remove_pollable`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PollableKey(u64);

struct PollEntry {
    key: u64,
    fd: RawFd,
    cb: Cb<dyn Pollable>,
    valid: AtomicBool,
    need_input: AtomicBool,
    need_output: AtomicBool,
    group: Weak<PollShared>,
}

struct Registry {
    entries: Vec<Arc<PollEntry>>,
}

struct TriggerPipe {
    read: RawFd,
    write: RawFd,
}

impl Drop for TriggerPipe {
    fn drop(&mut self) {
        // SAFETY: both fds were created by pipe(2) in `open` and are owned
        // exclusively by this struct.
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

struct PollShared {
    registry: StateMutex<Registry>,
    pipe: TriggerPipe,
    triggered: AtomicBool,
    next_key: AtomicU64,
    deferred: DeferredProcessor,
    poll_thread: Mutex<Option<ThreadId>>,
}

/// Readiness multiplexor; one per event thread.
pub struct PollGroup {
    shared: Arc<PollShared>,
}

pub(crate) fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl PollGroup {
    /// Creates the group and its trigger pipe.
    pub fn open() -> Result<PollGroup> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: pipe(2) writing into a local array of two fds.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::Trigger(io::Error::last_os_error()));
        }
        let pipe = TriggerPipe {
            read: fds[0],
            write: fds[1],
        };
        set_nonblock_cloexec(pipe.read).map_err(Error::Trigger)?;
        set_nonblock_cloexec(pipe.write).map_err(Error::Trigger)?;

        let shared = Arc::new(PollShared {
            registry: StateMutex::new(Registry {
                entries: Vec::new(),
            }),
            pipe,
            triggered: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
            deferred: DeferredProcessor::new(),
            poll_thread: Mutex::new(None),
        });

        // Tasks scheduled from foreign threads must interrupt the wait.
        let weak = Arc::downgrade(&shared);
        shared.deferred.set_wakeup(move || {
            if let Some(shared) = weak.upgrade() {
                let _ = shared.trigger();
            }
        });

        Ok(PollGroup { shared })
    }

    /// The deferred processor drained at the top of every wait cycle.
    pub fn deferred(&self) -> &DeferredProcessor {
        &self.shared.deferred
    }

    /// Registers a pollable. Input interest starts armed, output interest
    /// does not. The pollable's `set_feedback` is called before this
    /// returns.
    pub fn add_pollable(&self, desc: Cb<dyn Pollable>) -> PollableKey {
        let fd = desc.payload().fd();
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PollEntry {
            key,
            fd,
            cb: desc,
            valid: AtomicBool::new(true),
            need_input: AtomicBool::new(true),
            need_output: AtomicBool::new(false),
            group: Arc::downgrade(&self.shared),
        });
        entry.cb.payload().set_feedback(PollFeedback {
            entry: Arc::downgrade(&entry),
        });
        self.shared.registry.lock().entries.push(entry);
        if !self.shared.on_poll_thread() {
            let _ = self.shared.trigger();
        }
        PollableKey(key)
    }

    /// Unregisters and invalidates the entry. Idempotent; an in-flight
    /// dispatch walk skips invalidated entries.
    pub fn remove_pollable(&self, key: PollableKey) {
        let entry = {
            let mut registry = self.shared.registry.lock();
            registry
                .entries
                .iter()
                .position(|e| e.key == key.0)
                .map(|index| registry.entries.remove(index))
        };
        if let Some(entry) = entry {
            entry.valid.store(false, Ordering::Release);
        }
    }

    /// Runs one wait cycle: drain deferred tasks, block for readiness up
    /// to `timeout` (`None` blocks indefinitely), dispatch ready
    /// pollables. Call in a loop from the owning thread.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared.bind_poll_thread();

        let did_work = self.shared.deferred.process();

        let mut timeout = timeout;
        if did_work || self.shared.triggered.load(Ordering::Acquire) {
            // Pending work: collect readiness without blocking.
            timeout = Some(Duration::ZERO);
        }

        let (mut pollfds, polled) = {
            let registry = self.shared.registry.lock();
            let mut pollfds = Vec::with_capacity(registry.entries.len() + 1);
            pollfds.push(libc::pollfd {
                fd: self.shared.pipe.read,
                events: libc::POLLIN,
                revents: 0,
            });
            let mut polled = Vec::with_capacity(registry.entries.len());
            for entry in &registry.entries {
                if !entry.valid.load(Ordering::Acquire) {
                    continue;
                }
                let mut events: libc::c_short = 0;
                if entry.need_input.load(Ordering::Acquire) {
                    events |= libc::POLLIN;
                }
                if entry.need_output.load(Ordering::Acquire) {
                    events |= libc::POLLOUT;
                }
                // Error and hangup are reported regardless of `events`.
                pollfds.push(libc::pollfd {
                    fd: entry.fd,
                    events,
                    revents: 0,
                });
                polled.push(entry.clone());
            }
            (pollfds, polled)
        };

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            // Round sub-millisecond timeouts up so zero means zero only
            // when asked for.
            Some(d) => d.as_millis().clamp(1, i32::MAX as u128) as libc::c_int,
        };

        let ready = loop {
            // SAFETY: pollfds is a live array of initialized pollfd.
            let n = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Poll(err));
            }
        };
        if ready == 0 {
            return Ok(());
        }

        // Clear the trigger before dispatching: a trigger arriving from
        // here on writes a fresh byte and wakes the next wait.
        if pollfds[0].revents != 0 {
            self.shared.triggered.store(false, Ordering::Release);
            self.shared.drain_trigger_pipe();
        }

        let mut selected = Vec::new();
        for (pfd, entry) in pollfds[1..].iter().zip(polled.iter()) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            let mut flags = PollEvents::empty();
            if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                flags |= PollEvents::INPUT;
                entry.need_input.store(false, Ordering::Release);
            }
            if revents & libc::POLLOUT != 0 {
                flags |= PollEvents::OUTPUT;
                entry.need_output.store(false, Ordering::Release);
            }
            if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                flags |= PollEvents::ERROR;
            }
            if revents & libc::POLLHUP != 0 {
                flags |= PollEvents::HUP;
            }
            selected.push((entry.clone(), flags));
        }

        // Dispatch in syscall-return order, registry unlocked, owner
        // pinned per entry.
        for (entry, flags) in selected {
            if !entry.valid.load(Ordering::Acquire) {
                continue;
            }
            entry.cb.call(|pollable| pollable.process_events(flags));
        }

        Ok(())
    }

    /// Wakes the owning thread's wait. Idempotent under concurrency; safe
    /// from any thread and from inside a dispatch callback.
    pub fn trigger(&self) -> Result<()> {
        self.shared.trigger()
    }
}

impl PollShared {
    fn bind_poll_thread(&self) {
        let mut slot = self.poll_thread.lock();
        match *slot {
            None => {
                *slot = Some(thread::current().id());
                drop(slot);
                self.deferred.attach_current_thread();
            }
            Some(id) => debug_assert_eq!(
                id,
                thread::current().id(),
                "poll() must be called from one thread"
            ),
        }
    }

    fn on_poll_thread(&self) -> bool {
        *self.poll_thread.lock() == Some(thread::current().id())
    }

    fn trigger(&self) -> Result<()> {
        if self.triggered.swap(true, Ordering::AcqRel) {
            // A wakeup byte is already on its way.
            return Ok(());
        }
        loop {
            let byte = [1u8];
            // SAFETY: writing one byte from a local to our own pipe end.
            let n = unsafe { libc::write(self.pipe.write, byte.as_ptr().cast(), 1) };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Pipe full: plenty of unread wakeups pending.
                io::ErrorKind::WouldBlock => return Ok(()),
                _ => return Err(Error::Trigger(err)),
            }
        }
    }

    fn drain_trigger_pipe(&self) {
        let mut buf = [0u8; 128];
        loop {
            // SAFETY: reading into a local buffer from our own pipe end.
            let n = unsafe { libc::read(self.pipe.read, buf.as_mut_ptr().cast(), buf.len()) };
            if n < buf.len() as isize {
                break;
            }
        }
    }
}
