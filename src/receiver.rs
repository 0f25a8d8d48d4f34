//! Buffered receiver over an [`AsyncInputStream`].
//!
//! Pulls bytes into a bounded buffer and hands them to a frontend, which
//! consumes some prefix of what it is shown. A frontend that cannot make
//! progress returns [`ProcessInput::Blocked`]; the receiver then stops
//! reading (and stops re-arming input interest) until
//! [`ConnectionReceiver::unblock_input`] schedules the deferred unblock
//! task, which re-enters input processing from outside all locks.

use crate::cb::Cb;
use crate::deferred::{DeferredProcessor, DeferredTask};
use crate::error::Error;
use crate::object::ObjRef;
use crate::stream::{AsyncInputStream, AsyncIoResult, InputFrontend};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const DEFAULT_RECV_BUF_LEN: usize = 64 * 1024;

/// Frontend verdict on the bytes it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessInput {
    /// `n` bytes consumed; show the rest (and more) as it arrives.
    /// `Consumed(0)` means "cannot proceed without more data".
    Consumed(usize),
    /// `n` bytes consumed, then the application jammed: deliver nothing
    /// further until `unblock_input`.
    Blocked(usize),
}

/// Callback table installed with [`ConnectionReceiver::set_frontend`].
pub struct ReceiverFrontend {
    pub process_input: Box<dyn Fn(&[u8]) -> ProcessInput + Send + Sync>,
    /// Stream ended; receives the unconsumed tail.
    pub process_eof: Box<dyn Fn(&[u8]) + Send + Sync>,
    /// Stream failed; receives the unconsumed tail. Reported once.
    pub process_error: Box<dyn Fn(&Error, &[u8]) + Send + Sync>,
}

struct RecvBuf {
    data: Box<[u8]>,
    /// Write cursor: bytes below it came off the stream.
    pos: usize,
    /// Application cursor: bytes below it were consumed by the frontend.
    accepted: usize,
    error_reported: bool,
}

struct ReceiverInner {
    conn: Arc<dyn AsyncInputStream>,
    frontend: Mutex<Option<Cb<ReceiverFrontend>>>,
    buf: Mutex<RecvBuf>,
    /// Outside `buf` so a frontend may unblock from inside
    /// `process_input` without deadlocking.
    blocked: AtomicBool,
    unblock_task: Mutex<Option<DeferredTask>>,
}

/// Receiver pump between an input stream and a consuming frontend.
pub struct ConnectionReceiver {
    inner: Arc<ReceiverInner>,
}

impl ConnectionReceiver {
    /// Wires the receiver as `conn`'s input frontend. `owner` guards the
    /// stream callbacks and the unblock task; `deferred` must be the
    /// processor of the poll group driving `conn`.
    pub fn new(
        conn: Arc<dyn AsyncInputStream>,
        owner: &ObjRef,
        deferred: &DeferredProcessor,
    ) -> ConnectionReceiver {
        Self::with_buffer_size(conn, owner, deferred, DEFAULT_RECV_BUF_LEN)
    }

    pub fn with_buffer_size(
        conn: Arc<dyn AsyncInputStream>,
        owner: &ObjRef,
        deferred: &DeferredProcessor,
        recv_buf_len: usize,
    ) -> ConnectionReceiver {
        assert!(recv_buf_len > 0, "receive buffer cannot be empty");
        let inner = Arc::new(ReceiverInner {
            conn: conn.clone(),
            frontend: Mutex::new(None),
            buf: Mutex::new(RecvBuf {
                data: vec![0u8; recv_buf_len].into_boxed_slice(),
                pos: 0,
                accepted: 0,
                error_reported: false,
            }),
            blocked: AtomicBool::new(false),
            unblock_task: Mutex::new(None),
        });

        let task = {
            let weak = Arc::downgrade(&inner);
            deferred.task_guarded(
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.do_process_input();
                    }
                    false
                },
                owner.downgrade(),
            )
        };
        *inner.unblock_task.lock() = Some(task);

        let input = {
            let process = Arc::downgrade(&inner);
            let fail: Weak<ReceiverInner> = Arc::downgrade(&inner);
            InputFrontend {
                process_input: Box::new(move || {
                    if let Some(inner) = process.upgrade() {
                        inner.do_process_input();
                    }
                }),
                process_error: Box::new(move |err| {
                    if let Some(inner) = fail.upgrade() {
                        inner.report_error(err);
                    }
                }),
            }
        };
        conn.set_input_frontend(Cb::new(Arc::new(input), owner));

        ConnectionReceiver { inner }
    }

    pub fn set_frontend(&self, frontend: Cb<ReceiverFrontend>) {
        *self.inner.frontend.lock() = Some(frontend);
    }

    /// Lifts the frontend's block and schedules the deferred re-entry.
    /// Call after a [`ProcessInput::Blocked`] verdict once the application
    /// can take input again; safe from any thread.
    pub fn unblock_input(&self) {
        self.inner.blocked.store(false, Ordering::Release);
        let task = self.inner.unblock_task.lock();
        if let Some(task) = task.as_ref() {
            task.schedule();
        }
    }
}

impl ReceiverInner {
    fn do_process_input(&self) {
        let frontend = self.frontend.lock().clone();
        let mut buf = self.buf.lock();
        if buf.error_reported {
            return;
        }

        loop {
            if self.blocked.load(Ordering::Acquire) {
                // Backpressure: no reads and no re-arm until unblocked.
                return;
            }

            // Show the frontend what is pending before pulling more.
            while buf.accepted < buf.pos {
                let Some(frontend) = &frontend else { break };
                let verdict =
                    frontend.call(|f| (f.process_input)(&buf.data[buf.accepted..buf.pos]));
                match verdict {
                    None => return,
                    Some(ProcessInput::Consumed(0)) => break,
                    Some(ProcessInput::Consumed(n)) => buf.accepted += n,
                    Some(ProcessInput::Blocked(n)) => {
                        buf.accepted += n;
                        self.blocked.store(true, Ordering::Release);
                        return;
                    }
                }
            }

            if buf.accepted == buf.pos {
                buf.accepted = 0;
                buf.pos = 0;
            } else if buf.pos == buf.data.len() {
                if buf.accepted == 0 {
                    // Full buffer the frontend will not take a byte of.
                    drop(buf);
                    self.report_error(&Error::BufferFull);
                    return;
                }
                let (accepted, pos) = (buf.accepted, buf.pos);
                buf.data.copy_within(accepted..pos, 0);
                buf.pos = pos - accepted;
                buf.accepted = 0;
            }

            let pos = buf.pos;
            match self.conn.read(&mut buf.data[pos..]) {
                Ok(AsyncIoResult::Normal(n)) => buf.pos += n,
                // The stream re-armed its own input interest.
                Ok(AsyncIoResult::Again) => return,
                Ok(AsyncIoResult::Eof) => {
                    let tail = &buf.data[buf.accepted..buf.pos];
                    if let Some(frontend) = &frontend {
                        frontend.call(|f| (f.process_eof)(tail));
                    }
                    return;
                }
                Err(err) => {
                    drop(buf);
                    self.report_error(&err);
                    return;
                }
            }
        }
    }

    fn report_error(&self, err: &Error) {
        let frontend = self.frontend.lock().clone();
        let mut buf = self.buf.lock();
        if buf.error_reported {
            return;
        }
        buf.error_reported = true;
        let tail = &buf.data[buf.accepted..buf.pos];
        if let Some(frontend) = &frontend {
            frontend.call(|f| (f.process_error)(err, tail));
        }
    }
}
