use crate::cb::Cb;
use crate::poll::{PollEvents, PollFeedback, PollGroup, Pollable};
use crate::receiver::{ConnectionReceiver, ProcessInput, ReceiverFrontend};
use crate::tcp::{AcceptResult, ServerFrontend, TcpConnection, TcpServer};
use crate::Ref;
use std::io::Write;
use std::net::TcpStream;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn os_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn os_socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn write_all(fd: RawFd, data: &[u8]) {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    assert_eq!(n, data.len() as isize);
}

struct TestPollable {
    fd: RawFd,
    rearm: bool,
    events: Mutex<Vec<PollEvents>>,
    feedback: Mutex<Option<PollFeedback>>,
}

impl TestPollable {
    fn new(fd: RawFd, rearm: bool) -> Arc<TestPollable> {
        Arc::new(TestPollable {
            fd,
            rearm,
            events: Mutex::new(Vec::new()),
            feedback: Mutex::new(None),
        })
    }

    fn seen(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Pollable for TestPollable {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn process_events(&self, events: PollEvents) {
        self.events.lock().unwrap().push(events);
        if self.rearm {
            if let Some(feedback) = self.feedback.lock().unwrap().as_ref() {
                feedback.request_input();
            }
        }
    }

    fn set_feedback(&self, feedback: PollFeedback) {
        *self.feedback.lock().unwrap() = Some(feedback);
    }
}

#[test]
fn trigger_wakes_blocked_poll() {
    let group = Arc::new(PollGroup::open().unwrap());
    let waker = group.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.trigger().unwrap();
    });

    let start = Instant::now();
    group.poll(Some(Duration::from_secs(10))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
}

#[test]
fn dispatches_input_readiness() {
    let group = PollGroup::open().unwrap();
    let owner = Ref::new(());
    let (read_fd, write_fd) = os_pipe();
    let pollable = TestPollable::new(read_fd, false);

    group.add_pollable(Cb::new(pollable.clone() as Arc<dyn Pollable>, owner.as_obj()));
    write_all(write_fd, b"x");

    group.poll(Some(Duration::from_secs(2))).unwrap();
    let events = pollable.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].contains(PollEvents::INPUT));

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn removed_pollable_is_not_dispatched() {
    let group = PollGroup::open().unwrap();
    let owner = Ref::new(());
    let (read_fd, write_fd) = os_pipe();
    let pollable = TestPollable::new(read_fd, true);

    let key = group.add_pollable(Cb::new(pollable.clone() as Arc<dyn Pollable>, owner.as_obj()));
    write_all(write_fd, b"x");
    group.poll(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(pollable.seen(), 1);

    group.remove_pollable(key);
    group.remove_pollable(key);

    write_all(write_fd, b"y");
    group.poll(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(pollable.seen(), 1);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn dead_owner_suppresses_dispatch() {
    let group = PollGroup::open().unwrap();
    let owner = Ref::new(());
    let (read_fd, write_fd) = os_pipe();
    let pollable = TestPollable::new(read_fd, true);

    group.add_pollable(Cb::new(pollable.clone() as Arc<dyn Pollable>, owner.as_obj()));
    drop(owner);

    write_all(write_fd, b"x");
    group.poll(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(pollable.seen(), 0);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn pending_deferred_work_prevents_blocking() {
    let group = PollGroup::open().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let task = group.deferred().task(move || {
        ran2.store(true, Ordering::SeqCst);
        false
    });
    task.schedule();

    let start = Instant::now();
    group.poll(Some(Duration::from_secs(10))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn receiver_backpressure_waits_for_unblock() {
    let group = PollGroup::open().unwrap();
    let owner = Ref::new(());
    let (ours, theirs) = os_socketpair();
    let conn = unsafe { TcpConnection::from_raw_fd(ours) };

    let receiver = ConnectionReceiver::new(
        Arc::new(conn.clone()),
        owner.as_obj(),
        group.deferred(),
    );

    let calls: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let blocked_once = Arc::new(AtomicBool::new(false));
    let frontend = {
        let calls = calls.clone();
        let blocked_once = blocked_once.clone();
        ReceiverFrontend {
            process_input: Box::new(move |data| {
                calls.lock().unwrap().push(data.to_vec());
                if !blocked_once.swap(true, Ordering::SeqCst) {
                    ProcessInput::Blocked(0)
                } else {
                    ProcessInput::Consumed(data.len())
                }
            }),
            process_eof: Box::new(|_| {}),
            process_error: Box::new(|err, _| panic!("receiver error: {err}")),
        }
    };
    receiver.set_frontend(Cb::new(Arc::new(frontend), owner.as_obj()));
    group.add_pollable(conn.pollable_desc(owner.as_obj()));

    write_all(theirs, b"hello");
    group.poll(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(calls.lock().unwrap().len(), 1);

    // Blocked: new bytes must not re-enter the frontend.
    write_all(theirs, b" world");
    group.poll(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(calls.lock().unwrap().len(), 1);

    receiver.unblock_input();
    let deadline = Instant::now() + Duration::from_secs(5);
    while calls.lock().unwrap().len() < 3 && Instant::now() < deadline {
        group.poll(Some(Duration::from_millis(100))).unwrap();
    }

    let calls = calls.lock().unwrap();
    let received: Vec<u8> = calls[1..].concat();
    assert_eq!(calls[0], b"hello");
    assert_eq!(received, b"hello world");

    unsafe { libc::close(theirs) };
}

#[test]
fn tcp_server_accepts_and_receives() {
    let group = PollGroup::open().unwrap();
    let owner = Ref::new(());

    let server = TcpServer::new();
    server.open().unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    server.listen().unwrap();
    let addr = server.local_addr().unwrap();

    let accepted: Arc<Mutex<Vec<TcpConnection>>> = Arc::new(Mutex::new(Vec::new()));
    let frontend = {
        let server = server.clone();
        let accepted = accepted.clone();
        ServerFrontend {
            accepted: Box::new(move || {
                loop {
                    match server.accept().unwrap() {
                        AcceptResult::Accepted(conn) => accepted.lock().unwrap().push(conn),
                        AcceptResult::NotAccepted => break,
                    }
                }
            }),
        }
    };
    server.set_frontend(Cb::new(Arc::new(frontend), owner.as_obj()));
    group.add_pollable(server.pollable_desc(owner.as_obj()));

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        // Hold the connection open until the server side is done reading.
        let _ = done_rx.recv_timeout(Duration::from_secs(10));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while accepted.lock().unwrap().is_empty() && Instant::now() < deadline {
        group.poll(Some(Duration::from_millis(100))).unwrap();
    }
    let conn = accepted.lock().unwrap().pop().expect("no connection accepted");

    let received = Arc::new(Mutex::new(Vec::new()));
    let got = Arc::new(AtomicUsize::new(0));
    let receiver = ConnectionReceiver::new(
        Arc::new(conn.clone()),
        owner.as_obj(),
        group.deferred(),
    );
    let frontend = {
        let received = received.clone();
        let got = got.clone();
        ReceiverFrontend {
            process_input: Box::new(move |data| {
                received.lock().unwrap().extend_from_slice(data);
                got.fetch_add(data.len(), Ordering::SeqCst);
                ProcessInput::Consumed(data.len())
            }),
            process_eof: Box::new(|_| {}),
            process_error: Box::new(|err, _| panic!("receiver error: {err}")),
        }
    };
    receiver.set_frontend(Cb::new(Arc::new(frontend), owner.as_obj()));
    group.add_pollable(conn.pollable_desc(owner.as_obj()));

    let deadline = Instant::now() + Duration::from_secs(5);
    while got.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
        group.poll(Some(Duration::from_millis(100))).unwrap();
    }
    assert_eq!(&*received.lock().unwrap(), b"ping");

    let _ = done_tx.send(());
    client.join().unwrap();
}
