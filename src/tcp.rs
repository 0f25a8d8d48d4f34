//! Non-blocking TCP endpoints over the poll group: a connection
//! implementing both stream traits and a listening server.

use crate::cb::Cb;
use crate::error::{Error, Result};
use crate::object::ObjRef;
use crate::poll::{PollEvents, PollFeedback, Pollable, set_nonblock_cloexec};
use crate::stream::{
    AsyncInputStream, AsyncIoResult, AsyncOutputStream, InputFrontend, OutputFrontend,
};
use parking_lot::Mutex;
use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::Arc;

struct ConnInner {
    fd: RawFd,
    input_frontend: Mutex<Option<Cb<InputFrontend>>>,
    output_frontend: Mutex<Option<Cb<OutputFrontend>>>,
    feedback: Mutex<Option<PollFeedback>>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by this connection.
        unsafe { libc::close(self.fd) };
    }
}

impl ConnInner {
    fn request_input(&self) {
        if let Some(feedback) = self.feedback.lock().as_ref() {
            feedback.request_input();
        }
    }

    fn request_output(&self) {
        if let Some(feedback) = self.feedback.lock().as_ref() {
            feedback.request_output();
        }
    }

    fn take_socket_error(&self) -> io::Error {
        let mut code: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: getsockopt writing into a local int.
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&raw mut code).cast(),
                &raw mut len,
            )
        };
        if rc == 0 && code != 0 {
            io::Error::from_raw_os_error(code)
        } else {
            io::Error::last_os_error()
        }
    }
}

impl Pollable for ConnInner {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn process_events(&self, events: PollEvents) {
        if events.contains(PollEvents::ERROR) {
            let err = Error::Socket(self.take_socket_error());
            let frontend = self.input_frontend.lock().clone();
            if let Some(frontend) = frontend {
                frontend.call(|f| (f.process_error)(&err));
            }
            return;
        }
        // Hangup still delivers as input: the reader drains what is left
        // and observes Eof.
        if events.intersects(PollEvents::INPUT | PollEvents::HUP) {
            let frontend = self.input_frontend.lock().clone();
            if let Some(frontend) = frontend {
                frontend.call(|f| (f.process_input)());
            }
        }
        if events.contains(PollEvents::OUTPUT) {
            let frontend = self.output_frontend.lock().clone();
            if let Some(frontend) = frontend {
                frontend.call(|f| (f.process_output)());
            }
        }
    }

    fn set_feedback(&self, feedback: PollFeedback) {
        *self.feedback.lock() = Some(feedback);
    }
}

/// One established connection. Cheap to clone; clones share the socket.
pub struct TcpConnection {
    inner: Arc<ConnInner>,
}

impl Clone for TcpConnection {
    fn clone(&self) -> Self {
        TcpConnection {
            inner: self.inner.clone(),
        }
    }
}

impl TcpConnection {
    fn from_fd(fd: RawFd) -> TcpConnection {
        TcpConnection {
            inner: Arc::new(ConnInner {
                fd,
                input_frontend: Mutex::new(None),
                output_frontend: Mutex::new(None),
                feedback: Mutex::new(None),
            }),
        }
    }

    /// Registration descriptor for the poll group, guarded by `owner`.
    pub fn pollable_desc(&self, owner: &ObjRef) -> Cb<dyn Pollable> {
        Cb::new(self.inner.clone() as Arc<dyn Pollable>, owner)
    }
}

impl FromRawFd for TcpConnection {
    /// Adopts a connected socket. The fd is switched to non-blocking.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        let _ = set_nonblock_cloexec(fd);
        TcpConnection::from_fd(fd)
    }
}

impl AsRawFd for TcpConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd
    }
}

impl AsyncInputStream for TcpConnection {
    fn read(&self, buf: &mut [u8]) -> Result<AsyncIoResult> {
        if buf.is_empty() {
            return Ok(AsyncIoResult::Normal(0));
        }
        loop {
            // SAFETY: reading into a live buffer from an owned fd.
            let n = unsafe { libc::read(self.inner.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                return Ok(AsyncIoResult::Normal(n as usize));
            }
            if n == 0 {
                return Ok(AsyncIoResult::Eof);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    self.inner.request_input();
                    return Ok(AsyncIoResult::Again);
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    fn set_input_frontend(&self, frontend: Cb<InputFrontend>) {
        *self.inner.input_frontend.lock() = Some(frontend);
    }
}

impl AsyncOutputStream for TcpConnection {
    fn write(&self, data: &[u8]) -> Result<AsyncIoResult> {
        loop {
            // SAFETY: writing from a live buffer to an owned fd.
            let n = unsafe { libc::write(self.inner.fd, data.as_ptr().cast(), data.len()) };
            if n >= 0 {
                return Ok(AsyncIoResult::Normal(n as usize));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    self.inner.request_output();
                    return Ok(AsyncIoResult::Again);
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    fn writev(&self, bufs: &[IoSlice<'_>]) -> Result<AsyncIoResult> {
        if bufs.is_empty() {
            return Ok(AsyncIoResult::Normal(0));
        }
        let count = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
        loop {
            // SAFETY: IoSlice is ABI-compatible with iovec and the slices
            // outlive the call.
            let n = unsafe { libc::writev(self.inner.fd, bufs.as_ptr().cast(), count) };
            if n >= 0 {
                return Ok(AsyncIoResult::Normal(n as usize));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    self.inner.request_output();
                    return Ok(AsyncIoResult::Again);
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    fn set_output_frontend(&self, frontend: Cb<OutputFrontend>) {
        *self.inner.output_frontend.lock() = Some(frontend);
    }
}

/// Callback table a server's user installs for accept notifications.
pub struct ServerFrontend {
    /// At least one connection is ready; call [`TcpServer::accept`] until
    /// it returns [`AcceptResult::NotAccepted`].
    pub accepted: Box<dyn Fn() + Send + Sync>,
}

pub enum AcceptResult {
    Accepted(TcpConnection),
    /// No pending connection; input interest was re-armed.
    NotAccepted,
}

struct ServerInner {
    fd: Mutex<Option<RawFd>>,
    frontend: Mutex<Option<Cb<ServerFrontend>>>,
    feedback: Mutex<Option<PollFeedback>>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(fd) = *self.fd.lock() {
            // SAFETY: the listening fd is owned by this server.
            unsafe { libc::close(fd) };
        }
    }
}

impl ServerInner {
    fn fd(&self) -> RawFd {
        let fd = *self.fd.lock();
        match fd {
            Some(fd) => fd,
            None => panic!("TcpServer used before open()"),
        }
    }
}

impl Pollable for ServerInner {
    fn fd(&self) -> RawFd {
        ServerInner::fd(self)
    }

    fn process_events(&self, events: PollEvents) {
        if events.intersects(PollEvents::ERROR | PollEvents::HUP) {
            log::warn!("listening socket reported {events:?}");
        }
        if events.contains(PollEvents::INPUT) {
            let frontend = self.frontend.lock().clone();
            if let Some(frontend) = frontend {
                frontend.call(|f| (f.accepted)());
            }
        }
    }

    fn set_feedback(&self, feedback: PollFeedback) {
        *self.feedback.lock() = Some(feedback);
    }
}

/// Non-blocking IPv4 listener. Cheap to clone; clones share the socket.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl Clone for TcpServer {
    fn clone(&self) -> Self {
        TcpServer {
            inner: self.inner.clone(),
        }
    }
}

impl TcpServer {
    pub fn new() -> TcpServer {
        TcpServer {
            inner: Arc::new(ServerInner {
                fd: Mutex::new(None),
                frontend: Mutex::new(None),
                feedback: Mutex::new(None),
            }),
        }
    }

    /// Creates the listening socket: non-blocking, close-on-exec,
    /// `SO_REUSEADDR`.
    pub fn open(&self) -> Result<()> {
        // SAFETY: plain socket(2).
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        let one: libc::c_int = 1;
        // SAFETY: setsockopt with a local int on an owned fd.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&raw const one).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: closing the fd we just created.
            unsafe { libc::close(fd) };
            return Err(Error::Socket(err));
        }
        if let Err(err) = set_nonblock_cloexec(fd) {
            // SAFETY: closing the fd we just created.
            unsafe { libc::close(fd) };
            return Err(Error::Socket(err));
        }
        *self.inner.fd.lock() = Some(fd);
        Ok(())
    }

    /// Must be called before [`listen`](Self::listen).
    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        let sin = sockaddr_in_from(addr);
        // SAFETY: bind(2) with a properly sized sockaddr_in.
        let rc = unsafe {
            libc::bind(
                self.inner.fd(),
                (&raw const sin).cast(),
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Should only be called once.
    pub fn listen(&self) -> Result<()> {
        // SAFETY: listen(2) on an owned fd.
        let rc = unsafe { libc::listen(self.inner.fd(), libc::SOMAXCONN) };
        if rc != 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // SAFETY: getsockname writing into a local sockaddr_in.
        let rc = unsafe {
            libc::getsockname(self.inner.fd(), (&raw mut sin).cast(), &raw mut len)
        };
        if rc != 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        Ok(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
            u16::from_be(sin.sin_port),
        ))
    }

    /// Takes one pending connection, if any.
    pub fn accept(&self) -> Result<AcceptResult> {
        let fd = self.inner.fd();
        loop {
            // SAFETY: accept(2); we do not need the peer address here.
            let conn_fd = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
            if conn_fd >= 0 {
                if let Err(err) = set_nonblock_cloexec(conn_fd) {
                    // SAFETY: closing the fd accept just returned.
                    unsafe { libc::close(conn_fd) };
                    return Err(Error::Socket(err));
                }
                return Ok(AcceptResult::Accepted(TcpConnection::from_fd(conn_fd)));
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted
                || err.raw_os_error() == Some(libc::ECONNABORTED)
            {
                continue;
            }
            if err.kind() == io::ErrorKind::WouldBlock {
                if let Some(feedback) = self.inner.feedback.lock().as_ref() {
                    feedback.request_input();
                }
                return Ok(AcceptResult::NotAccepted);
            }
            return Err(Error::Socket(err));
        }
    }

    pub fn set_frontend(&self, frontend: Cb<ServerFrontend>) {
        *self.inner.frontend.lock() = Some(frontend);
    }

    /// Registration descriptor for the poll group, guarded by `owner`.
    pub fn pollable_desc(&self, owner: &ObjRef) -> Cb<dyn Pollable> {
        Cb::new(self.inner.clone() as Arc<dyn Pollable>, owner)
    }

    /// Closes the listening socket. Remove the pollable first.
    pub fn close(&self) -> Result<()> {
        if let Some(fd) = self.inner.fd.lock().take() {
            // SAFETY: closing the owned listening fd.
            if unsafe { libc::close(fd) } != 0 {
                return Err(Error::Socket(io::Error::last_os_error()));
            }
        }
        Ok(())
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; zeroing covers sin_zero and
    // any platform padding.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}
