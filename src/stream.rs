//! Asynchronous stream interfaces used by I/O frontends over the poll
//! group.
//!
//! Streams are non-blocking: reads and writes either make progress, hit
//! [`AsyncIoResult::Again`] (after re-arming the matching interest through
//! the stream's poll feedback), or report end-of-stream. Short writes are
//! legal.

use crate::cb::Cb;
use crate::error::{Error, Result};
use std::io::IoSlice;

/// Outcome of one non-blocking I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncIoResult {
    /// `n` bytes transferred.
    Normal(usize),
    /// The descriptor has no capacity right now; interest was re-armed.
    Again,
    /// Peer closed the stream. Input only.
    Eof,
}

/// Callback table a reader installs on an [`AsyncInputStream`].
pub struct InputFrontend {
    /// Bytes may be available; the frontend pulls them via `read`.
    pub process_input: Box<dyn Fn() + Send + Sync>,
    /// The stream failed; delivered at most once per error condition.
    pub process_error: Box<dyn Fn(&Error) + Send + Sync>,
}

/// Callback table a writer installs on an [`AsyncOutputStream`].
pub struct OutputFrontend {
    /// The descriptor can accept bytes again.
    pub process_output: Box<dyn Fn() + Send + Sync>,
}

pub trait AsyncInputStream: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<AsyncIoResult>;

    fn set_input_frontend(&self, frontend: Cb<InputFrontend>);
}

pub trait AsyncOutputStream: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<AsyncIoResult>;

    /// Vectored write. The default forwards the first non-empty buffer to
    /// `write`; fd-backed streams override with a real `writev(2)`.
    fn writev(&self, bufs: &[IoSlice<'_>]) -> Result<AsyncIoResult> {
        match bufs.iter().find(|b| !b.is_empty()) {
            Some(buf) => self.write(buf),
            None => Ok(AsyncIoResult::Normal(0)),
        }
    }

    fn set_output_frontend(&self, frontend: Cb<OutputFrontend>);
}
