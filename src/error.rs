use std::io;

/// Errors surfaced by the I/O side of the crate.
///
/// Lifecycle misuse is not represented here: contract violations panic,
/// refcount overflow aborts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
    #[error("trigger pipe: {0}")]
    Trigger(#[source] io::Error),
    #[error("socket operation failed: {0}")]
    Socket(#[source] io::Error),
    #[error("stream i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("receive buffer full with no bytes accepted")]
    BufferFull,
}

pub type Result<T> = std::result::Result<T, Error>;
