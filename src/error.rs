use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// Failures of the event object itself: creating the epoll instance or the
/// ring, installing a subscription, or waiting for events.
///
/// Raised out of the scheduler constructors, `register`, and `run`. EOF and
/// shutdown are never errors.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("failed to set up the event queue: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to register fd {fd} with the event queue: {source}")]
    Register { fd: RawFd, source: io::Error },

    #[error("waiting for events failed: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to deliver the shutdown notification: {0}")]
    Shutdown(#[source] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("unexpected scheduler failure: {0}")]
    Other(#[from] anyhow::Error),
}

/// An OS read failed unexpectedly — anything that is not EOF, EAGAIN, or a
/// pending completion. Raised inside the awaiting coroutine.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("read on fd {fd} failed: {source}")]
    Read { fd: RawFd, source: io::Error },

    #[error("failed to queue a read for fd {fd}: {source}")]
    Submit { fd: RawFd, source: io::Error },

    #[error("read completion for key {key} failed: {source}")]
    Completion { key: u64, source: io::Error },

    /// Registration performed on behalf of an awaitable failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl IoError {
    /// The underlying kernel errno, when one exists.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Open { source, .. }
            | IoError::Read { source, .. }
            | IoError::Submit { source, .. }
            | IoError::Completion { source, .. } => source.raw_os_error(),
            IoError::Scheduler(_) => None,
        }
    }
}
