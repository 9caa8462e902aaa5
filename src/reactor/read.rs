use crate::error::IoError;
use crate::reactor::scheduler::Handle;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use tracing::trace;

/// Open a fifo read-only with `O_NONBLOCK`, as readiness-based reads
/// require. The open succeeds even before a writer connects.
///
/// Readiness suits pipes, fifos and the like; epoll refuses regular files,
/// which belong on the completion-based [`crate::proactor`] side.
pub fn open_nonblocking(path: impl AsRef<Path>) -> Result<File, IoError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path.as_ref())
        .map_err(|source| IoError::Open {
            path: path.as_ref().into(),
            source,
        })
}

/// One chunk read from a non-blocking fd.
///
/// The first poll is the suspension step: it issues a pre-read, and either
/// resolves immediately (data was already available), parks the continuation
/// with the scheduler (EOF-or-EAGAIN), or fails. The wake-up poll is the
/// resume step: one more read is appended after any pre-read bytes and the
/// combined chunk is returned. An empty chunk means EOF.
///
/// Because the epoll subscription is edge-triggered, each `ChunkRead`
/// performs exactly one read attempt per resume; user code re-awaits until
/// the source is exhausted.
pub struct ChunkRead<'fd> {
    handle: Handle,
    fd: BorrowedFd<'fd>,
    buf: Vec<u8>,
    /// Bytes captured by the suspension-step pre-read.
    filled: usize,
    parked: bool,
}

impl<'fd> ChunkRead<'fd> {
    pub(crate) fn new(handle: Handle, fd: BorrowedFd<'fd>, capacity: usize) -> Self {
        Self {
            handle,
            fd,
            buf: vec![0; capacity],
            filled: 0,
            parked: false,
        }
    }

    /// One non-blocking `read(2)` into the unfilled tail of the buffer.
    fn read_once(&mut self) -> isize {
        let fd = self.fd.as_raw_fd();
        let spare = &mut self.buf[self.filled..];
        unsafe { libc::read(fd, spare.as_mut_ptr().cast(), spare.len()) }
    }

    fn park(&mut self, waker: &Waker) -> Result<(), IoError> {
        self.handle.core().register(self.fd.as_raw_fd(), waker)?;
        self.parked = true;
        Ok(())
    }
}

fn would_block(err: &io::Error) -> bool {
    // EWOULDBLOCK is EAGAIN on Linux.
    err.raw_os_error() == Some(libc::EAGAIN)
}

impl Future for ChunkRead<'_> {
    type Output = Result<Vec<u8>, IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.parked {
            // Suspension step.
            let n = this.read_once();
            if n > 0 {
                this.filled = n as usize;
                // Data was already there: fall through to the drain read
                // without suspending.
            } else {
                let err = io::Error::last_os_error();
                if n == 0 || would_block(&err) {
                    if let Err(e) = this.park(cx.waker()) {
                        return Poll::Ready(Err(e));
                    }
                    return Poll::Pending;
                }
                return Poll::Ready(Err(IoError::Read {
                    fd: this.fd.as_raw_fd(),
                    source: err,
                }));
            }
        }

        // Resume step: drain once more behind the pre-read bytes.
        let n = this.read_once();
        if n >= 0 {
            let len = this.filled + n as usize;
            if this.filled > 0 {
                trace!(pre = this.filled, got = n, "drained after pre-read");
            }
            let mut chunk = std::mem::take(&mut this.buf);
            chunk.truncate(len);
            return Poll::Ready(Ok(chunk));
        }

        if this.filled > 0 {
            // The drain came up empty but the pre-read captured bytes:
            // surface the prefix; the error (normally EAGAIN at the end of
            // an edge-triggered burst) is not an error for this chunk.
            let mut chunk = std::mem::take(&mut this.buf);
            chunk.truncate(this.filled);
            return Poll::Ready(Ok(chunk));
        }

        Poll::Ready(Err(IoError::Read {
            fd: this.fd.as_raw_fd(),
            source: io::Error::last_os_error(),
        }))
    }
}
