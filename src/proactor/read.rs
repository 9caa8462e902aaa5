use crate::error::IoError;
use crate::proactor::scheduler::Handle;
use std::fs::File;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Offset-tracked reader over one descriptor.
///
/// Completion-based file reads need an explicit offset per operation; the
/// reader owns that offset and advances it by the bytes each completed read
/// transferred, so successive [`read`](FileReader::read) calls stream the
/// file sequentially. For non-seekable sources (pipes, eventfds) the kernel
/// ignores the offset.
pub struct FileReader {
    handle: Handle,
    fd: OwnedFd,
    offset: u64,
}

impl FileReader {
    /// Open `path` read-only. An open failure surfaces here, before any
    /// await.
    pub fn open(handle: &Handle, path: impl AsRef<Path>) -> Result<Self, IoError> {
        let file = File::open(path.as_ref()).map_err(|source| IoError::Open {
            path: path.as_ref().into(),
            source,
        })?;
        Ok(Self::from_fd(handle, file.into()))
    }

    /// Adopt an already-open descriptor, starting at offset 0.
    pub fn from_fd(handle: &Handle, fd: OwnedFd) -> Self {
        Self {
            handle: handle.clone(),
            fd,
            offset: 0,
        }
    }

    /// Bytes successfully read so far; the offset the next read starts at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to `capacity` bytes at the current offset. Resolves to the
    /// transferred bytes; an empty chunk means EOF.
    pub fn read(&mut self, capacity: usize) -> ReadChunk<'_> {
        ReadChunk {
            reader: self,
            capacity,
            token: None,
        }
    }
}

/// One in-flight read at the reader's tracked offset.
///
/// The first poll parks the continuation under a fresh completion token and
/// queues the SQE; the buffer lives in the scheduler until the completion is
/// reaped, so dropping this future mid-flight is safe — even if the same fd
/// is re-armed right away. The wake-up poll materialises the transferred
/// bytes and advances the reader's offset.
pub struct ReadChunk<'a> {
    reader: &'a mut FileReader,
    capacity: usize,
    /// Set once the SQE is queued; cleared when the completion is claimed.
    token: Option<u64>,
}

impl Future for ReadChunk<'_> {
    type Output = Result<Vec<u8>, IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let fd = this.reader.fd.as_raw_fd();
        let core = this.reader.handle.core();

        let Some(token) = this.token else {
            let buf = vec![0; this.capacity];
            return match core.submit_read(fd, this.reader.offset, buf, cx.waker()) {
                Ok(token) => {
                    this.token = Some(token);
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            };
        };

        match core.take_completion(token) {
            None => {
                core.update_waker(token, cx.waker());
                Poll::Pending
            }
            Some((mut buf, result)) if result >= 0 => {
                this.token = None;
                let n = result as usize;
                buf.truncate(n);
                this.reader.offset += n as u64;
                Poll::Ready(Ok(buf))
            }
            Some((_, result)) => {
                this.token = None;
                Poll::Ready(Err(IoError::Completion {
                    key: token,
                    source: io::Error::from_raw_os_error(-result),
                }))
            }
        }
    }
}

impl Drop for ReadChunk<'_> {
    fn drop(&mut self) {
        // Dropped with the operation unclaimed: the scheduler keeps the
        // buffer until the CQE arrives, then retires the entry unwoken.
        if let (Some(token), Some(core)) = (self.token, self.reader.handle.try_core()) {
            core.abandon(token);
        }
    }
}
