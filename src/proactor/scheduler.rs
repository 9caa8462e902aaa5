use crate::error::{IoError, SchedulerError};
use crate::proactor::read::FileReader;
use crate::task::Tasks;
use io_uring::{IoUring, opcode, types};
use nix::sys::eventfd::{EfdFlags, EventFd};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::task::Waker;
use tracing::{debug, trace};

/// Reserved completion key for the shutdown sentinel. I/O operations carry
/// per-operation tokens allocated from 1 upward, so a re-armed fd never
/// collides with an operation still in flight.
const SHUTDOWN_KEY: u64 = 0;

/// Submission ring depth. The demos park a handful of reads at a time; 128
/// leaves generous headroom before a push ever sees a full ring.
const RING_ENTRIES: u32 = 128;

/// A read the kernel may still be executing. The scheduler, not the
/// awaitable, owns the buffer: a future dropped mid-flight must not free
/// memory the kernel will write to.
struct Parked {
    waker: Waker,
    buf: Vec<u8>,
    /// Raw CQE result, set by the run loop when the completion arrives.
    result: Option<i32>,
    /// The owning future was dropped mid-flight; retire the entry (and only
    /// then the buffer) when its CQE arrives.
    abandoned: bool,
}

pub(crate) struct Core {
    // Field order matters: ring teardown cancels and waits out in-flight
    // reads, and must run before the parked buffers below are freed.
    ring: RefCell<IoUring>,
    shutdown_fd: EventFd,
    /// Target of the pre-armed sentinel read; boxed so its address survives
    /// the move into `Core`.
    _shutdown_buf: Box<[u8; 8]>,
    /// In-flight and completed-but-unclaimed reads, keyed by the token each
    /// SQE carries in its user_data. An entry owns its buffer until the CQE
    /// has arrived and the future claims it.
    waiters: RefCell<HashMap<u64, Parked>>,
    next_token: Cell<u64>,
    tasks: Tasks,
}

impl Core {
    /// Park the continuation under a fresh token and queue a read of
    /// `buf.len()` bytes at `offset`. The SQE reaches the kernel on the run
    /// loop's next submit. Returns the token the completion will carry.
    pub(crate) fn submit_read(
        &self,
        fd: RawFd,
        offset: u64,
        mut buf: Vec<u8>,
        waker: &Waker,
    ) -> Result<u64, IoError> {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .offset(offset)
            .build()
            .user_data(token);

        // Park before pushing so the buffer is owned for as long as the
        // kernel can reference it.
        self.waiters.borrow_mut().insert(
            token,
            Parked {
                waker: waker.clone(),
                buf,
                result: None,
                abandoned: false,
            },
        );

        if let Err(e) = self.push(&entry) {
            self.waiters.borrow_mut().remove(&token);
            return Err(IoError::Submit { fd, source: e });
        }

        trace!(fd, token, offset, "read queued");
        Ok(token)
    }

    fn push(&self, entry: &io_uring::squeue::Entry) -> io::Result<()> {
        let mut ring = self.ring.borrow_mut();
        if unsafe { ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        // Ring full: flush what is queued and retry once.
        ring.submit()?;
        unsafe { ring.submission().push(entry) }.map_err(io::Error::other)
    }

    /// Replace the waker parked under `token`, for spurious re-polls before
    /// the completion has arrived.
    pub(crate) fn update_waker(&self, token: u64, waker: &Waker) {
        if let Some(parked) = self.waiters.borrow_mut().get_mut(&token) {
            parked.waker = waker.clone();
        }
    }

    /// Take the finished read for `token`, if its completion has been
    /// reaped: the buffer and the raw CQE result.
    pub(crate) fn take_completion(&self, token: u64) -> Option<(Vec<u8>, i32)> {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.get(&token).is_some_and(|p| p.result.is_some()) {
            return None;
        }
        let parked = waiters.remove(&token)?;
        let result = parked.result?;
        Some((parked.buf, result))
    }

    /// Disown the operation behind `token`. A completed entry is retired on
    /// the spot; an in-flight one stays in the map, buffer and all, until
    /// the run loop sees its CQE — the kernel may still write to it.
    pub(crate) fn abandon(&self, token: u64) {
        let mut waiters = self.waiters.borrow_mut();
        if let Some(parked) = waiters.get_mut(&token) {
            if parked.result.is_some() {
                waiters.remove(&token);
            } else {
                parked.abandoned = true;
                trace!(token, "in-flight read abandoned");
            }
        }
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.tasks.spawn(future);
    }

    fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            fd: self.shutdown_fd.as_fd().as_raw_fd(),
        }
    }
}

/// The completion-based scheduler: an io_uring instance whose CQEs are
/// routed back to parked coroutines by a per-operation completion token.
///
/// Shutdown follows the completion-port idiom: a read on an internal eventfd
/// is armed at construction under the reserved key 0, and [`Shutdown`] makes
/// it complete. The run loop treats a zero key as "terminate".
///
/// Owns every spawned task; dropping the scheduler drops all still-parked
/// coroutine frames after the ring has quiesced. Construction, `spawn`, and
/// `run` must all happen on the same thread; only [`Shutdown`] may be used
/// from elsewhere.
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    pub fn new() -> Result<Self, SchedulerError> {
        let mut ring = IoUring::new(RING_ENTRIES).map_err(SchedulerError::Setup)?;

        let shutdown_fd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC)
            .map_err(|errno| SchedulerError::Setup(errno.into()))?;
        let mut shutdown_buf = Box::new([0u8; 8]);

        // Arm the sentinel: completes only once the eventfd is written.
        let sentinel = opcode::Read::new(
            types::Fd(shutdown_fd.as_fd().as_raw_fd()),
            shutdown_buf.as_mut_ptr(),
            shutdown_buf.len() as u32,
        )
        .build()
        .user_data(SHUTDOWN_KEY);
        unsafe { ring.submission().push(&sentinel) }
            .map_err(|e| SchedulerError::Setup(io::Error::other(e)))?;
        debug!(
            fd = shutdown_fd.as_fd().as_raw_fd(),
            "shutdown sentinel armed"
        );

        Ok(Self {
            core: Rc::new(Core {
                ring: RefCell::new(ring),
                shutdown_fd,
                _shutdown_buf: shutdown_buf,
                waiters: RefCell::new(HashMap::new()),
                next_token: Cell::new(SHUTDOWN_KEY + 1),
                tasks: Tasks::new(),
            }),
        })
    }

    /// A cloneable, coroutine-safe reference to this scheduler.
    pub fn handle(&self) -> Handle {
        Handle {
            core: Rc::downgrade(&self.core),
        }
    }

    /// Start a coroutine. It runs synchronously up to its first suspension
    /// point before this returns.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.core.spawn(future);
    }

    /// Block submitting queued reads and reaping completions until the
    /// shutdown sentinel completes.
    ///
    /// Completions are dispatched in the order the kernel reports them; each
    /// resumption is synchronous and may queue further reads, which the next
    /// iteration submits. Calling `run` from inside a task is not supported.
    pub fn run(&self) -> Result<(), SchedulerError> {
        let core = &*self.core;
        core.tasks.run_woken();

        loop {
            match core.ring.borrow_mut().submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(SchedulerError::Wait(e)),
            }

            // Collect the batch first: resuming a coroutine re-borrows the
            // ring to queue its next read.
            let batch: SmallVec<[(u64, i32); 16]> = {
                let mut ring = core.ring.borrow_mut();
                ring.completion()
                    .map(|cqe| (cqe.user_data(), cqe.result()))
                    .collect()
            };

            for (token, result) in batch {
                if token == SHUTDOWN_KEY {
                    debug!("shutdown sentinel completed");
                    return Ok(());
                }

                trace!(token, result, "completion");
                {
                    let mut waiters = core.waiters.borrow_mut();
                    if let Some(parked) = waiters.get_mut(&token) {
                        if parked.abandoned {
                            // Nobody will claim this read; the kernel is
                            // done with the buffer as of this CQE.
                            waiters.remove(&token);
                        } else {
                            parked.result = Some(result);
                            parked.waker.wake_by_ref();
                        }
                    }
                }
                core.tasks.run_woken();
            }
        }
    }

    /// Open `path` for offset-tracked reads on this scheduler. Failures
    /// surface here, before any await.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<FileReader, IoError> {
        FileReader::open(&self.handle(), path)
    }

    /// Adopt an already-open descriptor (e.g. the read end of a pipe). For
    /// non-seekable sources the kernel ignores the tracked offset.
    pub fn adopt(&self, fd: OwnedFd) -> FileReader {
        FileReader::from_fd(&self.handle(), fd)
    }

    /// Make `run` return at the next completion boundary. Safe from any
    /// thread.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.core.shutdown_handle().trigger()
    }

    /// A `Send` trigger for [`Scheduler::shutdown`].
    pub fn shutdown_handle(&self) -> Shutdown {
        self.core.shutdown_handle()
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.core.waiters.borrow().len()
    }
}

/// Weak reference to the scheduler, held by coroutines and readers.
#[derive(Clone)]
pub struct Handle {
    core: Weak<Core>,
}

impl Handle {
    pub(crate) fn core(&self) -> Rc<Core> {
        self.core.upgrade().expect("scheduler has been dropped")
    }

    /// Non-panicking upgrade, for drop paths that may outlive the scheduler.
    pub(crate) fn try_core(&self) -> Option<Rc<Core>> {
        self.core.upgrade()
    }

    /// See [`Scheduler::spawn`].
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.core().spawn(future);
    }

    /// See [`Scheduler::shutdown`].
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.core().shutdown_handle().trigger()
    }
}

/// Thread-safe, async-signal-safe shutdown trigger: a single `write(2)` to
/// the sentinel eventfd, the io_uring rendition of posting a zero-key
/// completion to a port.
#[derive(Clone, Copy, Debug)]
pub struct Shutdown {
    fd: RawFd,
}

impl Shutdown {
    pub fn trigger(&self) -> Result<(), SchedulerError> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                std::ptr::from_ref(&one).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize {
            Ok(())
        } else {
            Err(SchedulerError::Shutdown(io::Error::last_os_error()))
        }
    }
}
