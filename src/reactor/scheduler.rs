use crate::error::SchedulerError;
use crate::reactor::read::ChunkRead;
use crate::task::Tasks;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::task::Waker;
use tracing::{debug, trace};

/// Upper bound on events drained per `epoll_wait` call.
const MAX_EVENTS: usize = 16;

pub(crate) struct Core {
    epoll: Epoll,
    signal_fd: SignalFd,
    signal_raw: RawFd,
    signum: Signal,
    loop_thread: Pthread,

    /// Fds with an installed epoll subscription. Subscriptions are
    /// edge-triggered and never removed; only the parked waker turns over.
    interests: RefCell<HashSet<RawFd>>,

    /// One parked continuation per fd, present iff a coroutine is suspended
    /// waiting for readiness on that fd.
    waiters: RefCell<HashMap<RawFd, Waker>>,

    tasks: Tasks,
}

impl Core {
    /// Install the readiness subscription on first sight of `fd`, then park
    /// the waker. Re-registering an fd only replaces its waker, so the
    /// OS-level subscription is never duplicated.
    pub(crate) fn register(&self, fd: RawFd, waker: &Waker) -> Result<(), SchedulerError> {
        if self.interests.borrow_mut().insert(fd) {
            let event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, fd as u64);
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(errno) = self.epoll.add(borrowed, event) {
                self.interests.borrow_mut().remove(&fd);
                return Err(SchedulerError::Register {
                    fd,
                    source: errno.into(),
                });
            }
            trace!(fd, "edge-triggered read interest installed");
        }

        self.waiters.borrow_mut().insert(fd, waker.clone());
        Ok(())
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.tasks.spawn(future);
    }

    fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            thread: self.loop_thread,
            signum: self.signum,
        }
    }

    fn drain_signal(&self) -> Result<(), SchedulerError> {
        while let Some(info) = self
            .signal_fd
            .read_signal()
            .map_err(|errno| SchedulerError::Shutdown(errno.into()))?
        {
            debug!(signal = info.ssi_signo, "shutdown signal drained");
        }
        Ok(())
    }
}

/// The readiness-based scheduler: an edge-triggered epoll instance plus a
/// signalfd that turns the configured shutdown signal into an ordinary
/// readable event.
///
/// Owns every spawned task. Dropping the scheduler drops all still-parked
/// coroutine frames. Construction, `spawn`, and `run` must all happen on the
/// same thread; only [`Shutdown`] may be used from elsewhere.
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    /// Create the epoll instance and arm `signum` as the shutdown source.
    ///
    /// The signal is blocked on the calling thread and consumed through a
    /// signalfd, so it is always observed as an epoll event and never enters
    /// an async signal handler.
    pub fn new(signum: Signal) -> Result<Self, SchedulerError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| SchedulerError::Setup(errno.into()))?;

        let mut mask = SigSet::empty();
        mask.add(signum);
        mask.thread_block()
            .map_err(|errno| SchedulerError::Setup(errno.into()))?;

        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|errno| SchedulerError::Setup(errno.into()))?;
        let signal_raw = signal_fd.as_fd().as_raw_fd();

        epoll
            .add(
                signal_fd.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, signal_raw as u64),
            )
            .map_err(|errno| SchedulerError::Register {
                fd: signal_raw,
                source: errno.into(),
            })?;
        debug!(signal = %signum, fd = signal_raw, "shutdown source armed");

        Ok(Self {
            core: Rc::new(Core {
                epoll,
                signal_fd,
                signal_raw,
                signum,
                loop_thread: pthread_self(),
                interests: RefCell::new(HashSet::new()),
                waiters: RefCell::new(HashMap::new()),
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

    /// Block draining OS events until the shutdown signal arrives.
    ///
    /// Each readiness event resumes the continuation parked on its fd, in the
    /// order the kernel reports them; a resumed coroutine may re-register
    /// before the batch is finished. Returns when the signalfd fires, after
    /// draining the signal record. Calling `run` from inside a task is not
    /// supported.
    pub fn run(&self) -> Result<(), SchedulerError> {
        let core = &*self.core;
        core.tasks.run_woken();

        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        loop {
            let n = match core.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(SchedulerError::Wait(errno.into())),
            };

            for event in &events[..n] {
                let fd = event.data() as RawFd;
                if fd == core.signal_raw {
                    core.drain_signal()?;
                    return Ok(());
                }

                trace!(fd, "readiness event");
                if let Some(waker) = core.waiters.borrow_mut().remove(&fd) {
                    waker.wake();
                }
                core.tasks.run_woken();
            }
        }
    }

    /// Make `run` return. Safe from any thread.
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

    #[cfg(test)]
    pub(crate) fn interest_count(&self) -> usize {
        self.core.interests.borrow().len()
    }
}

/// Weak reference to the scheduler, held by coroutines and awaitables.
///
/// Holding only a weak reference keeps scheduler teardown deterministic: a
/// parked coroutine that captured a handle does not keep its own owner alive.
#[derive(Clone)]
pub struct Handle {
    core: Weak<Core>,
}

impl Handle {
    pub(crate) fn core(&self) -> Rc<Core> {
        self.core.upgrade().expect("scheduler has been dropped")
    }

    /// Read up to `capacity` bytes from a non-blocking fd, suspending until
    /// the fd becomes readable.
    ///
    /// The subscription is edge-triggered: one `ChunkRead` performs exactly
    /// one read attempt per resume, so callers must keep awaiting until the
    /// source is drained (an empty chunk signals EOF).
    pub fn read<'fd>(&self, fd: BorrowedFd<'fd>, capacity: usize) -> ChunkRead<'fd> {
        ChunkRead::new(self.clone(), fd, capacity)
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

/// Thread-safe shutdown trigger: delivers the configured signal directly to
/// the scheduler's thread, where it is blocked and consumed via signalfd.
#[derive(Clone, Copy, Debug)]
pub struct Shutdown {
    thread: Pthread,
    signum: Signal,
}

impl Shutdown {
    pub fn trigger(&self) -> Result<(), SchedulerError> {
        pthread_kill(self.thread, self.signum)
            .map_err(|errno| SchedulerError::Shutdown(errno.into()))
    }
}
