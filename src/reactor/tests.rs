use super::*;
use crate::error::IoError;
use crate::test_utils::{DropFlag, mock_waker};
use anyhow::Result;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::{pipe2, write};
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::cell::{Cell, RefCell};
use std::os::fd::{AsFd, AsRawFd};
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

assert_impl_all!(Shutdown: Send, Sync, Copy);
assert_not_impl_any!(Scheduler: Send, Sync);

fn nonblocking_pipe() -> Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    Ok(pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?)
}

#[test]
fn pipe_readers_receive_their_bytes() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();

    let (r1, w1) = nonblocking_pipe()?;
    let (r2, w2) = nonblocking_pipe()?;
    write(&w1, b"abc")?;
    write(&w2, b"defgh")?;

    let chunks = Rc::new(RefCell::new([Vec::new(), Vec::new()]));
    let finished = Rc::new(Cell::new(0usize));

    for (idx, fd) in [r1, r2].into_iter().enumerate() {
        let handle = handle.clone();
        let chunks = Rc::clone(&chunks);
        let finished = Rc::clone(&finished);
        scheduler.spawn(async move {
            let chunk = handle.read(fd.as_fd(), 64).await.expect("pipe read");
            chunks.borrow_mut()[idx] = chunk;
            finished.set(finished.get() + 1);
            if finished.get() == 2 {
                handle.shutdown().expect("shutdown");
            }
        });
    }

    scheduler.run()?;

    assert_eq!(chunks.borrow()[0], b"abc");
    assert_eq!(chunks.borrow()[1], b"defgh");
    Ok(())
}

#[test]
fn shutdown_from_another_thread_destroys_parked_coroutines() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();

    // Writer end stays open and silent, so the read parks for good.
    let (r, _w) = nonblocking_pipe()?;
    let (guard, dropped) = DropFlag::new();
    let resumed = Rc::new(Cell::new(false));

    scheduler.spawn({
        let handle = handle.clone();
        let resumed = Rc::clone(&resumed);
        async move {
            let _guard = guard;
            let _ = handle.read(r.as_fd(), 64).await;
            resumed.set(true);
        }
    });

    let trigger = scheduler.shutdown_handle();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.trigger().expect("trigger shutdown");
    });

    scheduler.run()?;
    signaller.join().expect("signaller thread");

    // The run loop returned with the read still in flight; teardown frees
    // the parked frame without ever resuming it.
    assert!(!dropped.get());
    drop(scheduler);
    assert!(dropped.get());
    assert!(!resumed.get());
    Ok(())
}

#[test]
fn shutdown_before_run_returns_immediately() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    scheduler.shutdown()?;
    scheduler.run()?;
    Ok(())
}

#[test]
fn reregistration_does_not_duplicate_the_subscription() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();
    let (r, _w) = nonblocking_pipe()?;
    let fd = r.as_fd().as_raw_fd();

    let (first, _) = mock_waker();
    let (second, _) = mock_waker();
    handle.core().register(fd, &first)?;
    // A second add of the same fd would fail with EEXIST if the epoll
    // subscription were re-installed.
    handle.core().register(fd, &second)?;

    assert_eq!(scheduler.waiter_count(), 1);
    assert_eq!(scheduler.interest_count(), 1);
    Ok(())
}

#[test]
fn available_data_resolves_without_suspending() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();
    let (r, w) = nonblocking_pipe()?;
    write(&w, b"abc")?;

    let mut future = pin!(handle.read(r.as_fd(), 64));
    let (waker, wakes) = mock_waker();
    let mut cx = Context::from_waker(&waker);

    match future.as_mut().poll(&mut cx) {
        Poll::Ready(Ok(chunk)) => assert_eq!(chunk, b"abc"),
        other => panic!("expected immediate chunk, got {other:?}"),
    }
    assert_eq!(scheduler.waiter_count(), 0);
    assert_eq!(wakes.count(), 0);
    Ok(())
}

#[test]
fn resume_drains_bytes_written_while_parked() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();
    let (r, w) = nonblocking_pipe()?;

    let mut future = pin!(handle.read(r.as_fd(), 8));
    let (waker, _) = mock_waker();
    let mut cx = Context::from_waker(&waker);

    assert!(future.as_mut().poll(&mut cx).is_pending());
    assert_eq!(scheduler.waiter_count(), 1);

    write(&w, b"hi")?;
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(Ok(chunk)) => assert_eq!(chunk, b"hi"),
        other => panic!("expected drained chunk, got {other:?}"),
    }
    Ok(())
}

#[test]
fn closed_writer_yields_one_empty_chunk() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();
    let (r, w) = nonblocking_pipe()?;

    let mut future = pin!(handle.read(r.as_fd(), 8));
    let (waker, _) = mock_waker();
    let mut cx = Context::from_waker(&waker);

    assert!(future.as_mut().poll(&mut cx).is_pending());
    drop(w);

    match future.as_mut().poll(&mut cx) {
        Poll::Ready(Ok(chunk)) => assert!(chunk.is_empty(), "EOF must be an empty chunk"),
        other => panic!("expected EOF chunk, got {other:?}"),
    }
    Ok(())
}

#[test]
fn unreadable_fd_raises_io_error() -> Result<()> {
    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();
    // Reading the write end of a pipe fails with EBADF.
    let (_r, w) = nonblocking_pipe()?;

    let mut future = pin!(handle.read(w.as_fd(), 8));
    let (waker, _) = mock_waker();
    let mut cx = Context::from_waker(&waker);

    match future.as_mut().poll(&mut cx) {
        Poll::Ready(Err(err @ IoError::Read { .. })) => {
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        }
        other => panic!("expected read error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn newline_count_over_a_pipe() -> Result<()> {
    const LINES: usize = 10_000;

    let scheduler = Scheduler::new(Signal::SIGUSR1)?;
    let handle = scheduler.handle();
    let (r, w) = nonblocking_pipe()?;
    let counted = Rc::new(Cell::new(0usize));

    scheduler.spawn({
        let handle = handle.clone();
        let counted = Rc::clone(&counted);
        async move {
            let mut newlines = 0;
            while newlines < LINES {
                let chunk = handle.read(r.as_fd(), 4096).await.expect("pipe read");
                newlines += chunk.iter().filter(|b| **b == b'\n').count();
            }
            counted.set(newlines);
            handle.shutdown().expect("shutdown");
        }
    });

    let writer = thread::spawn(move || {
        let payload = vec![b'\n'; LINES];
        for part in payload.chunks(1500) {
            write(&w, part).expect("pipe write");
            thread::sleep(Duration::from_millis(1));
        }
    });

    scheduler.run()?;
    writer.join().expect("writer thread");

    assert_eq!(counted.get(), LINES);
    Ok(())
}
