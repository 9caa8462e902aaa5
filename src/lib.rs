//! Single-threaded coroutine file I/O, two ways.
//!
//! This crate pairs a suspension primitive ("read this source, resume me
//! when bytes are available") with an event loop that waits on the OS, maps
//! events back to the suspended coroutine, and resumes it — once for each of
//! the two kernel-facing designs:
//!
//! - [`reactor`] — *readiness*: edge-triggered epoll plus a signalfd that
//!   turns the shutdown signal into an ordinary readable event. The
//!   awaitable issues the non-blocking `read(2)` itself.
//! - [`proactor`] — *completion*: io_uring as the completion port. The
//!   kernel performs the read at an explicit offset and the completion key
//!   routes the result back to the parked coroutine; shutdown is a sentinel
//!   completion under the reserved key 0.
//!
//! Everything is single-threaded and cooperative: coroutine bodies, the
//! awaitables, and `run` all execute on the scheduler's thread. The one
//! cross-thread interaction is the `Shutdown` trigger, which goes through a
//! kernel-synchronised channel (a thread-directed signal, or an eventfd
//! write) rather than shared state.
//!
//! # Example
//!
//! Counting lines through the completion-based scheduler:
//!
//! ```no_run
//! use janus::proactor::Scheduler;
//!
//! fn main() -> anyhow::Result<()> {
//!     let scheduler = Scheduler::new()?;
//!     let handle = scheduler.handle();
//!
//!     let mut reader = scheduler.open("countline.log")?;
//!     scheduler.spawn(async move {
//!         let mut newlines = 0u64;
//!         loop {
//!             let chunk = reader.read(4096).await.expect("read failed");
//!             if chunk.is_empty() {
//!                 break;
//!             }
//!             newlines += chunk.iter().filter(|b| **b == b'\n').count() as u64;
//!         }
//!         println!("{newlines} lines");
//!         handle.shutdown().expect("shutdown");
//!     });
//!
//!     scheduler.run()?;
//!     Ok(())
//! }
//! ```
//!
//! Tasks are detached and eager: `spawn` runs the coroutine synchronously up
//! to its first suspension point and returns no join handle. Dropping a
//! scheduler drops every coroutine still parked in its wait map.

pub mod error;
pub mod proactor;
pub mod reactor;

mod task;

#[cfg(test)]
mod test_utils;

pub use error::{IoError, SchedulerError};
