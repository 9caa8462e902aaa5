//! Readiness-based variant: edge-triggered epoll plus signalfd shutdown.
//!
//! The kernel reports that an fd *will not block*; the awaitable then issues
//! the `read(2)` itself. See [`ChunkRead`] for the pre-read/park/drain
//! protocol this implies.

mod read;
mod scheduler;

pub use read::{ChunkRead, open_nonblocking};
pub use scheduler::{Handle, Scheduler, Shutdown};

#[cfg(test)]
mod tests;
