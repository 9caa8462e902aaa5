//! Completion-based variant: io_uring as the completion port.
//!
//! The kernel executes the read itself and reports *completion*: the bytes
//! are already in the caller-supplied buffer when the CQE arrives. Reads
//! carry an explicit file offset, tracked by [`FileReader`].

mod read;
mod scheduler;

pub use read::{FileReader, ReadChunk};
pub use scheduler::{Handle, Scheduler, Shutdown};
