//! Single-threaded I/O reactor with flow-controlled write queues.
//!
//! This crate is the concurrency core of an asynchronous network transport:
//! one dedicated thread multiplexes many endpoints, fairly time-slices
//! between readiness dispatch and queued tasks, and defends against known
//! platform multiplexer defects. Per-channel write queues provide
//! backpressure with watermark-based writability and reentrancy-safe,
//! exactly-once promise completion.
//!
//! # Architecture
//!
//! - **Reactor**: owns the multiplexer and the registration table, runs the
//!   loop that alternates between waits, readiness dispatch and task
//!   execution
//! - **ReactorHandle**: cloneable cross-thread handle; task submission,
//!   scheduling, wakeup, rebuild and shutdown requests
//! - **Multiplexer / MultiplexerProvider**: the OS wait primitive behind a
//!   rebuildable seam (epoll on Linux, kqueue on macOS and the BSDs)
//! - **PendingWriteQueue**: per-channel FIFO of pending writes with
//!   watermark-driven writability notifications
//! - **WritePromise**: complete-exactly-once completion promises with
//!   synchronous listeners
//!
//! Channel pipelines, codecs, buffer pools and bootstrap wiring are
//! collaborators, not residents: the reactor only invokes the abstract
//! [`ChannelIo`] and [`IoTask`] operations.

mod builder;
mod channel;
mod config;
mod error;
mod interest;
mod promise;
pub mod reactor;
mod task;
mod write_queue;

pub use builder::ReactorBuilder;
pub use channel::{Attachment, ChannelIo, Endpoint, IoTask};
pub use error::{Error, Result};
pub use interest::Interest;
pub use promise::{WriteOutcome, WritePromise};
pub use reactor::poller::{
    Multiplexer, MultiplexerProvider, OsProvider, ReadyEvent, WakeSignal,
};
pub use reactor::{LoopState, Reactor, ReactorHandle, Registration};
pub use task::ReactorTask;
pub use write_queue::{ChannelContext, PendingWriteQueue, WireMessage, WriteWatermarks};
