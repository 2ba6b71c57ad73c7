//! The I/O reactor and its supporting pieces.
//!
//! - [`core`]: the loop itself, with readiness dispatch, time-slicing and
//!   the multiplexer rebuild workaround
//! - [`handle`]: the cross-thread handle and wakeup protocol
//! - [`poller`]: the multiplexer abstraction and platform backends
//! - [`ready_set`]: the readiness-set container with its allocation-free
//!   fast path
//! - [`registration`]: endpoint registration handles

pub(crate) mod core;
pub(crate) mod handle;
pub mod poller;
pub(crate) mod ready_set;
pub(crate) mod registration;

pub use self::core::{LoopState, Reactor};
pub use self::handle::ReactorHandle;
pub use self::registration::Registration;
