//! Error types surfaced by the reactor and the write queue.
//!
//! Only caller mistakes and fatal construction failures are surfaced as
//! [`Error`]. Transient I/O races (stale registrations, platform anomalies)
//! are recovered locally by closing the affected channel or notifying the
//! registered task; they never reach application callers.

use std::io;

use thiserror::Error;

/// Errors returned by the public reactor and write-queue APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value is invalid: an empty or out-of-range interest
    /// mask, an io-ratio outside `(0, 100]`, or inverted watermarks.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The reactor has begun shutting down and no longer accepts
    /// registrations.
    #[error("reactor is shutting down")]
    ShutDown,

    /// The owning channel's execution context has been detached; the write
    /// queue no longer accepts entries.
    #[error("channel execution context has been detached")]
    Detached,

    /// The OS multiplexer could not be opened. Fatal to reactor
    /// construction.
    #[error("failed to open a multiplexer")]
    MultiplexerOpen(#[source] io::Error),

    /// An endpoint could not be registered with the current multiplexer.
    #[error("failed to register endpoint with the multiplexer")]
    Registration(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
