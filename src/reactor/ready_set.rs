//! Readiness-set container with an allocation-avoiding fast path.
//!
//! Selected at multiplexer-construction time by a capability probe: when the
//! backend advertises a pre-size through
//! [`Multiplexer::flip_capacity`](crate::reactor::poller::Multiplexer::flip_capacity)
//! and the optimization is not disabled, readiness notifications are
//! collected into a reusable, pre-sized buffer pair whose `flip` hands the
//! filled batch to dispatch and rearms an empty buffer for the next wait.
//! Otherwise every iteration collects into a freshly allocated buffer.
//!
//! Both paths deliver the same set of ready registrations exactly once per
//! iteration; only the allocation behavior differs.

use log::trace;

use crate::reactor::poller::{Multiplexer, ReadyEvent};

pub(crate) enum ReadySet {
    Flip {
        active: Vec<ReadyEvent>,
        spare: Vec<ReadyEvent>,
    },
    Plain {
        active: Vec<ReadyEvent>,
    },
}

impl ReadySet {
    /// Probes `mux` for the optimized representation, falling back silently.
    pub(crate) fn probe(mux: &dyn Multiplexer, disabled: bool) -> ReadySet {
        if disabled {
            trace!("readiness-set optimization disabled; using plain buffers");
            return ReadySet::Plain { active: Vec::new() };
        }
        match mux.flip_capacity() {
            Some(capacity) => {
                trace!("using reusable readiness set (capacity {capacity})");
                ReadySet::Flip {
                    active: Vec::with_capacity(capacity),
                    spare: Vec::with_capacity(capacity),
                }
            }
            None => {
                trace!("multiplexer does not support the reusable readiness set");
                ReadySet::Plain { active: Vec::new() }
            }
        }
    }

    /// The buffer the next wait call fills.
    pub(crate) fn buffer_mut(&mut self) -> &mut Vec<ReadyEvent> {
        match self {
            ReadySet::Flip { active, .. } => active,
            ReadySet::Plain { active } => active,
        }
    }

    /// Takes the filled batch for dispatch and rearms for the next wait.
    pub(crate) fn flip(&mut self) -> Vec<ReadyEvent> {
        match self {
            ReadySet::Flip { active, spare } => std::mem::replace(active, std::mem::take(spare)),
            ReadySet::Plain { active } => std::mem::take(active),
        }
    }

    /// Returns a processed batch, keeping its allocation on the fast path.
    pub(crate) fn recycle(&mut self, mut batch: Vec<ReadyEvent>) {
        match self {
            ReadySet::Flip { spare, .. } => {
                batch.clear();
                *spare = batch;
            }
            ReadySet::Plain { .. } => drop(batch),
        }
    }
}
