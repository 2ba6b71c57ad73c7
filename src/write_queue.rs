//! Flow-controlled queue of pending outbound writes.
//!
//! A [`PendingWriteQueue`] buffers messages that could not be written
//! immediately, tracks the buffered byte volume against a per-channel
//! watermark pair, and guarantees ordered, exactly-once completion of each
//! entry's [`WritePromise`], including under reentrant completion listeners.
//!
//! The queue is owned by exactly one channel's output path and is only ever
//! touched from the reactor thread. The channel supplies a
//! [`ChannelContext`] which provides the underlying write path and receives
//! writability notifications.
//!
//! # Writability
//!
//! The derived `writable` flag is edge-triggered: it flips to false when the
//! buffered volume first exceeds the high watermark, back to true when it
//! first falls to or below the low watermark, and
//! [`ChannelContext::writability_changed`] fires only on those flips, never
//! on non-crossing mutations.
//!
//! # Reentrancy
//!
//! Promise listeners may call back into the same queue. Every mutation
//! releases internal borrows before invoking user code, writability
//! notifications fire before the affected entry's promise completes, and a
//! fail-all drains entries queued by its own listeners only after all
//! previously queued entries have been failed.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::error::Error;
use crate::promise::WritePromise;

/// An outbound message with a known encoded size.
///
/// Messages are held behind `Rc`; dropping the queue's reference on removal
/// or failure is the exactly-once release of the queue's share of the
/// resource.
pub trait WireMessage {
    /// Number of bytes this message contributes to the buffered volume.
    fn byte_size(&self) -> usize;
}

/// The channel-side collaborators of a write queue.
pub trait ChannelContext {
    /// True once the owning channel's execution context has been detached;
    /// a detached queue accepts no further entries.
    fn is_detached(&self) -> bool;

    /// The underlying write path. Implementations complete `promise` with
    /// the write's outcome, possibly synchronously.
    fn write(&self, msg: Rc<dyn WireMessage>, promise: WritePromise);

    /// Fired on every writability flip, synchronously from the mutating
    /// call.
    fn writability_changed(&self, writable: bool);
}

/// Byte thresholds controlling the derived writability of a channel.
#[derive(Clone, Copy, Debug)]
pub struct WriteWatermarks {
    low: usize,
    high: usize,
}

impl WriteWatermarks {
    /// Creates a watermark pair. Fails with [`Error::Configuration`] unless
    /// `low <= high`.
    pub fn new(low: usize, high: usize) -> Result<Self, Error> {
        if low > high {
            return Err(Error::Configuration(format!(
                "write watermarks: low {low} must not exceed high {high}"
            )));
        }
        Ok(Self { low, high })
    }

    /// The low watermark in bytes.
    pub fn low(&self) -> usize {
        self.low
    }

    /// The high watermark in bytes.
    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for WriteWatermarks {
    /// 32 KiB low, 64 KiB high.
    fn default() -> Self {
        Self {
            low: 32 * 1024,
            high: 64 * 1024,
        }
    }
}

struct PendingWrite {
    msg: Rc<dyn WireMessage>,
    size: usize,
    promise: WritePromise,
}

/// FIFO queue of pending writes with watermark-based backpressure.
///
/// # Example
///
/// ```ignore
/// let queue = PendingWriteQueue::new(ctx.clone(), WriteWatermarks::default());
/// queue.add(msg, promise)?;
/// while queue.remove_and_write().is_some() {}
/// ```
pub struct PendingWriteQueue {
    ctx: Rc<dyn ChannelContext>,
    watermarks: WriteWatermarks,
    entries: RefCell<VecDeque<PendingWrite>>,
    bytes: Cell<usize>,
    writable: Cell<bool>,
    failing_all: Cell<bool>,
}

impl PendingWriteQueue {
    /// Creates an empty queue bound to `ctx`.
    pub fn new(ctx: Rc<dyn ChannelContext>, watermarks: WriteWatermarks) -> Self {
        Self {
            ctx,
            watermarks,
            entries: RefCell::new(VecDeque::new()),
            bytes: Cell::new(0),
            writable: Cell::new(true),
            failing_all: Cell::new(false),
        }
    }

    /// Appends `msg` to the tail of the queue.
    ///
    /// Fails with [`Error::Detached`] if the channel context has been
    /// detached; in that case the message reference is released and the
    /// promise failed before returning. If the buffered volume crosses
    /// above the high watermark, the writability notification fires before
    /// this method returns.
    pub fn add(&self, msg: Rc<dyn WireMessage>, promise: WritePromise) -> Result<(), Error> {
        if self.ctx.is_detached() {
            drop(msg);
            promise.fail(Rc::new(io::Error::other(
                "channel execution context has been detached",
            )));
            return Err(Error::Detached);
        }

        let size = msg.byte_size();
        self.entries.borrow_mut().push_back(PendingWrite {
            msg,
            size,
            promise,
        });

        self.bytes.set(self.bytes.get() + size);
        if self.writable.get() && self.bytes.get() > self.watermarks.high {
            self.writable.set(false);
            self.ctx.writability_changed(false);
        }
        Ok(())
    }

    /// The head message, without removing it.
    pub fn current(&self) -> Option<Rc<dyn WireMessage>> {
        self.entries.borrow().front().map(|entry| entry.msg.clone())
    }

    /// Removes the head entry, releasing its message.
    ///
    /// Returns the entry's still-incomplete promise; the writability
    /// notification for the removal fires before this method returns, so a
    /// caller completing the promise observes updated writability from its
    /// listeners.
    pub fn remove(&self) -> Option<WritePromise> {
        let entry = self.entries.borrow_mut().pop_front()?;
        drop(entry.msg);
        self.release_bytes(entry.size);
        Some(entry.promise)
    }

    /// Removes the head entry and forwards it to the underlying write path,
    /// chaining the entry's promise to the write outcome.
    ///
    /// Returns `None` if the queue was empty at call time.
    pub fn remove_and_write(&self) -> Option<WritePromise> {
        let entry = self.entries.borrow_mut().pop_front()?;
        self.release_bytes(entry.size);
        let promise = entry.promise.clone();
        self.ctx.write(entry.msg, entry.promise);
        Some(promise)
    }

    /// Removes every entry present at call time and forwards each to the
    /// underlying write path in FIFO order.
    ///
    /// Returns an aggregate promise over the removed entries, or `None` if
    /// the queue was empty. Entries added reentrantly by completion
    /// listeners stay queued for a later call; they are never dropped and
    /// never written twice.
    pub fn remove_and_write_all(&self) -> Option<WritePromise> {
        let drained: Vec<PendingWrite> = {
            let mut entries = self.entries.borrow_mut();
            if entries.is_empty() {
                return None;
            }
            entries.drain(..).collect()
        };

        let total: usize = drained.iter().map(|entry| entry.size).sum();
        self.release_bytes(total);

        let parts: Vec<WritePromise> = drained.iter().map(|entry| entry.promise.clone()).collect();
        let combined = WritePromise::aggregate(&parts);
        for entry in drained {
            self.ctx.write(entry.msg, entry.promise);
        }
        Some(combined)
    }

    /// Removes the head entry, releases its message and fails its promise
    /// with `cause`.
    ///
    /// Returns the failed promise, or `None` if the queue was empty.
    pub fn remove_and_fail(&self, cause: Rc<io::Error>) -> Option<WritePromise> {
        let entry = self.entries.borrow_mut().pop_front()?;
        drop(entry.msg);
        self.release_bytes(entry.size);
        entry.promise.fail(cause);
        Some(entry.promise)
    }

    /// Removes every entry, releases each message and fails each promise
    /// with `cause`, in strict FIFO order.
    ///
    /// Entries enqueued by failure listeners are failed after all
    /// previously queued entries; a reentrant fail-all issued from a
    /// listener defers to this drain rather than overtaking it. Calling on
    /// an empty queue is a no-op.
    pub fn remove_and_fail_all(&self, cause: Rc<io::Error>) {
        if self.failing_all.get() {
            // A drain is already in progress further up the stack; it will
            // pick up anything queued meanwhile.
            return;
        }

        self.failing_all.set(true);
        loop {
            let drained: Vec<PendingWrite> = self.entries.borrow_mut().drain(..).collect();
            if drained.is_empty() {
                break;
            }

            let total: usize = drained.iter().map(|entry| entry.size).sum();
            self.release_bytes(total);

            for entry in drained {
                drop(entry.msg);
                entry.promise.fail(cause.clone());
            }
        }
        self.failing_all.set(false);
    }

    /// Number of entries not yet removed. O(1).
    pub fn size(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True if no entries are pending. O(1).
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Buffered byte volume of the not-yet-removed entries.
    pub fn buffered_bytes(&self) -> usize {
        self.bytes.get()
    }

    /// The current derived writability.
    pub fn is_writable(&self) -> bool {
        self.writable.get()
    }

    fn release_bytes(&self, size: usize) {
        let bytes = self.bytes.get() - size;
        self.bytes.set(bytes);
        if !self.writable.get() && bytes <= self.watermarks.low {
            self.writable.set(true);
            self.ctx.writability_changed(true);
        }
    }
}
