//! Hand-off between the real-time callback and the writer thread.
//!
//! Two structures cross the thread boundary:
//!
//! - the **handoff queue**, a bounded FIFO of owned [`AudioBlock`]s built on
//!   `crossbeam_channel::bounded`. `try_push` never blocks and fails with the
//!   block when the queue is full; `pop_timeout` waits at most one timeout so
//!   the writer can notice a stop request.
//! - the **block pool**, a `ringbuf::HeapRb` SPSC ring carrying emptied blocks
//!   back from the writer to the callback so steady-state capture reuses
//!   storage instead of allocating on the audio thread.

pub mod block;

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

use block::AudioBlock;

/// Default number of blocks the handoff queue can hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Extra pool slots beyond the queue capacity: one block held by the callback
/// and one by the writer at any time.
const POOL_SLACK: usize = 2;

/// Producer half of the handoff queue, held by the real-time callback.
#[derive(Debug, Clone)]
pub struct BlockSender {
    inner: Sender<AudioBlock>,
}

/// Consumer half of the handoff queue, held by the writer thread.
#[derive(Debug)]
pub struct BlockReceiver {
    inner: Receiver<AudioBlock>,
}

/// Why a push was refused. Both variants hand the block back.
#[derive(Debug)]
pub enum PushError {
    Full(AudioBlock),
    Closed(AudioBlock),
}

impl PushError {
    pub fn into_block(self) -> AudioBlock {
        match self {
            PushError::Full(b) | PushError::Closed(b) => b,
        }
    }
}

/// Result of a timed pop.
#[derive(Debug)]
pub enum Pop {
    Block(AudioBlock),
    TimedOut,
    Closed,
}

/// Create a bounded handoff queue holding at most `capacity` blocks.
///
/// `capacity` must be at least 1; a zero-capacity crossbeam channel is a
/// rendezvous channel and would make every non-blocking push fail.
pub fn handoff_queue(capacity: usize) -> (BlockSender, BlockReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (BlockSender { inner: tx }, BlockReceiver { inner: rx })
}

impl BlockSender {
    /// Non-blocking push. Wait-free on the bounded array channel.
    pub fn try_push(&self, block: AudioBlock) -> std::result::Result<(), PushError> {
        self.inner.try_send(block).map_err(|e| match e {
            TrySendError::Full(b) => PushError::Full(b),
            TrySendError::Disconnected(b) => PushError::Closed(b),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().unwrap_or(0)
    }
}

impl BlockReceiver {
    /// Wait up to `timeout` for the next block.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        match self.inner.recv_timeout(timeout) {
            Ok(block) => Pop::Block(block),
            Err(RecvTimeoutError::Timeout) => Pop::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    pub fn try_pop(&self) -> Option<AudioBlock> {
        self.inner.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Writer side of the block pool: returns emptied blocks.
pub type PoolProducer = ringbuf::HeapProd<AudioBlock>;

/// Callback side of the block pool: takes blocks to fill.
pub type PoolConsumer = ringbuf::HeapCons<AudioBlock>;

/// Create a block pool sized for a queue of `queue_capacity` blocks and
/// pre-fill it with `prefill` blocks of `frames` × `channels` capacity.
///
/// Allocation happens here, on the caller's thread, before any stream opens.
pub fn block_pool(
    queue_capacity: usize,
    prefill: usize,
    frames: usize,
    channels: u16,
) -> (PoolProducer, PoolConsumer) {
    let slots = queue_capacity.max(1) + POOL_SLACK;
    let (mut prod, cons) = HeapRb::<AudioBlock>::new(slots).split();
    for _ in 0..prefill.min(slots) {
        if prod.try_push(AudioBlock::with_capacity(frames, channels)).is_err() {
            break;
        }
    }
    (prod, cons)
}
