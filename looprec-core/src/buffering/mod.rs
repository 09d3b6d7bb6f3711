//! Bounded block ring bridging the real-time capture callback and the
//! writer thread.
//!
//! Built on `crossbeam-channel` bounded channels: `try_send`/`try_recv` on
//! an array-backed channel never block on I/O and never allocate, which is
//! what the device callback needs. Two queues cooperate:
//!
//! - the **block queue** carries whole [`AudioBlock`]s producer → consumer
//!   (a block is only ever visible to the consumer fully populated);
//! - the **recycle queue** returns drained sample buffers consumer →
//!   producer so the callback reuses allocations instead of making new ones.
//!
//! When the block queue is full the producer evicts the *oldest* unread
//! block, counts the loss, and enqueues the new block — real-time safety is
//! traded against bounded data loss, never against blocking the callback.
//!
//! Single-producer/single-consumer discipline by convention: exactly one
//! callback pushes and exactly one writer thread drains.

pub mod block;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use block::AudioBlock;

/// Default ring capacity in blocks. Device callbacks deliver roughly 10 ms
/// of audio each, so 256 blocks absorb over two seconds of writer stall.
pub const DEFAULT_RING_BLOCKS: usize = 256;

/// Shared overrun counters, observable from the status snapshot while the
/// producer keeps running.
#[derive(Debug, Default)]
pub struct RingCounters {
    /// Blocks evicted because the consumer fell behind.
    pub dropped_blocks: AtomicU64,
    /// Frames lost with those blocks.
    pub dropped_frames: AtomicU64,
}

impl RingCounters {
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Producer half — held by the capture callback.
pub struct BlockProducer {
    tx: Sender<AudioBlock>,
    /// Clone of the consumer end, used only to evict the oldest block on
    /// overrun. Never used for ordinary draining.
    evict_rx: Receiver<AudioBlock>,
    recycle_rx: Receiver<Vec<f32>>,
    recycle_tx: Sender<Vec<f32>>,
    counters: Arc<RingCounters>,
}

impl BlockProducer {
    /// Take a recycled sample buffer, or a fresh one if the pool is empty.
    /// The returned buffer is cleared and keeps its prior capacity.
    pub fn lease(&self) -> Vec<f32> {
        match self.recycle_rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::new(),
        }
    }

    /// Enqueue a block without blocking. On a full ring the oldest unread
    /// block is dropped and counted; the new block is then enqueued.
    pub fn push(&self, block: AudioBlock) {
        let mut block = block;
        loop {
            match self.tx.try_send(block) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    block = returned;
                    match self.evict_rx.try_recv() {
                        Ok(old) => {
                            self.counters.dropped_blocks.fetch_add(1, Ordering::Relaxed);
                            self.counters
                                .dropped_frames
                                .fetch_add(old.frames(), Ordering::Relaxed);
                            // Hand the evicted buffer straight back to the pool.
                            let _ = self.recycle_tx.try_send(old.samples);
                        }
                        Err(_) => {
                            // Raced with the consumer draining; retry the send.
                        }
                    }
                }
                Err(TrySendError::Disconnected(dropped)) => {
                    // Consumer gone (pipeline stopped) — count as loss.
                    self.counters.dropped_blocks.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .dropped_frames
                        .fetch_add(dropped.frames(), Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    pub fn counters(&self) -> Arc<RingCounters> {
        Arc::clone(&self.counters)
    }
}

/// Consumer half — held by the writer thread.
pub struct BlockConsumer {
    rx: Receiver<AudioBlock>,
    recycle_tx: Sender<Vec<f32>>,
    counters: Arc<RingCounters>,
}

impl BlockConsumer {
    /// Drain the next block in FIFO order, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<AudioBlock> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drain without waiting. Used when flushing on stop.
    pub fn try_pop(&self) -> Option<AudioBlock> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Return a drained buffer to the producer's pool. Full pool → buffer
    /// is simply freed.
    pub fn recycle(&self, buf: Vec<f32>) {
        let _ = self.recycle_tx.try_send(buf);
    }

    pub fn counters(&self) -> Arc<RingCounters> {
        Arc::clone(&self.counters)
    }
}

/// Create a matched producer/consumer pair with `capacity` block slots.
pub fn create_block_ring(capacity: usize) -> (BlockProducer, BlockConsumer, Arc<RingCounters>) {
    let capacity = capacity.max(2);
    let (tx, rx) = bounded::<AudioBlock>(capacity);
    let (recycle_tx, recycle_rx) = bounded::<Vec<f32>>(capacity + 2);
    let counters = Arc::new(RingCounters::default());

    let producer = BlockProducer {
        tx,
        evict_rx: rx.clone(),
        recycle_rx,
        recycle_tx: recycle_tx.clone(),
        counters: Arc::clone(&counters),
    };
    let consumer = BlockConsumer {
        rx,
        recycle_tx,
        counters: Arc::clone(&counters),
    };
    (producer, consumer, counters)
}
