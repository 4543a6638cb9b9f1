//! Span Buffer - Pure Batching Abstraction
//!
//! Holds finished spans in finish order and decides when a batch is ready:
//! either `max_batch_size` spans are waiting, or the oldest waiting span has
//! been buffered for `max_delay`.
//!
//! The buffer has no locks, no atomics and no exporter. Concurrency lives in
//! [`processor`](crate::processor), which wraps the buffer in a mutex shared
//! by span-finishing call sites and the background worker.
//!
//! # Batch lifecycle
//!
//! ```text
//! accumulating ──(size or age threshold)──► ready ──take_batch()──► sending
//! ```
//!
//! A batch that leaves the buffer never comes back: the exporter either
//! delivers it or it is dropped.

use crate::span::{Span, SpanBatch};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch accumulation
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of spans per batch; reaching it makes a batch ready
    pub max_batch_size: usize,
    /// Maximum time the oldest span waits before a batch is ready
    pub max_delay: Duration,
    /// Spans beyond this many are rejected
    pub max_queue_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            max_delay: Duration::from_secs(5),
            max_queue_size: 2048,
        }
    }
}

/// Result of offering a span to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Span queued; holds the number of spans now waiting
    Queued(usize),
    /// Queue full; span discarded
    Dropped,
}

#[derive(Debug)]
pub struct SpanBuffer {
    /// Finished spans with the instant they were queued, oldest first
    pending: VecDeque<(Instant, Span)>,
    config: BufferConfig,
    dropped: u64,
}

impl SpanBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(config.max_batch_size.min(config.max_queue_size)),
            config,
            dropped: 0,
        }
    }

    pub fn push(&mut self, span: Span) -> Push {
        if self.pending.len() >= self.config.max_queue_size {
            self.dropped += 1;
            return Push::Dropped;
        }
        self.pending.push_back((Instant::now(), span));
        Push::Queued(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Spans rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// True once the size or age threshold has been reached.
    pub fn should_flush(&self) -> bool {
        self.pending.len() >= self.config.max_batch_size
            || self
                .flush_deadline()
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Instant at which the oldest waiting span hits `max_delay`.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.pending
            .front()
            .and_then(|(queued_at, _)| queued_at.checked_add(self.config.max_delay))
    }

    /// Removes up to `max_batch_size` of the oldest spans as one batch.
    ///
    /// Returns `None` if no spans are pending.
    pub fn take_batch(&mut self) -> Option<SpanBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let count = self.pending.len().min(self.config.max_batch_size);
        let spans = self.pending.drain(..count).map(|(_, span)| span).collect();
        Some(SpanBatch::with_spans(spans))
    }

    /// Discards everything still waiting. Returns how many spans were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        self.dropped += count as u64;
        count
    }
}
