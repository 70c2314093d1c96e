//! Gap healing
//!
//! Frames that arrive ahead of the expected index are buffered while the
//! missing range is re-requested from the transport. Each object gets a fixed
//! number of requests; once they are spent the chain is declared
//! desynchronized.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use hgx_core::Frame;

/// What happened to a frame offered to the healer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Held until the gap closes
    Buffered,
    /// A frame for this index is already held
    AlreadyBuffered,
    /// The buffer is full and the frame was dropped
    Overflow,
}

/// Per-object healing state
#[derive(Debug, Clone)]
pub struct GapHealer {
    buffered: BTreeMap<u64, Frame>,
    attempts: u32,
    last_request: Option<Instant>,
    max_buffered: usize,
}

impl GapHealer {
    /// Healer buffering at most `max_buffered` frames
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buffered: BTreeMap::new(),
            attempts: 0,
            last_request: None,
            max_buffered,
        }
    }

    /// Hold a frame that arrived ahead of the chain
    pub fn buffer(&mut self, frame: Frame) -> BufferOutcome {
        if self.buffered.contains_key(&frame.index) {
            return BufferOutcome::AlreadyBuffered;
        }
        if self.buffered.len() >= self.max_buffered {
            return BufferOutcome::Overflow;
        }
        self.buffered.insert(frame.index, frame);
        BufferOutcome::Buffered
    }

    /// Whether a gap is open
    pub fn is_healing(&self) -> bool {
        !self.buffered.is_empty()
    }

    /// Range `[expected, first buffered)` still missing
    pub fn missing_range(&self, expected: u64) -> Option<(u64, u64)> {
        let first = *self.buffered.keys().next()?;
        (first > expected).then_some((expected, first))
    }

    /// Take the buffered frame at `index`, if held
    pub fn take(&mut self, index: u64) -> Option<Frame> {
        self.buffered.remove(&index)
    }

    /// Drop buffered frames below `index`
    pub fn discard_below(&mut self, index: u64) {
        self.buffered = self.buffered.split_off(&index);
    }

    /// Whether a request is due at `now`
    pub fn request_due(&self, now: Instant, interval: Duration) -> bool {
        match self.last_request {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        }
    }

    /// Record a retransmission request
    pub fn record_request(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_request = Some(now);
    }

    /// Requests issued for the open gap
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Frames waiting for the gap to close
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Forget the gap once the chain has caught up
    pub fn settle(&mut self) {
        if self.buffered.is_empty() {
            self.attempts = 0;
            self.last_request = None;
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.buffered.clear();
        self.attempts = 0;
        self.last_request = None;
    }
}
