//! # Audio Accumulator
//!
//! Collects the irregular, arbitrarily sized media chunks a caller streams in
//! and cuts them into fixed-size frames for the recognizer. Sending every tiny
//! chunk upstream wastes protocol overhead, so audio is held back until a full
//! flush interval (100 ms by default) is available.
//!
//! ## Framing Rules:
//! - Chunks are kept in arrival order
//! - Each emitted frame is exactly `threshold` bytes, built from the front of
//!   the queue; a chunk that straddles a boundary is split
//! - Anything short of a full frame stays buffered until more audio arrives

use std::collections::VecDeque;

/// Ordered buffer of raw PCM chunks awaiting the flush threshold.
#[derive(Debug)]
pub struct AudioAccumulator {
    /// Pending chunks, oldest first
    chunks: VecDeque<Vec<u8>>,

    /// Bytes currently held in `chunks`
    pending_bytes: usize,

    /// Frame size in bytes (100 ms of audio for the configured format)
    threshold: usize,

    /// Total bytes ever appended
    received_bytes: u64,

    /// Total bytes released as frames
    framed_bytes: u64,
}

impl AudioAccumulator {
    /// Create an accumulator that releases frames of `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            pending_bytes: 0,
            threshold: threshold.max(1),
            received_bytes: 0,
            framed_bytes: 0,
        }
    }

    /// Append a chunk and return every complete frame now available.
    ///
    /// ## Returns:
    /// Zero or more frames of exactly `threshold` bytes, in order. Each frame
    /// is the byte-for-byte concatenation of the audio that produced it.
    pub fn push(&mut self, chunk: Vec<u8>) -> Vec<Vec<u8>> {
        if chunk.is_empty() {
            return Vec::new();
        }

        self.received_bytes += chunk.len() as u64;
        self.pending_bytes += chunk.len();
        self.chunks.push_back(chunk);

        let mut frames = Vec::new();
        while self.pending_bytes >= self.threshold {
            frames.push(self.take_frame());
        }
        frames
    }

    /// Assemble one frame from the front of the queue.
    ///
    /// ## Rust Concepts:
    /// - `split_off` keeps the head in `chunk` and returns the tail, so only
    ///   the straddling chunk is reallocated
    /// - `let ... else` ends the loop if the queue runs dry; `push` only calls
    ///   this while a full frame is pending, so that never happens in practice
    fn take_frame(&mut self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.threshold);

        while frame.len() < self.threshold {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let needed = self.threshold - frame.len();
            if chunk.len() > needed {
                // Straddles the boundary: the tail goes back to the front
                let rest = chunk.split_off(needed);
                self.chunks.push_front(rest);
            }
            frame.extend_from_slice(&chunk);
        }

        self.pending_bytes -= frame.len();
        self.framed_bytes += frame.len() as u64;
        frame
    }

    /// Bytes buffered but not yet framed.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Lifetime totals, reported when the session closes
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn framed_bytes(&self) -> u64 {
        self.framed_bytes
    }

    /// Drop any residual audio (used at session teardown).
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.pending_bytes = 0;
    }
}
