//! # Recognizer Link State
//!
//! Session-side view of the upstream recognizer connection. Frames produced
//! before the link is ready (or after it dropped) are queued, never
//! discarded, and go out in FIFO order exactly once when the link becomes
//! ready.
//!
//! ## Lifecycle:
//! ```text
//! new ──Opened──> ready ──Closed──> not ready ──reattach──> new ...
//!                                        └──close──> closed (queue discarded)
//! ```
//! A reattached link keeps its queue, so audio captured while the upstream
//! socket was down reaches the next socket in order.

use super::LinkCommand;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::debug;

/// What happened to a frame handed to [`RecognizerLink::send_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Forwarded,
    Queued,
}

/// Result of a ready transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flushed {
    pub frames: usize,
    pub bytes: usize,
}

pub struct RecognizerLink {
    /// Command channel of the current link task
    commands: mpsc::UnboundedSender<LinkCommand>,

    /// Set by `Opened`, cleared by any close
    ready: bool,

    /// Terminal: the session tore the link down
    closed: bool,

    /// Frames waiting for `ready`, oldest first
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
}

impl RecognizerLink {
    /// Wrap the command channel of a freshly opened (not yet ready) link.
    pub fn new(commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self {
            commands,
            ready: false,
            closed: false,
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    /// Bytes waiting for the link to become ready.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Forward a frame if the link is ready, otherwise queue it.
    pub fn send_frame(&mut self, frame: Vec<u8>) -> FrameOutcome {
        if self.ready && !self.closed {
            match self.commands.send(LinkCommand::Frame(frame)) {
                Ok(()) => return FrameOutcome::Forwarded,
                Err(mpsc::error::SendError(command)) => {
                    // The link task is gone; keep the frame.
                    self.ready = false;
                    if let LinkCommand::Frame(frame) = command {
                        self.enqueue(frame);
                    }
                    return FrameOutcome::Queued;
                }
            }
        }

        self.enqueue(frame);
        FrameOutcome::Queued
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        self.queued_bytes += frame.len();
        self.queue.push_back(frame);
    }

    /// The link finished its handshake: flush the queue in order, then clear it.
    pub fn mark_ready(&mut self) -> Flushed {
        if self.closed {
            return Flushed::default();
        }
        self.ready = true;

        let mut flushed = Flushed::default();
        while let Some(frame) = self.queue.pop_front() {
            let len = frame.len();
            // A failed send hands the frame back; put it where it was
            if let Err(mpsc::error::SendError(LinkCommand::Frame(frame))) =
                self.commands.send(LinkCommand::Frame(frame))
            {
                self.queue.push_front(frame);
                self.ready = false;
                break;
            }
            self.queued_bytes -= len;
            flushed.frames += 1;
            flushed.bytes += len;
        }

        debug!(frames = flushed.frames, bytes = flushed.bytes, "Flushed queued recognizer frames");
        flushed
    }

    /// The upstream link closed or errored. Returns whether it was ready.
    pub fn mark_closed(&mut self) -> bool {
        std::mem::replace(&mut self.ready, false)
    }

    /// Swap in the command channel of a reopened link. The queue is kept and
    /// flushed by the next `mark_ready`.
    pub fn reattach(&mut self, commands: mpsc::UnboundedSender<LinkCommand>) {
        if self.closed {
            return;
        }
        self.commands = commands;
        self.ready = false;
    }

    /// Close immediately without draining.
    ///
    /// ## Returns:
    /// Bytes that were still queued and are now discarded (0 on repeat calls).
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        self.ready = false;
        self.queue.clear();
        let discarded = std::mem::take(&mut self.queued_bytes);
        let _ = self.commands.send(LinkCommand::Close);
        discarded
    }
}
