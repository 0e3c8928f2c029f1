//! Bounded per-client backpressure queue.
//!
//! When a client's socket cannot absorb a write, the data is parked here
//! instead of being dropped. The queue is bounded by a byte budget: once
//! the budget is reached new packets are discarded (oldest data is worth
//! more than newest for a live stream that the player buffers anyway).

use std::collections::VecDeque;

/// How many queued packets we try to drain per incoming packet.
/// Must be at least 2 or a congested queue can never shrink.
pub const MULTIPLE_QUEUE_SEND: usize = 3;

/// FIFO of pending packets with a running byte total and a saturation flag.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Vec<u8>>,
    bytes: usize,
    full: bool,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets currently queued.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Total bytes resident in the queue.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether the last push was rejected and the drop has been logged.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Append a packet unless it would reach the byte bound.
    ///
    /// Returns `false` when the packet was discarded. The `full` flag is
    /// raised on the first discard so the caller can log the transition
    /// exactly once; any [`pop`](Self::pop) lowers it again.
    pub fn push(&mut self, bound: usize, data: &[u8]) -> bool {
        if self.bytes + data.len() >= bound {
            self.full = true;
            return false;
        }
        self.bytes += data.len();
        self.packets.push_back(data.to_vec());
        true
    }

    /// Oldest packet, without removing it.
    pub fn head(&self) -> Option<&[u8]> {
        self.packets.front().map(|p| p.as_slice())
    }

    /// Drop the oldest packet and lower the `full` flag.
    pub fn pop(&mut self) {
        if let Some(packet) = self.packets.pop_front() {
            self.bytes -= packet.len();
        }
        self.full = false;
    }

    /// Replace the head packet with the unsent remainder of itself.
    ///
    /// Used after a partial write so the next drain resumes exactly where
    /// the socket stopped. No-op on an empty queue.
    pub fn requeue_head(&mut self, rest: &[u8]) {
        if let Some(head) = self.packets.front_mut() {
            self.bytes -= head.len();
            self.bytes += rest.len();
            *head = rest.to_vec();
        }
    }

    /// Discard everything and reset the byte total and `full` flag.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.bytes = 0;
        self.full = false;
    }
}
