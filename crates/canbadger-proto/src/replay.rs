//! Replay queue
//!
//! Frames are sent one `START_REPLAY` at a time; each reply from the probe
//! releases the next send.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::frame::{encode_for_replay, Interface};
use crate::message::{ActionKind, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub repeat_count: u32,
    pub raw_frame: Bytes,
}

/// Result of advancing the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStep {
    Send(Message),
    Complete,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayQueue {
    entries: VecDeque<ReplayEntry>,
}

impl ReplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `raw_frame` for `repeat_count` sends. Returns `false` when the
    /// entry was skipped because it would never be sent.
    pub fn enqueue(&mut self, repeat_count: u32, raw_frame: impl Into<Bytes>) -> bool {
        let raw_frame = raw_frame.into();
        if repeat_count == 0 || raw_frame.is_empty() {
            return false;
        }
        self.entries.push_back(ReplayEntry {
            repeat_count,
            raw_frame,
        });
        true
    }

    /// Queue a frame given by its parts. Frames without payload are skipped.
    pub fn enqueue_frame(
        &mut self,
        repeat_count: u32,
        interface: Interface,
        arbitration_id: u32,
        payload: &[u8],
    ) -> bool {
        if payload.is_empty() {
            return false;
        }
        self.enqueue(
            repeat_count,
            encode_for_replay(interface, arbitration_id, payload),
        )
    }

    /// Consume one send of the head entry
    pub fn advance(&mut self) -> ReplayStep {
        let Some(head) = self.entries.front_mut() else {
            return ReplayStep::Complete;
        };
        let message = Message::action(ActionKind::StartReplay, head.raw_frame.clone());
        head.repeat_count -= 1;
        if head.repeat_count == 0 {
            self.entries.pop_front();
        }
        trace!(remaining = self.remaining_sends(), "Replay frame queued for send");
        ReplayStep::Send(message)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total sends still to go across all entries
    pub fn remaining_sends(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.repeat_count)).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReplayEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut ReplayQueue) -> Vec<Bytes> {
        let mut sent = Vec::new();
        while let ReplayStep::Send(msg) = queue.advance() {
            assert_eq!(msg.action, ActionKind::StartReplay);
            sent.push(msg.payload);
        }
        sent
    }

    #[test]
    fn test_three_sends_then_complete() {
        let mut queue = ReplayQueue::new();
        assert!(queue.enqueue(3, vec![0xAA]));
        assert_eq!(queue.remaining_sends(), 3);

        let sent = drain(&mut queue);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|p| p.as_ref() == [0xAA]));
        assert_eq!(queue.advance(), ReplayStep::Complete);
    }

    #[test]
    fn test_order_preserved_across_entries() {
        let mut queue = ReplayQueue::new();
        queue.enqueue(1, vec![1]);
        queue.enqueue(2, vec![2]);
        queue.enqueue(1, vec![3]);
        let sent: Vec<u8> = drain(&mut queue).iter().map(|p| p[0]).collect();
        assert_eq!(sent, vec![1, 2, 2, 3]);
    }

    #[test]
    fn test_skips_unsendable_entries() {
        let mut queue = ReplayQueue::new();
        assert!(!queue.enqueue(0, vec![1]));
        assert!(!queue.enqueue(5, Bytes::new()));
        assert!(!queue.enqueue_frame(2, Interface::Can1, 0x100, &[]));
        assert!(queue.is_empty());
        assert_eq!(queue.advance(), ReplayStep::Complete);
    }

    #[test]
    fn test_enqueue_frame_uses_replay_layout() {
        let mut queue = ReplayQueue::new();
        queue.enqueue_frame(1, Interface::Can2, 0x7E0, &[0x02, 0x10, 0x03]);
        let ReplayStep::Send(msg) = queue.advance() else {
            panic!("expected a send");
        };
        assert_eq!(
            msg.payload.as_ref(),
            &[0x02, 0xE0, 0x07, 0x00, 0x00, 0x02, 0x10, 0x03]
        );
    }
}
