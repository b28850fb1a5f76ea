//! Queue of incoming upload requests from one peer.

use std::{collections::VecDeque, sync::Mutex};

use tracing::warn;

use crate::wire::BlockInfo;

/// Most requests a peer may keep queued; anything beyond is dropped so an
/// adversarial peer cannot grow the queue without bound.
const MAX_QUEUED: usize = 512;

/// FIFO of blocks the remote peer asked us to upload, deduplicated on the
/// exact (piece, offset, length) triple.
#[derive(Debug, Default)]
pub struct RequestedPieces {
    inner: Mutex<VecDeque<BlockInfo>>,
}

impl RequestedPieces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, request: BlockInfo) {
        let mut inner = self.inner.lock().unwrap();

        if inner.contains(&request) {
            return;
        }
        if inner.len() >= MAX_QUEUED {
            warn!("dropping request {request:?}, the queue is full");
            return;
        }

        inner.push_back(request);
    }

    /// Remove the first queued request equal to `request`, if any.
    pub fn cancel(&self, request: &BlockInfo) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(position) = inner.iter().position(|r| r == request) {
            inner.remove(position);
        }
    }

    pub fn pop(&self) -> Option<BlockInfo> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(index: u32) -> BlockInfo {
        BlockInfo { index, begin: 0, len: 16384 }
    }

    #[test]
    fn fifo_order() {
        let queue = RequestedPieces::new();
        queue.add(request(0));
        queue.add(request(1));
        queue.add(request(2));

        assert_eq!(queue.pop(), Some(request(0)));
        assert_eq!(queue.pop(), Some(request(1)));
        assert_eq!(queue.pop(), Some(request(2)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn duplicates_are_ignored() {
        let queue = RequestedPieces::new();
        queue.add(request(0));
        queue.add(request(0));
        assert_eq!(queue.len(), 1);

        // same piece, different offset is a distinct request
        queue.add(BlockInfo { index: 0, begin: 16384, len: 16384 });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn cancel_removes_first_match() {
        let queue = RequestedPieces::new();
        queue.add(request(0));
        queue.add(request(1));

        queue.cancel(&request(0));
        assert_eq!(queue.pop(), Some(request(1)));

        // cancelling something absent is a no-op
        queue.cancel(&request(9));
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_is_bounded() {
        let queue = RequestedPieces::new();
        for index in 0..(MAX_QUEUED as u32 + 100) {
            queue.add(request(index));
        }
        assert_eq!(queue.len(), MAX_QUEUED);
    }
}
