//! In-flight piece buffers for one peer session.
//!
//! Each tracked piece owns a buffer of its exact length plus the list of
//! blocks still outstanding on the wire. A piece whose last block arrives
//! is assembled and removed in the same critical section.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use hashbrown::HashMap;

use crate::{error::Error, wire::BLOCK_LEN};

/// A block not yet received, in piece-relative coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlock {
    pub offset: u32,
    pub length: u32,
}

/// A fully assembled piece, ready for hash verification.
#[derive(Debug, PartialEq)]
pub struct DonePiece {
    pub index: usize,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct PendingPiece {
    data: Vec<u8>,
    blocks: Vec<PendingBlock>,
    deadline: Instant,
}

/// Per-peer bookkeeping of pieces requested but not yet complete.
#[derive(Debug)]
pub struct PendingPieces {
    timeout: Duration,
    inner: Mutex<HashMap<usize, PendingPiece>>,
}

impl PendingPieces {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, inner: Mutex::new(HashMap::new()) }
    }

    /// Start tracking `piece`, splitting `piece_len` bytes into
    /// [`BLOCK_LEN`]-sized blocks (the last one may be shorter). The
    /// entry expires `timeout` from now.
    pub fn insert(&self, piece: usize, piece_len: u64) {
        let block_count = piece_len.div_ceil(BLOCK_LEN as u64) as u32;
        let blocks = (0..block_count)
            .map(|block| {
                let offset = block * BLOCK_LEN;
                let length =
                    (BLOCK_LEN as u64).min(piece_len - offset as u64) as u32;
                PendingBlock { offset, length }
            })
            .collect();

        let entry = PendingPiece {
            data: vec![0u8; piece_len as usize],
            blocks,
            deadline: Instant::now() + self.timeout,
        };

        self.inner.lock().unwrap().insert(piece, entry);
    }

    /// Store the bytes of one received block. `(offset, data.len())` must
    /// match an outstanding block exactly. When the final block lands the
    /// assembled piece is returned and the entry removed.
    pub fn insert_data(
        &self,
        piece: usize,
        offset: u32,
        data: &[u8],
    ) -> Result<Option<DonePiece>, Error> {
        let mut inner = self.inner.lock().unwrap();

        let entry = inner
            .get_mut(&piece)
            .ok_or(Error::UnexpectedPiece(piece))?;

        let position = entry
            .blocks
            .iter()
            .position(|b| b.offset == offset && b.length as usize == data.len())
            .ok_or(Error::UnknownBlock {
                piece,
                offset,
                len: data.len() as u32,
            })?;

        entry.blocks.swap_remove(position);
        entry.data[offset as usize..offset as usize + data.len()]
            .copy_from_slice(data);

        if entry.blocks.is_empty() {
            let data = std::mem::take(&mut entry.data);
            inner.remove(&piece);
            return Ok(Some(DonePiece { index: piece, data }));
        }

        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, piece: usize) -> bool {
        self.inner.lock().unwrap().contains_key(&piece)
    }

    pub fn indexes(&self) -> Vec<usize> {
        self.inner.lock().unwrap().keys().copied().collect()
    }

    /// The blocks of `piece` still outstanding; empty when the piece is
    /// not tracked.
    pub fn pending_blocks(&self, piece: usize) -> Vec<PendingBlock> {
        self.inner
            .lock()
            .unwrap()
            .get(&piece)
            .map(|entry| entry.blocks.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, piece: usize) {
        self.inner.lock().unwrap().remove(&piece);
    }

    /// Drop every entry whose deadline has passed and return their piece
    /// indices; the caller reverts their claims in the piece table.
    pub fn remove_stale(&self) -> Vec<usize> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let stale: Vec<usize> = inner
            .iter()
            .filter(|(_, entry)| entry.deadline < now)
            .map(|(piece, _)| *piece)
            .collect();

        for piece in &stale {
            inner.remove(piece);
        }

        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(120);

    #[test]
    fn insert_splits_into_blocks() {
        let pending = PendingPieces::new(TIMEOUT);
        pending.insert(3, BLOCK_LEN as u64 * 2 + 100);

        let blocks = pending.pending_blocks(3);
        assert_eq!(
            blocks,
            vec![
                PendingBlock { offset: 0, length: BLOCK_LEN },
                PendingBlock { offset: BLOCK_LEN, length: BLOCK_LEN },
                PendingBlock { offset: BLOCK_LEN * 2, length: 100 },
            ]
        );

        assert!(pending.contains(3));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn short_piece_is_a_single_block() {
        let pending = PendingPieces::new(TIMEOUT);
        pending.insert(0, 2);
        assert_eq!(
            pending.pending_blocks(0),
            vec![PendingBlock { offset: 0, length: 2 }]
        );
    }

    #[test]
    fn assembly_in_any_order() {
        let piece_len = BLOCK_LEN as u64 * 2 + 7;
        let mut expected = vec![0u8; piece_len as usize];
        for (i, byte) in expected.iter_mut().enumerate() {
            *byte = i as u8;
        }

        // insert the blocks back to front
        let pending = PendingPieces::new(TIMEOUT);
        pending.insert(1, piece_len);
        let mut blocks = pending.pending_blocks(1);
        blocks.reverse();

        let last = blocks.len() - 1;
        for (i, block) in blocks.iter().enumerate() {
            let start = block.offset as usize;
            let end = start + block.length as usize;
            let done =
                pending.insert_data(1, block.offset, &expected[start..end]);

            if i < last {
                assert_eq!(done.unwrap(), None);
            } else {
                let done = done.unwrap().unwrap();
                assert_eq!(done.index, 1);
                assert_eq!(done.data, expected);
            }
        }

        // the entry is gone once assembled
        assert!(!pending.contains(1));
        assert!(pending
            .insert_data(1, 0, &expected[..BLOCK_LEN as usize])
            .is_err());
    }

    #[test]
    fn mismatched_blocks_are_rejected() {
        let pending = PendingPieces::new(TIMEOUT);
        pending.insert(0, BLOCK_LEN as u64);

        // wrong offset
        assert!(matches!(
            pending.insert_data(0, 1, &vec![0; BLOCK_LEN as usize]),
            Err(Error::UnknownBlock { .. })
        ));
        // wrong length
        assert!(matches!(
            pending.insert_data(0, 0, &[0; 10]),
            Err(Error::UnknownBlock { .. })
        ));
        // untracked piece
        assert!(matches!(
            pending.insert_data(5, 0, &[0; 10]),
            Err(Error::UnexpectedPiece(5))
        ));

        // the matching block still completes
        let done = pending
            .insert_data(0, 0, &vec![0; BLOCK_LEN as usize])
            .unwrap();
        assert!(done.is_some());
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let pending = PendingPieces::new(TIMEOUT);
        pending.insert(0, BLOCK_LEN as u64 * 2);

        let block = vec![0; BLOCK_LEN as usize];
        pending.insert_data(0, 0, &block).unwrap();
        assert!(pending.insert_data(0, 0, &block).is_err());
    }

    #[test]
    fn remove_stale_returns_expired_entries_once() {
        let pending = PendingPieces::new(Duration::from_millis(10));
        pending.insert(0, 100);
        pending.insert(1, 100);

        std::thread::sleep(Duration::from_millis(30));
        pending.insert(2, 100);

        let mut stale = pending.remove_stale();
        stale.sort_unstable();
        assert_eq!(stale, vec![0, 1]);
        assert_eq!(pending.indexes(), vec![2]);

        // a second sweep finds nothing new
        assert!(pending.remove_stale().is_empty());
    }
}
