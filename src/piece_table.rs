//! The piece state machine shared by every peer session of a torrent.

use std::sync::Mutex;

use crate::bitfield::Bitfield;

/// Download state of a single piece.
///
/// Legal transitions, all through [`PieceTable::cas`]:
/// NotDownloaded -> Pending (a peer claims the piece),
/// Pending -> NotDownloaded (failed, timed out or bad hash),
/// Pending -> Downloaded (verified and persisted),
/// NotDownloaded -> Downloaded (startup hash scan found it on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    NotDownloaded,
    Pending,
    Downloaded,
}

#[derive(Debug)]
struct Inner {
    states: Vec<PieceState>,
    /// Cache of the pieces currently in [`PieceState::Downloaded`], kept
    /// coherent on every successful transition.
    downloaded: Bitfield,
}

/// Authoritative per-piece state, linearizable across peer sessions.
#[derive(Debug)]
pub struct PieceTable {
    inner: Mutex<Inner>,
}

impl PieceTable {
    pub fn new(piece_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                states: vec![PieceState::NotDownloaded; piece_count],
                downloaded: Bitfield::new(piece_count),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, piece: usize) -> PieceState {
        self.inner.lock().unwrap().states[piece]
    }

    /// Set piece `piece` to `new` iff its current state equals `expected`.
    /// Returns whether the state changed. Out-of-range indices never
    /// change anything.
    pub fn cas(
        &self,
        piece: usize,
        expected: PieceState,
        new: PieceState,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.states.get(piece) {
            Some(state) if *state == expected => {}
            _ => return false,
        }

        inner.states[piece] = new;
        if new == PieceState::Downloaded {
            inner.downloaded.add(piece).ok();
        } else if expected == PieceState::Downloaded {
            inner.downloaded.remove(piece).ok();
        }
        true
    }

    /// Snapshot of the pieces currently in Downloaded state.
    pub fn bitfield(&self) -> Bitfield {
        self.inner.lock().unwrap().downloaded.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn cas_checks_expected_state() {
        let table = PieceTable::new(3);
        assert_eq!(table.get(0), PieceState::NotDownloaded);

        assert!(table.cas(0, PieceState::NotDownloaded, PieceState::Pending));
        assert_eq!(table.get(0), PieceState::Pending);

        // a second claim of the same piece must fail
        assert!(!table.cas(0, PieceState::NotDownloaded, PieceState::Pending));

        assert!(table.cas(0, PieceState::Pending, PieceState::Downloaded));
        assert_eq!(table.get(0), PieceState::Downloaded);

        // downloaded is terminal
        assert!(!table.cas(0, PieceState::Pending, PieceState::NotDownloaded));
    }

    #[test]
    fn cas_out_of_range_is_a_no_op() {
        let table = PieceTable::new(1);
        assert!(!table.cas(4, PieceState::NotDownloaded, PieceState::Pending));
    }

    #[test]
    fn bitfield_tracks_downloaded_pieces() {
        let table = PieceTable::new(4);
        assert!(table.bitfield().is_empty());

        table.cas(1, PieceState::NotDownloaded, PieceState::Downloaded);
        table.cas(3, PieceState::NotDownloaded, PieceState::Pending);
        table.cas(3, PieceState::Pending, PieceState::Downloaded);

        let bitfield = table.bitfield();
        assert_eq!(bitfield.count(), 2);
        assert!(bitfield.contains(1));
        assert!(bitfield.contains(3));

        // later transitions must not leak into the snapshot
        table.cas(0, PieceState::NotDownloaded, PieceState::Downloaded);
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let table = Arc::new(PieceTable::new(1));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                table.cas(0, PieceState::NotDownloaded, PieceState::Pending)
            }));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
