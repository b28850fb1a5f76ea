//! Packed presence set over piece indices.
//!
//! Bit `i` encodes the presence of piece `i`, packed MSB-first inside each
//! byte so the raw bytes can go straight onto the wire as a BEP3 bitfield
//! message.

use std::sync::RwLock;

use bitvec::{order::Msb0, vec::BitVec};

use crate::error::Error;

/// Presence vector over the pieces of a torrent.
///
/// The piece count is carried alongside the bits: bits past the count in
/// the tail byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// An empty bitfield sized to `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self { bits: BitVec::repeat(false, piece_count) }
    }

    /// Reconstruct a bitfield from wire bytes. The byte count must be
    /// exactly `ceil(piece_count / 8)`; spare bits in the tail byte are
    /// discarded.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, Error> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength { got: bytes.len(), expected });
        }
        let mut bits = BitVec::from_slice(bytes);
        bits.truncate(piece_count);
        Ok(Self { bits })
    }

    pub fn piece_count(&self) -> usize {
        self.bits.len()
    }

    pub fn add(&mut self, piece: usize) -> Result<(), Error> {
        if piece >= self.bits.len() {
            return Err(Error::PieceOutOfRange {
                piece,
                count: self.bits.len(),
            });
        }
        self.bits.set(piece, true);
        Ok(())
    }

    pub fn remove(&mut self, piece: usize) -> Result<(), Error> {
        if piece >= self.bits.len() {
            return Err(Error::PieceOutOfRange {
                piece,
                count: self.bits.len(),
            });
        }
        self.bits.set(piece, false);
        Ok(())
    }

    pub fn contains(&self, piece: usize) -> bool {
        self.bits.get(piece).map(|b| *b).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Number of pieces present.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Whether every piece is present.
    pub fn is_full(&self) -> bool {
        self.bits.all()
    }

    /// Bits set in `self` but not in `other`. Both operands must cover the
    /// same piece count.
    pub fn subtract(&self, other: &Self) -> Self {
        debug_assert_eq!(self.bits.len(), other.bits.len());
        let mut result = self.clone();
        for (byte, other_byte) in result
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *byte &= !*other_byte;
        }
        result
    }

    /// Wire representation: `ceil(piece_count / 8)` bytes, spare tail bits
    /// zeroed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }
}

/// [`Bitfield`] behind a read-write lock; read-heavy operations take the
/// shared lock.
#[derive(Debug, Default)]
pub struct ConcurrentBitfield {
    inner: RwLock<Bitfield>,
}

impl ConcurrentBitfield {
    pub fn new(piece_count: usize) -> Self {
        Self { inner: RwLock::new(Bitfield::new(piece_count)) }
    }

    pub fn piece_count(&self) -> usize {
        self.inner.read().unwrap().piece_count()
    }

    pub fn add(&self, piece: usize) -> Result<(), Error> {
        self.inner.write().unwrap().add(piece)
    }

    pub fn contains(&self, piece: usize) -> bool {
        self.inner.read().unwrap().contains(piece)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Swap in a whole new bitfield, as when the peer sends its Bitfield
    /// message.
    pub fn replace(&self, bitfield: Bitfield) {
        *self.inner.write().unwrap() = bitfield;
    }

    pub fn snapshot(&self) -> Bitfield {
        self.inner.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let mut bitfield = Bitfield::new(10);
        assert!(bitfield.is_empty());

        for piece in 0..10 {
            bitfield.add(piece).unwrap();
            assert!(bitfield.contains(piece));
            bitfield.remove(piece).unwrap();
            assert!(!bitfield.contains(piece));
        }

        assert!(bitfield.add(10).is_err());
        assert!(bitfield.remove(10).is_err());
        assert!(!bitfield.contains(10));
    }

    #[test]
    fn msb_first_packing() {
        let mut bitfield = Bitfield::new(10);
        bitfield.add(0).unwrap();
        bitfield.add(1).unwrap();
        bitfield.add(7).unwrap();
        bitfield.add(9).unwrap();

        // 0b1100_0001 for pieces 0..8, 0b0100_0000 for pieces 8..10
        assert_eq!(bitfield.to_bytes(), vec![0b1100_0001, 0b0100_0000]);
    }

    #[test]
    fn bytes_round_trip() {
        let mut bitfield = Bitfield::new(19);
        for piece in [0, 3, 8, 18] {
            bitfield.add(piece).unwrap();
        }

        let bytes = bitfield.to_bytes();
        assert_eq!(bytes.len(), 3);

        let restored = Bitfield::from_bytes(&bytes, 19).unwrap();
        assert_eq!(restored, bitfield);
        assert_eq!(restored.count(), 4);
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(Bitfield::from_bytes(&[0, 0], 17).is_err());
        assert!(Bitfield::from_bytes(&[0, 0, 0], 17).is_ok());
    }

    #[test]
    fn tail_bits_are_dropped() {
        // 10 pieces in 2 bytes: the low 6 bits of the tail byte are spare.
        let bitfield = Bitfield::from_bytes(&[0xFF, 0xFF], 10).unwrap();
        assert_eq!(bitfield.count(), 10);
        assert_eq!(bitfield.to_bytes(), vec![0xFF, 0b1100_0000]);
    }

    #[test]
    fn subtract() {
        let mut a = Bitfield::new(12);
        let mut b = Bitfield::new(12);
        for piece in [1, 3, 5, 9] {
            a.add(piece).unwrap();
        }
        for piece in [3, 9, 10] {
            b.add(piece).unwrap();
        }

        let diff = a.subtract(&b);
        for piece in 0..12 {
            assert_eq!(
                diff.contains(piece),
                a.contains(piece) && !b.contains(piece),
                "piece {piece}"
            );
        }
    }

    #[test]
    fn counts() {
        let mut bitfield = Bitfield::new(9);
        assert_eq!(bitfield.count(), 0);
        assert!(!bitfield.is_full());

        for piece in 0..9 {
            bitfield.add(piece).unwrap();
        }
        assert_eq!(bitfield.count(), 9);
        assert!(bitfield.is_full());
    }

    #[test]
    fn concurrent_replace() {
        let shared = ConcurrentBitfield::new(4);
        assert!(shared.is_empty());

        let mut replacement = Bitfield::new(4);
        replacement.add(2).unwrap();
        shared.replace(replacement);

        assert!(shared.contains(2));
        assert!(!shared.contains(1));
        assert_eq!(shared.snapshot().count(), 1);
    }
}
