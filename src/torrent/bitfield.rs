//! Piece possession bitfield
//!
//! One bit per piece, stored MSB-first per byte so the backing bytes are the
//! wire representation of a `bitfield` message. The length is fixed at
//! construction; indexing past it panics.

use bytes::Bytes;

use crate::error::TorrentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Bitfield with every piece set
    pub fn full(len: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; len.div_ceil(8)],
            len,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Decode the payload of a `bitfield` message.
    ///
    /// The byte count must match `len` exactly; spare trailing bits are ignored.
    pub fn from_bytes(bytes: &[u8], len: usize) -> anyhow::Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes, got {}", expected, bytes.len()),
            )
            .into());
        }
        let mut bf = Self {
            bits: bytes.to_vec(),
            len,
        };
        bf.clear_spare_bits();
        Ok(bf)
    }

    /// Wire representation (spare bits are always zero)
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pieces tracked
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no piece is set
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn has(&self, index: usize) -> bool {
        let (byte, mask) = self.locate(index);
        self.bits[byte] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        let (byte, mask) = self.locate(index);
        self.bits[byte] |= mask;
    }

    /// Number of set pieces
    pub fn cardinality(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when every piece is set
    pub fn is_seeder(&self) -> bool {
        self.cardinality() == self.len
    }

    /// Pieces set in `self` but not in `other`
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        assert_eq!(self.len, other.len, "bitfield length mismatch");
        let bits = self
            .bits
            .iter()
            .zip(&other.bits)
            .map(|(a, b)| a & !b)
            .collect();
        Bitfield { bits, len: self.len }
    }

    /// True if `self` has at least one piece `other` lacks
    pub fn has_any_missing_from(&self, other: &Bitfield) -> bool {
        assert_eq!(self.len, other.len, "bitfield length mismatch");
        self.bits.iter().zip(&other.bits).any(|(a, b)| a & !b != 0)
    }

    /// Lazily iterate the indices of set pieces in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0)
            .flat_map(|(i, &byte)| {
                (0..8usize)
                    .filter(move |&bit| byte & (0x80u8 >> bit) != 0)
                    .map(move |bit| i * 8 + bit)
            })
    }

    fn locate(&self, index: usize) -> (usize, u8) {
        assert!(
            index < self.len,
            "piece index {} out of range for bitfield of {} pieces",
            index,
            self.len
        );
        (index / 8, 0x80 >> (index % 8))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.len;
        if spare > 0 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 << spare;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let bf = Bitfield::new(10);
        assert_eq!(bf.len(), 10);
        assert_eq!(bf.as_bytes().len(), 2);
        assert!(bf.is_empty());
        assert_eq!(bf.cardinality(), 0);
        assert!(!bf.is_seeder());
    }

    #[test]
    fn test_set_msb_first() {
        let mut bf = Bitfield::new(9);
        bf.set(0);
        bf.set(8);
        assert_eq!(bf.as_bytes(), &[0b1000_0000, 0b1000_0000]);
        assert!(bf.has(0));
        assert!(!bf.has(1));
        assert_eq!(bf.cardinality(), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_panics() {
        let bf = Bitfield::new(4);
        bf.has(4);
    }

    #[test]
    fn test_full_is_seeder_with_zero_spare_bits() {
        let bf = Bitfield::full(11);
        assert!(bf.is_seeder());
        assert_eq!(bf.as_bytes(), &[0xFF, 0b1110_0000]);
    }

    #[test]
    fn test_wire_round_trip_non_multiple_of_eight() {
        for len in [1usize, 7, 8, 9, 13, 64, 65] {
            let mut bf = Bitfield::new(len);
            for i in (0..len).step_by(3) {
                bf.set(i);
            }
            let decoded = Bitfield::from_bytes(&bf.to_bytes(), len).unwrap();
            assert_eq!(decoded.iter_set().collect::<Vec<_>>(), bf.iter_set().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_spare_bits_decode_as_false() {
        let bf = Bitfield::from_bytes(&[0xFF, 0xFF], 10).unwrap();
        assert_eq!(bf.cardinality(), 10);
        assert!(bf.is_seeder());
        assert_eq!(bf.as_bytes(), &[0xFF, 0b1100_0000]);
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        assert!(Bitfield::from_bytes(&[0xFF], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xFF, 0, 0], 10).is_err());
    }

    #[test]
    fn test_difference() {
        let mut peer = Bitfield::new(4);
        peer.set(0);
        peer.set(2);
        peer.set(3);
        let mut local = Bitfield::new(4);
        local.set(3);

        let missing = peer.difference(&local);
        assert_eq!(missing.iter_set().collect::<Vec<_>>(), vec![0, 2]);
        assert!(peer.has_any_missing_from(&local));
        assert!(!local.has_any_missing_from(&peer));
    }

    #[test]
    fn test_iter_set_is_ordered() {
        let mut bf = Bitfield::new(20);
        for i in [19, 3, 8, 0] {
            bf.set(i);
        }
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![0, 3, 8, 19]);
    }
}
