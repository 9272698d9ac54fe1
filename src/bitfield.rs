//! Thin wrapper around `bit_set::BitSet`, the piece-ownership primitive
//! shared by peers, the content store and the piece selector.
//!
//! Grounded on `bip_select`'s dependency on `bit-set = "0.4"` for exactly
//! this purpose (tracking which pieces a peer/the local store has).

use bit_set::BitSet;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitSet,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Bitfield {
        Bitfield {
            bits: BitSet::with_capacity(len),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn has(&self, index: usize) -> bool {
        self.bits.contains(index)
    }

    pub fn set(&mut self, index: usize) {
        self.bits.insert(index);
    }

    pub fn unset(&mut self, index: usize) {
        self.bits.remove(index);
    }

    pub fn count(&self) -> usize {
        self.bits.len()
    }

    /// Whether every piece in `[0, len)` is present.
    pub fn is_full(&self) -> bool {
        self.len > 0 && self.count() == self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter()
    }

    pub fn intersection_count(&self, other: &Bitfield) -> usize {
        self.bits.intersection(&other.bits).count()
    }

    pub fn intersect_with(&mut self, other: &Bitfield) {
        self.bits.intersect_with(&other.bits);
    }

    pub fn intersection(&self, other: &Bitfield) -> Bitfield {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    pub fn union_with(&mut self, other: &Bitfield) {
        self.bits.union_with(&other.bits);
    }

    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        let mut out = self.clone();
        out.bits.difference_with(&other.bits);
        out
    }

    /// Bits in `[0, len)` that are *not* set.
    pub fn inverted(&self) -> Bitfield {
        let mut out = Bitfield::new(self.len);
        for i in 0..self.len {
            if !self.has(i) {
                out.set(i);
            }
        }
        out
    }

    pub fn raw(&self) -> &BitSet {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_when_all_set() {
        let mut bf = Bitfield::new(4);
        assert!(!bf.is_full());
        for i in 0..4 {
            bf.set(i);
        }
        assert!(bf.is_full());
    }

    #[test]
    fn inverted_flips_only_in_range() {
        let mut bf = Bitfield::new(3);
        bf.set(1);
        let inv = bf.inverted();
        assert!(inv.has(0));
        assert!(!inv.has(1));
        assert!(inv.has(2));
    }
}
