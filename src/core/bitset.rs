// ============================================================================
// Field Bit Sets
// ============================================================================
//
// One bit per declared persistent field. Used for the loaded/dirty maps of
// every state manager, for cache snapshots and for detached state, so it is
// kept small and allocation-light (a single word covers 64 fields).
//
// ============================================================================

use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldBitSet {
    words: Vec<u64>,
    len: usize,
}

impl FieldBitSet {
    /// Create an empty set able to hold `len` fields
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Create a set with every field flagged
    pub fn full(len: usize) -> Self {
        let mut set = Self::new(len);
        for i in 0..len {
            set.set(i);
        }
        set
    }

    pub fn from_fields(len: usize, fields: &[usize]) -> Self {
        let mut set = Self::new(len);
        for &field in fields {
            set.set(field);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    #[inline]
    pub fn get(&self, field: usize) -> bool {
        field < self.len && (self.words[field / 64] >> (field % 64)) & 1 == 1
    }

    #[inline]
    pub fn set(&mut self, field: usize) {
        if field < self.len {
            self.words[field / 64] |= 1 << (field % 64);
        }
    }

    #[inline]
    pub fn clear(&mut self, field: usize) {
        if field < self.len {
            self.words[field / 64] &= !(1 << (field % 64));
        }
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Field numbers currently flagged, ascending
    pub fn fields(&self) -> Vec<usize> {
        (0..self.len).filter(|&i| self.get(i)).collect()
    }

    pub fn union_with(&mut self, other: &FieldBitSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= *o;
        }
    }

    pub fn intersect_with(&mut self, other: &FieldBitSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    pub fn difference(&self, other: &FieldBitSet) -> FieldBitSet {
        let mut out = self.clone();
        for (i, w) in out.words.iter_mut().enumerate() {
            *w &= !other.words.get(i).copied().unwrap_or(0);
        }
        out
    }

    pub fn is_subset_of(&self, other: &FieldBitSet) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0) == 0)
    }
}

impl fmt::Debug for FieldBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.fields()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut bits = FieldBitSet::new(70);
        bits.set(0);
        bits.set(65);
        assert!(bits.get(0));
        assert!(bits.get(65));
        assert!(!bits.get(64));
        assert_eq!(bits.count(), 2);

        bits.clear(65);
        assert_eq!(bits.fields(), vec![0]);
        bits.set(200);
        assert_eq!(bits.count(), 1);
    }

    #[test]
    fn test_subset_and_difference() {
        let dirty = FieldBitSet::from_fields(5, &[1, 3]);
        let loaded = FieldBitSet::from_fields(5, &[0, 1, 3]);
        assert!(dirty.is_subset_of(&loaded));
        assert!(!loaded.is_subset_of(&dirty));
        assert_eq!(loaded.difference(&dirty).fields(), vec![0]);
        assert!(FieldBitSet::new(5).is_empty());
        assert_eq!(FieldBitSet::full(3).fields(), vec![0, 1, 2]);
    }
}
