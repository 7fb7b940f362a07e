use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-size bitmask over partition ids `0..count`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSet {
    count: u32,
    words: Vec<u64>,
}

impl PartitionSet {
    pub fn empty(count: u32) -> Self {
        Self {
            count,
            words: vec![0; (count as usize).div_ceil(64)],
        }
    }

    pub fn full(count: u32) -> Self {
        let mut set = Self::empty(count);
        for partition in 0..count {
            set.insert(partition);
        }
        set
    }

    pub fn partition_count(&self) -> u32 {
        self.count
    }

    pub fn insert(&mut self, partition: u32) {
        if partition < self.count {
            self.words[(partition / 64) as usize] |= 1 << (partition % 64);
        }
    }

    pub fn remove(&mut self, partition: u32) {
        if partition < self.count {
            self.words[(partition / 64) as usize] &= !(1 << (partition % 64));
        }
    }

    pub fn contains(&self, partition: u32) -> bool {
        partition < self.count && self.words[(partition / 64) as usize] & (1 << (partition % 64)) != 0
    }

    /// Adds every partition of `other`.
    pub fn add_all(&mut self, other: &PartitionSet) {
        for (word, bits) in self.words.iter_mut().zip(&other.words) {
            *word |= bits;
        }
    }

    /// Removes every partition of `other` (and-not).
    pub fn remove_all(&mut self, other: &PartitionSet) {
        for (word, bits) in self.words.iter_mut().zip(&other.words) {
            *word &= !bits;
        }
    }

    pub fn intersection(&self, other: &PartitionSet) -> PartitionSet {
        let mut out = self.clone();
        for (word, bits) in out.words.iter_mut().zip(&other.words) {
            *word &= bits;
        }
        if other.words.len() < out.words.len() {
            for word in &mut out.words[other.words.len()..] {
                *word = 0;
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.count).filter(|p| self.contains(*p))
    }
}

impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_set_spans_word_boundaries() {
        let set = PartitionSet::full(130);
        assert_eq!(set.len(), 130);
        assert!(set.contains(129));
        assert!(!set.contains(130));
    }

    #[test]
    fn and_not_merge_empties_the_mask() {
        let mut remaining = PartitionSet::full(7);
        let mut a = PartitionSet::empty(7);
        let mut b = PartitionSet::empty(7);
        for p in 0..7 {
            if p % 2 == 0 {
                a.insert(p);
            } else {
                b.insert(p);
            }
        }
        remaining.remove_all(&a);
        assert_eq!(remaining.iter().collect::<Vec<_>>(), vec![1, 3, 5]);
        remaining.remove_all(&b);
        assert!(remaining.is_empty());
    }

    #[test]
    fn intersection_keeps_common_partitions() {
        let mut a = PartitionSet::empty(10);
        a.insert(1);
        a.insert(4);
        let mut b = PartitionSet::empty(10);
        b.insert(4);
        b.insert(9);
        assert_eq!(a.intersection(&b).iter().collect::<Vec<_>>(), vec![4]);
    }
}
