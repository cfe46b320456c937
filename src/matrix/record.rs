// Record set - the `recorded` flags of one metric, packed as bits
//
// Bit i belongs to instance i of the owning matrix. A cell whose bit is clear
// holds no value: it is never exported and never divided into.

const WORD_BITS: usize = 64;

/// Fixed-width bit-set aligned with a metric's value vector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    words: Vec<u64>,
    len: usize,
}

impl RecordSet {
    /// Creates a set of `len` cleared flags
    pub fn with_len(len: usize) -> Self {
        RecordSet {
            words: vec![0; words_for(len)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the flag at `index`; out-of-range indexes read as cleared
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    pub fn set(&mut self, index: usize, recorded: bool) {
        if index >= self.len {
            return;
        }
        let mask = 1u64 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        if recorded {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Appends one flag at the end
    pub fn push(&mut self, recorded: bool) {
        self.len += 1;
        if self.words.len() < words_for(self.len) {
            self.words.push(0);
        }
        self.set(self.len - 1, recorded);
    }

    /// Removes the flag at `index` and shifts the following flags left
    pub fn remove(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        for i in index..self.len - 1 {
            let next = self.get(i + 1);
            self.set(i, next);
        }
        self.set(self.len - 1, false);
        self.len -= 1;
        self.words.truncate(words_for(self.len));
    }

    /// Clears every flag, one word at a time
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Number of set flags
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

fn words_for(len: usize) -> usize {
    len.div_ceil(WORD_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_across_words() {
        let mut rs = RecordSet::with_len(130);
        rs.set(0, true);
        rs.set(64, true);
        rs.set(129, true);
        assert!(rs.get(0));
        assert!(rs.get(64));
        assert!(rs.get(129));
        assert!(!rs.get(1));
        assert!(!rs.get(500));
        assert_eq!(rs.count_ones(), 3);
    }

    #[test]
    fn test_remove_shifts_left() {
        let mut rs = RecordSet::with_len(0);
        for b in [true, false, true, true] {
            rs.push(b);
        }
        rs.remove(1);
        assert_eq!(rs.len(), 3);
        assert!(rs.get(0) && rs.get(1) && rs.get(2));
        rs.remove(0);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.count_ones(), 2);
    }

    #[test]
    fn test_remove_across_word_boundary() {
        let mut rs = RecordSet::with_len(65);
        rs.set(64, true);
        rs.remove(3);
        assert_eq!(rs.len(), 64);
        assert!(rs.get(63));
        assert_eq!(rs.count_ones(), 1);
    }

    #[test]
    fn test_clear_all() {
        let mut rs = RecordSet::with_len(10);
        (0..10).for_each(|i| rs.set(i, true));
        rs.clear_all();
        assert_eq!(rs.count_ones(), 0);
        assert_eq!(rs.len(), 10);
    }
}
