use alloc::{vec, vec::Vec};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-length array of bits, packed into 64-bit words.
///
/// All bits start cleared. Reads and writes take *O(1)* time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitArray {
    words: Vec<u64>,
    len: usize,
}

impl BitArray {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(BITS_PER_WORD)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / BITS_PER_WORD] >> (idx % BITS_PER_WORD) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let word = &mut self.words[idx / BITS_PER_WORD];
        let mask = 1 << (idx % BITS_PER_WORD);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
