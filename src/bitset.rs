//! Dense bit vectors addressing fields by their global offset.
//!
//! A [`BitSet`] marks which offsets of a value tree an operation touches: a
//! producer sets a bit per changed field before a partial serialization, and
//! a consumer that skips intermediate updates keeps an *overrun* mask as the
//! running [`BitSet::or`] of everything it dropped. The wire image is a
//! size-prefixed little-endian byte string with trailing zeros trimmed, so a
//! sparse mask over a wide structure stays small.

use std::fmt;

use crate::serialize::{FlushSink, Reader, WireError, Writer};

const WORD_BITS: usize = 64;

#[derive(Clone, Debug, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

impl PartialEq for BitSet {
    /// Logical equality: trailing zero storage does not matter
    fn eq(&self, other: &Self) -> bool {
        let (short, long) = if self.words.len() <= other.words.len() {
            (&self.words, &other.words)
        } else {
            (&other.words, &self.words)
        };
        let n = short.len();
        short.as_slice() == &long[..n] && long[n..].iter().all(|&w| w == 0)
    }
}
impl Eq for BitSet {}

impl BitSet {
    pub fn new() -> Self {
        BitSet::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        BitSet {
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % WORD_BITS);
    }

    pub fn clear(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if word < self.words.len() {
            self.words[word] &= !(1 << (bit % WORD_BITS));
            self.trim();
        }
    }

    pub fn get(&self, bit: usize) -> bool {
        let word = bit / WORD_BITS;
        self.words
            .get(word)
            .is_some_and(|w| w & (1 << (bit % WORD_BITS)) != 0)
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    /// Number of set bits
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest set bit at or above `from`
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        let mut word = from / WORD_BITS;
        if word >= self.words.len() {
            return None;
        }
        let mut bits = self.words[word] & (u64::MAX << (from % WORD_BITS));
        loop {
            if bits != 0 {
                return Some(word * WORD_BITS + bits.trailing_zeros() as usize);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            bits = self.words[word];
        }
    }

    /// True if any bit in `start..end` is set
    pub fn any_in_range(&self, start: usize, end: usize) -> bool {
        matches!(self.next_set_bit(start), Some(bit) if bit < end)
    }

    pub fn or(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    pub fn and(&mut self, other: &BitSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
        self.trim();
    }

    /// Clear every bit that is set in `other`
    pub fn and_not(&mut self, other: &BitSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
        self.trim();
    }

    pub fn xor(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w ^= o;
        }
        self.trim();
    }

    /// Little-endian byte image with trailing zero bytes trimmed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self
            .words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut set = BitSet {
            words: Vec::with_capacity(bytes.len().div_ceil(8)),
        };
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            set.words.push(u64::from_le_bytes(word));
        }
        set.trim();
        set
    }

    pub fn serialize<S: FlushSink>(&self, writer: &mut Writer<S>) -> Result<(), WireError> {
        let bytes = self.to_bytes();
        writer.put_size(bytes.len())?;
        writer.put(&bytes)
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> Result<BitSet, WireError> {
        let len = reader.get_size()?;
        let bytes = reader.take(len)?;
        Ok(BitSet::from_bytes(bytes))
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for bit in iter {
            set.set(bit);
        }
        set
    }
}

impl fmt::Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        let mut bit = self.next_set_bit(0);
        while let Some(b) = bit {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{b}")?;
            first = false;
            bit = self.next_set_bit(b + 1);
        }
        write!(f, "}}")
    }
}
