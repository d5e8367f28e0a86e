//! Sliding 13-bit shift register with load-strobe latching
//!
//! Mirrors the register inside the DAC: serial-data bits shift in on every
//! rising clock edge, and a falling edge on the load strobe latches the
//! current 13-bit window as a complete word. Once full, the register slides —
//! the oldest bit is evicted as each new one arrives — so it never grows
//! beyond the word width plus the one bit appended before eviction.

use super::types::Bit;
use super::word::Word;
use std::collections::VecDeque;

/// Bits in a complete word
pub const WORD_BITS: usize = 13;
/// Bits in the mantissa field (window positions 0..10)
pub const MANTISSA_BITS: usize = 10;
/// Bits in the exponent field (window positions 10..13)
pub const EXPONENT_BITS: usize = 3;

/// Which bits became reportable as a result of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// Register still filling; bit observations are withheld until full
    None,
    /// The register just filled; every buffered bit is observable at once
    All,
    /// Steady state; only the freshly appended bit is new
    Newest,
}

/// Result of appending one sampled bit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftOutcome {
    /// Word latched by a falling load edge on this clock cycle, if any
    pub latched: Option<Word>,
    /// Bit-observation report for this clock cycle
    pub observed: Observed,
}

/// The decoder's sliding window over the serial-data stream
///
/// `append` is called exactly once per rising clock edge with the
/// concurrently sampled serial-data and load levels. Length after any append
/// is `min(edges, 13)`; a 14th bit exists only transiently inside `append`
/// before the oldest is evicted.
pub struct ShiftRegister {
    bits: VecDeque<Bit>,
    /// Load level at the previous clock edge, for falling-edge detection
    last_load: bool,
    /// Total bits ever appended (diagnostic only)
    bits_seen: u64,
}

impl ShiftRegister {
    pub fn new() -> Self {
        Self {
            bits: VecDeque::with_capacity(WORD_BITS + 1),
            last_load: false,
            bits_seen: 0,
        }
    }

    /// Clear all state, returning the register to the start of a session
    pub fn reset(&mut self) {
        self.bits.clear();
        self.last_load = false;
        self.bits_seen = 0;
    }

    /// Shift in one bit sampled at a rising clock edge.
    ///
    /// `sd` and `load` are the serial-data and load levels observed at
    /// `index`. A word is latched iff the register already holds a full
    /// window and the load strobe fell (1 at the previous edge, 0 now). The
    /// latched word is the most recent 13 bits, including the bit appended
    /// this cycle.
    pub fn append(&mut self, sd: bool, load: bool, index: u64) -> ShiftOutcome {
        self.bits.push_back(Bit::at(u8::from(sd), index));
        self.bits_seen += 1;

        let mut latched = None;
        let mut observed = Observed::None;

        if self.bits.len() >= WORD_BITS {
            // Falling load edge: the DAC latches the word
            if self.last_load && !load {
                latched = Some(self.window());
            }

            observed = if self.bits.len() == WORD_BITS {
                Observed::All
            } else {
                Observed::Newest
            };

            // It's a shift register, so shift out.
            if self.bits.len() > WORD_BITS {
                self.bits.pop_front();
            }
        }

        self.last_load = load;

        ShiftOutcome { latched, observed }
    }

    /// The most recent full window as a word view.
    fn window(&self) -> Word {
        debug_assert!(self.bits.len() >= WORD_BITS);
        let skip = self.bits.len() - WORD_BITS;
        let mut bits = [Bit::at(0, 0); WORD_BITS];
        for (slot, bit) in bits.iter_mut().zip(self.bits.iter().skip(skip)) {
            *slot = *bit;
        }
        Word::new(bits)
    }

    /// Number of bits currently held
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True until the first bit is appended
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// True once a full word's worth of bits has been captured
    pub fn is_full(&self) -> bool {
        self.bits.len() >= WORD_BITS
    }

    /// The most recently appended bit
    pub fn newest(&self) -> Option<&Bit> {
        self.bits.back()
    }

    /// The oldest retained bit
    pub fn oldest(&self) -> Option<&Bit> {
        self.bits.front()
    }

    /// Bits in chronological order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Bit> {
        self.bits.iter()
    }

    /// Total bits ever appended in this session
    pub fn bits_seen(&self) -> u64 {
        self.bits_seen
    }
}

impl Default for ShiftRegister {
    fn default() -> Self {
        Self::new()
    }
}
