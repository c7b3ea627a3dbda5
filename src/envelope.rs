//! Fixed-shape ring message.
//!
//! ```text
//! index:   0              1            2 .. n-2        n-1
//!        [ START_SENTINEL | sequence | payload ...  | END_SENTINEL ]
//! ```
//!
//! One envelope is allocated per sweep phase and reused for every trial of
//! that phase. Relays overwrite it with whatever they receive and forward it
//! untouched; the originator re-stamps the header each trial and checks the
//! sentinels when the envelope comes back around the ring.

use crate::error::{RingError, RingResult};
use crate::ipc::Tag;
use rand::Rng;

/// Marker stored in the first element
pub const START_SENTINEL: i32 = 232323;

/// Marker stored in the last element
pub const END_SENTINEL: i32 = 424242;

/// Wire tag of every ring hop
pub const RING_TAG: Tag = 123123;

/// Smallest envelope: header, sequence tag, trailer
pub const MIN_LEN: usize = 3;

const SEQUENCE_INDEX: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    data: Vec<i32>,
}

impl Envelope {
    /// Allocate a zero-payload envelope of `len` elements
    ///
    /// # Panics
    ///
    /// Panics if `len < MIN_LEN`. Callers size envelopes from the sweep
    /// sequence, so a short envelope is a programming error.
    pub fn new(len: usize) -> Self {
        assert!(
            len >= MIN_LEN,
            "envelope needs at least {} elements, got {}",
            MIN_LEN,
            len
        );
        let mut envelope = Self {
            data: vec![0; len],
        };
        envelope.stamp(0);
        envelope
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [i32] {
        &mut self.data
    }

    /// Write both sentinels and the trial's sequence tag
    pub fn stamp(&mut self, sequence: i32) {
        let last = self.data.len() - 1;
        self.data[0] = START_SENTINEL;
        self.data[SEQUENCE_INDEX] = sequence;
        self.data[last] = END_SENTINEL;
    }

    pub fn sequence(&self) -> i32 {
        self.data[SEQUENCE_INDEX]
    }

    pub fn payload(&self) -> &[i32] {
        &self.data[SEQUENCE_INDEX + 1..self.data.len() - 1]
    }

    /// Fill the payload with non-negative pseudorandom integers
    pub fn fill_random<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let last = self.data.len() - 1;
        for value in &mut self.data[SEQUENCE_INDEX + 1..last] {
            *value = rng.gen_range(0..i32::MAX);
        }
    }

    /// Check the sentinels and the sequence tag the originator stamped
    pub fn verify(&self, rank: usize, sequence: i32) -> RingResult<()> {
        let last = self.data.len() - 1;
        let expectations = [
            (0, START_SENTINEL),
            (SEQUENCE_INDEX, sequence),
            (last, END_SENTINEL),
        ];
        for (index, expected) in expectations {
            let found = self.data[index];
            if found != expected {
                return Err(RingError::EnvelopeCorrupted {
                    rank,
                    index,
                    found,
                    expected,
                });
            }
        }
        Ok(())
    }
}
