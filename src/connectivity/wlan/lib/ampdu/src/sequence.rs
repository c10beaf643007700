// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Modular sequence number arithmetic.
//!
//! The 802.11 sequence number field is 12 bits wide, so every comparison between two sequence
//! numbers must be made relative to some reference point. See IEEE Std 802.11-2016, 9.2.4.4.2.

use std::fmt;

/// Number of distinct sequence numbers.
pub const SEQ_MODULUS: u16 = 4096;

/// Half of the sequence space. A sequence number less than this distance ahead of a reference is
/// considered to follow it; anything further is considered to precede it.
const SEQ_HALF: u16 = SEQ_MODULUS / 2;

/// A sequence number in `[0, SEQ_MODULUS)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SeqNum(u16);

impl SeqNum {
    /// Creates a sequence number, discarding bits above the 12-bit field.
    pub const fn new(raw: u16) -> Self {
        Self(raw % SEQ_MODULUS)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub fn next(self) -> Self {
        self.add(1)
    }

    pub fn add(self, n: u16) -> Self {
        Self(((self.0 as u32 + n as u32) % SEQ_MODULUS as u32) as u16)
    }

    /// Number of steps forward from `self` to reach `later`, modulo `SEQ_MODULUS`.
    pub fn distance_to(self, later: SeqNum) -> u16 {
        (later.0 + SEQ_MODULUS - self.0) % SEQ_MODULUS
    }

    /// Returns true if `self` comes strictly before `other` in the circular sequence space.
    pub fn precedes(self, other: SeqNum) -> bool {
        let distance = self.distance_to(other);
        distance != 0 && distance < SEQ_HALF
    }

    /// Physical index of this sequence number in a circular array of `capacity` slots.
    pub fn slot(self, capacity: usize) -> usize {
        self.0 as usize % capacity
    }
}

impl From<SeqNum> for u16 {
    fn from(ssn: SeqNum) -> u16 {
        ssn.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test]
    fn new_wraps_into_field_width() {
        assert_eq!(SeqNum::new(4096).get(), 0);
        assert_eq!(SeqNum::new(4097).get(), 1);
        assert_eq!(SeqNum::new(4095).get(), 4095);
    }

    #[test]
    fn next_wraps_at_modulus() {
        assert_eq!(SeqNum::new(4095).next(), SeqNum::new(0));
        assert_eq!(SeqNum::new(4090).add(10), SeqNum::new(4));
    }

    #[test_case(0, 9, 9 ; "forward")]
    #[test_case(4095, 0, 1 ; "across wrap")]
    #[test_case(4090, 3, 9 ; "far across wrap")]
    #[test_case(5, 5, 0 ; "identical")]
    #[test_case(10, 9, 4095 ; "one behind")]
    fn distance_to(from: u16, to: u16, expected: u16) {
        assert_eq!(SeqNum::new(from).distance_to(SeqNum::new(to)), expected);
    }

    #[test]
    fn precedes_across_wrap() {
        assert!(SeqNum::new(4095).precedes(SeqNum::new(0)));
        assert!(!SeqNum::new(0).precedes(SeqNum::new(4095)));
        assert!(!SeqNum::new(7).precedes(SeqNum::new(7)));
    }

    #[test]
    fn slot_is_sequence_modulo_capacity() {
        assert_eq!(SeqNum::new(63).slot(64), 63);
        assert_eq!(SeqNum::new(64).slot(64), 0);
        assert_eq!(SeqNum::new(4095).slot(64), 63);
        assert_eq!(SeqNum::new(4095).next().slot(64), 0);
    }
}
