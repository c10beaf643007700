// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transmit rate indices, per-frame rate schedules and the HT aggregate length table.

use {
    crate::{device::RateSource, frame::StationId},
    serde::{Deserialize, Serialize},
};

/// Maximum number of rates in a hardware retry schedule.
pub const TX_MAX_RATES: usize = 4;

/// Index into the device rate table.
///
/// Indices `[0, 7)` are DSSS/CCK rates, `[7, 15)` are ERP-OFDM rates, `[15, 23)` are HT MCS 0-7
/// with a long guard interval, `[23, 31)` are HT MCS 0-7 with a short guard interval and
/// `[31, 39)` are HT-greenfield MCS 0-7.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateIndex(pub u8);

impl RateIndex {
    pub const DSSS_1M: Self = Self(0);
    pub const ERP_6M: Self = Self(7);
    pub const HT_MCS0: Self = Self(15);
    pub const HT_SGI_MCS0: Self = Self(23);
    pub const HT_GF_MCS0: Self = Self(31);
    pub const COUNT: usize = 39;

    pub fn is_dsss_cck(self) -> bool {
        self < Self::ERP_6M
    }
}

/// Ordered list of rates the hardware tries for one transmission, fastest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSchedule {
    rates: [RateIndex; TX_MAX_RATES],
    len: usize,
}

impl RateSchedule {
    /// Builds a schedule from at most `TX_MAX_RATES` rates. An empty list yields HT MCS 0.
    pub fn new(rates: &[RateIndex]) -> Self {
        if rates.is_empty() {
            return Self::single(RateIndex::HT_MCS0);
        }
        let len = rates.len().min(TX_MAX_RATES);
        let mut schedule = [RateIndex::HT_MCS0; TX_MAX_RATES];
        schedule[..len].copy_from_slice(&rates[..len]);
        Self { rates: schedule, len }
    }

    pub fn single(rate: RateIndex) -> Self {
        Self { rates: [rate; TX_MAX_RATES], len: 1 }
    }

    pub fn rates(&self) -> &[RateIndex] {
        &self.rates[..self.len]
    }

    /// The rate of the first attempt.
    pub fn primary(&self) -> RateIndex {
        self.rates[0]
    }

    /// The last rate of the schedule, which is the most robust one.
    pub fn lowest(&self) -> RateIndex {
        self.rates[self.len - 1]
    }
}

impl Default for RateSchedule {
    fn default() -> Self {
        Self::single(RateIndex::HT_MCS0)
    }
}

/// Largest AMPDU length in bytes that fits the 4ms PPDU limit at each rate index. Non-HT rates
/// cannot carry an AMPDU.
#[rustfmt::skip]
const MAX_TRANSMIT_LENGTH: [usize; RateIndex::COUNT] = [
    // DSSS/CCK
    0, 0, 0, 0, 0, 0, 0,
    // ERP-OFDM
    0, 0, 0, 0, 0, 0, 0, 0,
    // HT MCS 0-7, long GI
    4429, 8860, 13291, 17723, 26586, 35448, 39880, 44311,
    // HT MCS 0-7, short GI
    4921, 9844, 14768, 19692, 29539, 39387, 44311, 49234,
    // HT-greenfield MCS 0-7
    4429, 8860, 13291, 17723, 26586, 35448, 39880, 44311,
];

/// Looks up the aggregate length limit for a rate index. Unknown indices yield 0.
pub fn max_transmit_length(rate: RateIndex) -> usize {
    MAX_TRANSMIT_LENGTH.get(rate.0 as usize).copied().unwrap_or(0)
}

/// A `RateSource` that answers from the static HT length table and ignores feedback.
#[derive(Debug, Default)]
pub struct StaticRateTable;

impl RateSource for StaticRateTable {
    fn max_aggregate_length(&self, _station: StationId, rate: RateIndex) -> usize {
        max_transmit_length(rate)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case(RateIndex::DSSS_1M, 0 ; "dsss")]
    #[test_case(RateIndex::ERP_6M, 0 ; "ofdm")]
    #[test_case(RateIndex::HT_MCS0, 4429 ; "mcs0")]
    #[test_case(RateIndex(22), 44311 ; "mcs7")]
    #[test_case(RateIndex(30), 49234 ; "mcs7 sgi")]
    #[test_case(RateIndex::HT_GF_MCS0, 4429 ; "greenfield mcs0")]
    #[test_case(RateIndex(39), 0 ; "out of range")]
    fn static_table_lengths(rate: RateIndex, expected: usize) {
        assert_eq!(StaticRateTable.max_aggregate_length(StationId(1), rate), expected);
    }

    #[test]
    fn rate_classes() {
        assert!(RateIndex(6).is_dsss_cck());
        assert!(!RateIndex::ERP_6M.is_dsss_cck());
        assert!(!RateIndex::HT_MCS0.is_dsss_cck());
    }

    #[test]
    fn schedule_primary_and_lowest() {
        let schedule = RateSchedule::new(&[RateIndex(22), RateIndex(19), RateIndex(15)]);
        assert_eq!(schedule.primary(), RateIndex(22));
        assert_eq!(schedule.lowest(), RateIndex(15));
        assert_eq!(schedule.rates().len(), 3);
    }

    #[test]
    fn schedule_truncates_and_defaults() {
        let rates: Vec<_> = (15..21).map(RateIndex).collect();
        let schedule = RateSchedule::new(&rates[..]);
        assert_eq!(schedule.rates(), &rates[..TX_MAX_RATES]);
        assert_eq!(RateSchedule::new(&[]), RateSchedule::single(RateIndex::HT_MCS0));
    }
}
