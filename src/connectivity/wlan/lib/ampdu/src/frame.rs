// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-MPDU transmit bookkeeping and the arena that backs block-ack window slots.

use {
    crate::{rate::RateSchedule, sequence::SeqNum},
    serde::{Deserialize, Serialize},
    slab::Slab,
    std::{fmt, time::Instant},
};

/// Retry subfield of the second frame control octet. See IEEE Std 802.11-2016, 9.2.4.1.1.
const FRAME_CONTROL_RETRY: u8 = 1 << 3;

/// Association identifier of a peer. Frames refer to their station by id only and never keep it
/// alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationId(pub u16);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregation status of an MPDU.
///
/// Status only moves forward, except through the retry cycle
/// `Sent -> Retry -> RetryQueued -> Aggregated -> Sent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    NonAggregated,
    Aggregated,
    Sent,
    Retry,
    RetryQueued,
    Done,
    Dropped,
}

impl TxStatus {
    pub fn is_retired(self) -> bool {
        matches!(self, TxStatus::Done | TxStatus::Dropped)
    }
}

/// An MPDU owned by an aggregation flow.
#[derive(Clone, Debug)]
pub struct Frame {
    buffer: Vec<u8>,
    station: StationId,
    tid: u8,
    ssn: SeqNum,
    rates: RateSchedule,
    status: TxStatus,
    retry_count: u8,
    last_tx: Option<Instant>,
    retry_bit: bool,
    directly_acked: bool,
}

impl Frame {
    pub fn new(
        buffer: Vec<u8>,
        station: StationId,
        tid: u8,
        ssn: SeqNum,
        rates: RateSchedule,
    ) -> Self {
        Self {
            buffer,
            station,
            tid,
            ssn,
            rates,
            status: TxStatus::NonAggregated,
            retry_count: 0,
            last_tx: None,
            retry_bit: false,
            directly_acked: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..]
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn station(&self) -> StationId {
        self.station
    }

    pub fn tid(&self) -> u8 {
        self.tid
    }

    pub fn ssn(&self) -> SeqNum {
        self.ssn
    }

    pub fn rates(&self) -> &RateSchedule {
        &self.rates
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Time of the most recent over-the-air attempt, if the backend reported one.
    pub fn last_tx(&self) -> Option<Instant> {
        self.last_tx
    }

    pub fn is_retransmission(&self) -> bool {
        self.retry_bit
    }

    /// True if the OS was told this frame succeeded before it was actually acknowledged.
    pub fn is_directly_acked(&self) -> bool {
        self.directly_acked
    }

    pub(crate) fn set_status(&mut self, status: TxStatus) {
        self.status = status;
    }

    pub(crate) fn set_rates(&mut self, rates: RateSchedule) {
        self.rates = rates;
    }

    pub(crate) fn set_directly_acked(&mut self, directly_acked: bool) {
        self.directly_acked = directly_acked;
    }

    pub(crate) fn mark_sent(&mut self, at: Option<Instant>) {
        self.status = TxStatus::Sent;
        self.last_tx = at;
    }

    /// Records a failed attempt of a sent frame.
    ///
    /// Has no effect unless the frame is `Sent`. The first retry sets the retry bit of the frame
    /// header. A frame whose retry count reaches `max_retry` is dropped instead of retried.
    /// Returns the resulting status.
    pub fn mark_retry(&mut self, max_retry: u8) -> TxStatus {
        if self.status != TxStatus::Sent {
            return self.status;
        }
        if self.retry_count == 0 {
            self.set_retry_bit();
        }
        self.status = TxStatus::Retry;
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count >= max_retry {
            self.status = TxStatus::Dropped;
        }
        self.status
    }

    fn set_retry_bit(&mut self) {
        self.retry_bit = true;
        if let Some(fc) = self.buffer.get_mut(1) {
            *fc |= FRAME_CONTROL_RETRY;
        }
    }
}

/// Generation-checked reference to a frame held in a `FrameArena`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    key: usize,
    generation: u32,
}

struct Entry {
    generation: u32,
    frame: Frame,
}

/// Storage for frames that sit in a block-ack window.
///
/// Slots are recycled, so every handle carries the generation of the frame it was issued for. A
/// handle to a removed frame never resolves, even after its slot is reused.
#[derive(Default)]
pub struct FrameArena {
    entries: Slab<Entry>,
    generation: u32,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: Frame) -> FrameHandle {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let key = self.entries.insert(Entry { generation, frame });
        FrameHandle { key, generation }
    }

    pub fn get(&self, handle: FrameHandle) -> Option<&Frame> {
        match self.entries.get(handle.key) {
            Some(entry) if entry.generation == handle.generation => Some(&entry.frame),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: FrameHandle) -> Option<&mut Frame> {
        match self.entries.get_mut(handle.key) {
            Some(entry) if entry.generation == handle.generation => Some(&mut entry.frame),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: FrameHandle) -> Option<Frame> {
        self.get(handle)?;
        Some(self.entries.remove(handle.key).frame)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use {super::test_utils::make_frame, super::*};

    #[test]
    fn new_frame_is_not_aggregated() {
        let frame = make_frame(1, 0, 7, 100);
        assert_eq!(frame.status(), TxStatus::NonAggregated);
        assert_eq!(frame.retry_count(), 0);
        assert_eq!(frame.last_tx(), None);
        assert!(!frame.is_retransmission());
        assert_eq!(frame.len(), 100);
    }

    #[test]
    fn mark_retry_ignores_unsent_frames() {
        let mut frame = make_frame(1, 0, 7, 100);
        assert_eq!(frame.mark_retry(2), TxStatus::NonAggregated);
        frame.set_status(TxStatus::Aggregated);
        assert_eq!(frame.mark_retry(2), TxStatus::Aggregated);
        assert_eq!(frame.retry_count(), 0);
    }

    #[test]
    fn first_retry_sets_header_retry_bit() {
        let mut frame = make_frame(1, 0, 7, 100);
        frame.mark_sent(Some(Instant::now()));
        assert_eq!(frame.mark_retry(3), TxStatus::Retry);
        assert!(frame.is_retransmission());
        assert_eq!(frame.bytes()[1] & FRAME_CONTROL_RETRY, FRAME_CONTROL_RETRY);
        assert_eq!(frame.retry_count(), 1);
    }

    #[test]
    fn retry_at_maximum_drops() {
        let mut frame = make_frame(1, 0, 7, 100);
        frame.mark_sent(None);
        assert_eq!(frame.mark_retry(2), TxStatus::Retry);
        frame.mark_sent(None);
        assert_eq!(frame.mark_retry(2), TxStatus::Dropped);
        assert_eq!(frame.retry_count(), 2);
        // A dropped frame is final.
        assert_eq!(frame.mark_retry(2), TxStatus::Dropped);
        assert_eq!(frame.retry_count(), 2);
    }

    #[test]
    fn arena_rejects_stale_handles() {
        let mut arena = FrameArena::new();
        let first = arena.insert(make_frame(1, 0, 1, 10));
        assert_eq!(arena.get(first).map(Frame::ssn), Some(SeqNum::new(1)));
        assert_eq!(arena.remove(first).map(|f| f.ssn()), Some(SeqNum::new(1)));

        // The recycled slot must not be reachable through the old handle.
        let second = arena.insert(make_frame(1, 0, 2, 10));
        assert!(arena.get(first).is_none());
        assert!(arena.get_mut(first).is_none());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.get(second).map(Frame::ssn), Some(SeqNum::new(2)));
        assert_eq!(arena.len(), 1);
    }
}
