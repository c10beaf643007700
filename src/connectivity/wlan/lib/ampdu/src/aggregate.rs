// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Aggregate construction.
//!
//! Frames are pulled from a flow's pending queue into a candidate aggregate until the candidate
//! reaches its byte budget or MPDU limit. Frame bytes are copied into the aggregate, so the frames
//! themselves can move into the block-ack window independently of the aggregate's buffer.
//! Finalized aggregates wait in the early queue until the window has room for all of their
//! frames.

use {
    crate::{
        config::AmpduConfig,
        device::{RateSource, TxFlags, TxUnit},
        error::Error,
        flow::{Flow, FlowId, FlowParams, Outbox},
        frame::{Frame, TxStatus},
        rate::RateSchedule,
        sequence::SeqNum,
        window::BlockAckWindow,
    },
    log::{debug, error, warn},
};

/// A built aggregate as handed to the transmit backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmpduTx {
    pub flow: FlowId,
    /// Sequence numbers of the MPDUs, in the order their bytes appear in `payload`.
    pub manifest: Vec<SeqNum>,
    /// Concatenated MPDU bytes.
    pub payload: Vec<u8>,
    pub rates: RateSchedule,
    pub retry: bool,
}

/// An aggregate under construction.
#[derive(Debug)]
pub struct Aggregate {
    flow: FlowId,
    manifest: Vec<SeqNum>,
    // Frames of a normal aggregate, owned until they move into the window.
    frames: Vec<Frame>,
    buffer: Vec<u8>,
    size: usize,
    max_size: usize,
    rates: RateSchedule,
    retry: bool,
}

impl Aggregate {
    pub fn new(flow: FlowId, max_size: usize, rates: RateSchedule) -> Self {
        Self {
            flow,
            manifest: vec![],
            frames: vec![],
            buffer: vec![],
            size: 0,
            max_size,
            rates,
            retry: false,
        }
    }

    /// Creates an aggregate of retransmissions. Its frames stay in the window throughout.
    pub fn new_retry(flow: FlowId, max_size: usize, rates: RateSchedule) -> Self {
        Self { retry: true, ..Self::new(flow, max_size, rates) }
    }

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    pub fn is_retry(&self) -> bool {
        self.retry
    }

    /// Accumulated on-air size in bytes, including per-MPDU overhead.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn manifest(&self) -> &[SeqNum] {
        &self.manifest[..]
    }

    pub fn fits(&self, contribution: usize) -> bool {
        self.size + contribution <= self.max_size
    }

    /// Appends a copy of `frame`'s bytes and records its sequence number. `contribution` is the
    /// frame's on-air size.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoResources` if the aggregate buffer cannot grow. The aggregate is left
    /// unchanged.
    pub fn copy_from(&mut self, frame: &Frame, contribution: usize) -> Result<(), Error> {
        self.buffer.try_reserve(frame.len()).map_err(|_| Error::NoResources(frame.len()))?;
        self.buffer.extend_from_slice(frame.bytes());
        self.size += contribution;
        self.manifest.push(frame.ssn());
        Ok(())
    }

    /// Takes ownership of a frame whose bytes were copied in.
    pub(crate) fn attach(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Releases the frames not yet moved into the window.
    pub(crate) fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    /// Publishes the aggregate's frames in the window.
    ///
    /// A normal aggregate is checked as a whole first, and nothing is inserted unless every frame
    /// fits. A retry aggregate re-marks frames already in the window. Returns frames abandoned
    /// because their slot was unexpectedly held.
    pub fn sync_to_window(&mut self, window: &mut BlockAckWindow) -> Result<Vec<Frame>, Error> {
        if self.retry {
            for &ssn in &self.manifest {
                match window.get_mut(ssn) {
                    Some(frame) => frame.set_status(TxStatus::Aggregated),
                    None => error!("{} retry ssn {} vanished from window", self.flow, ssn),
                }
            }
            return Ok(vec![]);
        }

        window.can_accept(&self.manifest[..])?;
        let mut abandoned = vec![];
        for mut frame in self.frames.drain(..) {
            frame.set_status(TxStatus::Aggregated);
            abandoned.extend(window.insert(frame));
        }
        Ok(abandoned)
    }

    pub fn into_tx(self) -> AmpduTx {
        AmpduTx {
            flow: self.flow,
            manifest: self.manifest,
            payload: self.buffer,
            rates: self.rates,
            retry: self.retry,
        }
    }
}

/// Byte budget for an aggregate led by `frame`: the lesser of the peer limit and what its primary
/// rate carries. Falls back to the configured rate when the primary rate carries nothing. Zero
/// means no aggregate can be built.
pub(crate) fn aggregate_budget(
    frame: &Frame,
    config: &AmpduConfig,
    rate_source: &dyn RateSource,
) -> usize {
    let mut max_len = rate_source.max_aggregate_length(frame.station(), frame.rates().primary());
    if max_len == 0 {
        max_len = rate_source.max_aggregate_length(frame.station(), config.fallback_rate);
    }
    max_len.min(config.max_ampdu_size)
}

struct FillResult {
    added: usize,
    budget_exhausted: bool,
}

impl Flow {
    /// Drains the pending queue into aggregates and sends whatever the window has room for.
    ///
    /// A candidate is finalized once it reaches the MPDU limit or its byte budget, or when
    /// nothing else is in flight: the early queue and window are empty and `backend_idle`.
    pub(crate) fn aggregate_pending(
        &self,
        config: &AmpduConfig,
        rate_source: &dyn RateSource,
        backend_idle: bool,
        out: &mut Outbox,
    ) {
        let mut candidate = self.candidate.lock();
        loop {
            let params = match self.params(config) {
                Some(params) => params,
                None => return,
            };
            let fill = self.fill_candidate(&mut *candidate, &params, config, rate_source, out);
            let finalize = match candidate.as_ref() {
                Some(aggregate) if !aggregate.is_empty() => {
                    aggregate.len() >= params.max_aggregate_count
                        || fill.budget_exhausted
                        || (fill.added > 0 && backend_idle && self.nothing_in_flight())
                }
                _ => false,
            };
            if !finalize {
                break;
            }
            if let Some(aggregate) = candidate.take() {
                self.queue_early(aggregate, config, out);
            }
        }
        drop(candidate);
        self.flush_early_queue(config, out);
    }

    fn nothing_in_flight(&self) -> bool {
        let early = self.early.lock();
        let window = self.window.lock();
        early.aggregates.is_empty() && window.is_empty()
    }

    fn fill_candidate(
        &self,
        candidate: &mut Option<Aggregate>,
        params: &FlowParams,
        config: &AmpduConfig,
        rate_source: &dyn RateSource,
        out: &mut Outbox,
    ) -> FillResult {
        let mut pending = self.pending.lock();
        let mut fill = FillResult { added: 0, budget_exhausted: false };
        loop {
            if candidate.as_ref().map_or(0, Aggregate::len) >= params.max_aggregate_count {
                return fill;
            }
            let front = match pending.front() {
                Some(front) => front,
                None => return fill,
            };
            let contribution = front.len() + params.mpdu_overhead;
            if candidate.is_none() {
                let max_size = aggregate_budget(front, config, rate_source);
                if max_size == 0 {
                    warn!(
                        "{}: no rate can carry an aggregate; {} frames wait",
                        self.id,
                        pending.len()
                    );
                    return fill;
                }
                if contribution > max_size {
                    warn!(
                        "{} ssn {} of {} bytes exceeds aggregate budget {}; sending alone",
                        self.id,
                        front.ssn(),
                        contribution,
                        max_size
                    );
                    out.singles.extend(pending.pop_front());
                    self.stats.record_singleton();
                    continue;
                }
                *candidate = Some(Aggregate::new(self.id, max_size, *front.rates()));
            }
            let aggregate = match candidate.as_mut() {
                Some(aggregate) => aggregate,
                None => return fill,
            };
            if !aggregate.fits(contribution) {
                fill.budget_exhausted = true;
                return fill;
            }
            if let Err(e) = aggregate.copy_from(front, contribution) {
                warn!("{}: aggregation deferred: {}", self.id, e);
                return fill;
            }
            if let Some(frame) = pending.pop_front() {
                aggregate.attach(frame);
                fill.added += 1;
            }
        }
    }

    fn queue_early(&self, aggregate: Aggregate, config: &AmpduConfig, out: &mut Outbox) {
        let mut early = self.early.lock();
        early.frame_count += aggregate.len();
        early.aggregates.push_back(aggregate);
        if !early.throttled && early.frame_count >= config.flow_control_high {
            debug!(
                "{}: {} frames queued early; throttling {:?}",
                self.id, early.frame_count, self.queue
            );
            early.throttled = true;
            out.throttle = Some(true);
        }
    }

    /// Finalizes a partially filled candidate when nothing is queued ahead of it.
    pub(crate) fn finalize_candidate(&self, config: &AmpduConfig, out: &mut Outbox) {
        let mut candidate = self.candidate.lock();
        if !self.is_operational() || !self.early.lock().aggregates.is_empty() {
            return;
        }
        match candidate.take() {
            Some(aggregate) if !aggregate.is_empty() => self.queue_early(aggregate, config, out),
            _ => {}
        }
    }

    /// Publishes queued aggregates in the window, in order, and queues them for transmission.
    ///
    /// Stops at the first aggregate the window cannot take yet. An aggregate whose frames collide
    /// with the window or precede it is discarded and its frames fail.
    pub(crate) fn flush_early_queue(&self, config: &AmpduConfig, out: &mut Outbox) {
        let mut early = self.early.lock();
        let mut window = self.window.lock();
        if !self.is_operational() {
            return;
        }
        loop {
            let head = match early.aggregates.front_mut() {
                Some(head) => head,
                None => break,
            };
            if head.is_empty() {
                early.aggregates.pop_front();
                continue;
            }
            if window.free_slots() < head.len() {
                break;
            }
            let len = head.len();
            match head.sync_to_window(&mut *window) {
                Ok(abandoned) => {
                    if !abandoned.is_empty() {
                        self.stats.record_desync();
                        out.fail(abandoned);
                    }
                }
                Err(e @ Error::OutsideWindow { .. }) | Err(e @ Error::WindowFull { .. }) => {
                    debug!("{}: aggregate waits for window: {}", self.id, e);
                    break;
                }
                Err(e) => {
                    error!("{}: discarding aggregate: {}", self.id, e);
                    self.stats.record_desync();
                    self.stats.record_discards(len);
                    if let Some(aggregate) = early.aggregates.pop_front() {
                        early.frame_count = early.frame_count.saturating_sub(len);
                        out.fail(aggregate.into_frames());
                    }
                    continue;
                }
            }
            if let Some(aggregate) = early.aggregates.pop_front() {
                early.frame_count = early.frame_count.saturating_sub(len);
                self.stats.record_aggregate(len);
                out.sends.push((
                    TxUnit::Ampdu(aggregate.into_tx()),
                    TxFlags::BYPASS_FLOW_CONTROL,
                ));
            }
        }
        if early.throttled && early.frame_count <= config.flow_control_low {
            debug!(
                "{}: {} frames queued early; releasing {:?}",
                self.id, early.frame_count, self.queue
            );
            early.throttled = false;
            out.throttle = Some(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::QueueId,
            frame::{test_utils::make_frame, StationId},
            rate::RateIndex,
            test_utils::FakeRateSource,
        },
        assert_matches::assert_matches,
    };

    fn operational_flow(buffer_size: u16) -> Flow {
        let flow = Flow::new(FlowId::new(StationId(1), 0), QueueId::BE);
        flow.start().expect("start");
        flow.operational(buffer_size, &AmpduConfig::default()).expect("operational");
        flow
    }

    fn aggregate_of(flow: &Flow, ssns: impl IntoIterator<Item = u16>) -> Aggregate {
        let mut aggregate = Aggregate::new(flow.id, 10_000, RateSchedule::default());
        for ssn in ssns {
            let frame = make_frame(1, 0, ssn, 100);
            aggregate.copy_from(&frame, frame.len()).expect("copy");
            aggregate.attach(frame);
        }
        aggregate
    }

    #[test]
    fn copy_accumulates_bytes_and_manifest() {
        let flow = operational_flow(64);
        let mut aggregate = Aggregate::new(flow.id, 250, RateSchedule::default());
        let frame = make_frame(1, 0, 7, 100);
        assert!(aggregate.fits(108));
        aggregate.copy_from(&frame, 108).expect("copy");
        assert_eq!(aggregate.size(), 108);
        assert_eq!(aggregate.manifest(), &[SeqNum::new(7)]);
        assert!(aggregate.fits(142));
        assert!(!aggregate.fits(143));
        let tx = aggregate.into_tx();
        assert_eq!(tx.payload, frame.bytes());
        assert!(!tx.retry);
    }

    #[test]
    fn sync_rejects_whole_aggregate_outside_window() {
        let flow = operational_flow(8);
        let mut window = flow.window.lock();
        assert!(window.insert(make_frame(1, 0, 0, 100)).is_none());

        let mut aggregate = aggregate_of(&flow, [3, 8]);
        assert_matches!(
            aggregate.sync_to_window(&mut window),
            Err(Error::OutsideWindow { ssn, .. }) if ssn == SeqNum::new(8)
        );
        assert_eq!(window.occupancy(), 1);
        assert!(window.get(SeqNum::new(3)).is_none());
        assert_eq!(aggregate.into_frames().len(), 2);
    }

    #[test]
    fn sync_marks_frames_aggregated() {
        let flow = operational_flow(64);
        let mut window = flow.window.lock();
        let mut aggregate = aggregate_of(&flow, [0, 1, 2]);
        assert_matches!(
            aggregate.sync_to_window(&mut window),
            Ok(abandoned) if abandoned.is_empty()
        );
        assert_eq!(window.head(), Some(SeqNum::new(0)));
        assert_eq!(window.occupancy(), 3);
        assert_eq!(window.get(SeqNum::new(2)).map(Frame::status), Some(TxStatus::Aggregated));
    }

    #[test]
    fn empty_pending_queue_builds_nothing() {
        let flow = operational_flow(64);
        let mut out = Outbox::default();
        flow.aggregate_pending(&AmpduConfig::default(), &FakeRateSource::new(1000), true, &mut out);
        assert!(out.sends.is_empty());
        assert!(flow.candidate.lock().is_none());
    }

    #[test]
    fn zero_budget_leaves_frames_pending() {
        let flow = operational_flow(64);
        flow.enqueue(make_frame(1, 0, 0, 100)).expect("enqueue");
        let mut out = Outbox::default();
        flow.aggregate_pending(&AmpduConfig::default(), &FakeRateSource::new(0), true, &mut out);
        assert!(out.sends.is_empty());
        assert!(out.singles.is_empty());
        assert!(flow.candidate.lock().is_none());
        assert_eq!(flow.pending.lock().len(), 1);
    }

    #[test]
    fn budget_is_capped_by_peer_limit() {
        let config = AmpduConfig { max_ampdu_size: 500, ..AmpduConfig::default() };
        let frame = make_frame(1, 0, 0, 100);
        assert_eq!(aggregate_budget(&frame, &config, &FakeRateSource::new(1000)), 500);

        let rate_source = FakeRateSource::new(300);
        rate_source.set_length(RateIndex::HT_MCS0, 0);
        let config = AmpduConfig { fallback_rate: RateIndex(16), ..config };
        assert_eq!(aggregate_budget(&frame, &config, &rate_source), 300);
    }

    #[test]
    fn oversized_head_frame_leaves_as_singleton() {
        let flow = operational_flow(64);
        flow.enqueue(make_frame(1, 0, 0, 2000)).expect("enqueue");
        flow.enqueue(make_frame(1, 0, 1, 100)).expect("enqueue");
        let mut out = Outbox::default();
        flow.aggregate_pending(&AmpduConfig::default(), &FakeRateSource::new(1000), true, &mut out);
        assert_eq!(out.singles.len(), 1);
        assert_eq!(out.singles[0].ssn(), SeqNum::new(0));
        assert_eq!(out.aggregate_count(), 1);
        assert_eq!(flow.stats.snapshot().singletons, 1);
    }

    #[test]
    fn stale_early_aggregate_is_discarded() {
        let flow = operational_flow(64);
        flow.window.lock().insert(make_frame(1, 0, 100, 100));
        {
            let mut early = flow.early.lock();
            early.frame_count = 2;
            early.aggregates.push_back(aggregate_of(&flow, [50, 51]));
        }
        let mut out = Outbox::default();
        flow.flush_early_queue(&AmpduConfig::default(), &mut out);
        assert!(out.sends.is_empty());
        let failed: Vec<(u16, bool)> =
            out.completions.iter().map(|(frame, acked)| (frame.ssn().get(), *acked)).collect();
        assert_eq!(failed, vec![(50, false), (51, false)]);
        assert_eq!(flow.early.lock().frame_count, 0);
        assert_eq!(flow.stats.snapshot().discards, 2);
    }
}
