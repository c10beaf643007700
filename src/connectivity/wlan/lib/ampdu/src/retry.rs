// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Timeout sweep and retransmission.
//!
//! Frames stay in their window slot while they are retried; the retry queue only holds handles to
//! them. Retry aggregates go out ahead of anything queued normally.

use {
    crate::{
        aggregate::Aggregate,
        config::AmpduConfig,
        device::{RateSource, TxFlags, TxUnit},
        flow::{Flow, FlowParams, Outbox},
        frame::{FrameHandle, TxStatus},
        rate::RateSchedule,
        window::BlockAckWindow,
    },
    log::{debug, warn},
    std::{collections::VecDeque, time::Instant},
};

/// Frames affected by one timeout sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub timed_out: usize,
    pub queued: usize,
    pub dropped: usize,
}

impl Flow {
    /// Retries frames whose block-ack did not arrive within the configured wait.
    ///
    /// Sent frames older than the timeout are marked for retry, frames that drifted out of the
    /// negotiated window are dropped, and every frame awaiting retry moves to the retry queue.
    pub(crate) fn check_timeout(
        &self,
        now: Instant,
        config: &AmpduConfig,
        out: &mut Outbox,
    ) -> SweepOutcome {
        let mut window = self.window.lock();
        let mut retry = self.retry.lock();
        let mut outcome = SweepOutcome::default();
        if !self.is_operational() {
            return outcome;
        }
        let timeout = config.ba_wait_timeout();
        let window_size = window.size();
        window.for_each_outstanding(|offset, handle, frame| {
            if frame.status() == TxStatus::Sent {
                let expired = frame
                    .last_tx()
                    .map_or(true, |sent| now.saturating_duration_since(sent) >= timeout);
                if expired {
                    outcome.timed_out += 1;
                    if frame.mark_retry(config.max_retry) == TxStatus::Dropped {
                        outcome.dropped += 1;
                    }
                }
            }
            if offset >= window_size && matches!(frame.status(), TxStatus::Sent | TxStatus::Retry)
            {
                frame.set_status(TxStatus::Dropped);
                outcome.dropped += 1;
            }
            if frame.status() == TxStatus::Retry {
                frame.set_status(TxStatus::RetryQueued);
                retry.push_back(handle);
                outcome.queued += 1;
            }
        });
        drop(retry);
        out.complete(window.release_in_order());
        if !window.verify_occupancy() {
            self.stats.record_desync();
        }
        drop(window);

        for _ in 0..outcome.timed_out {
            self.stats.record_retry();
        }
        self.stats.record_discards(outcome.dropped);
        if outcome != SweepOutcome::default() {
            debug!("{}: {:?}", self.id, outcome);
        }
        outcome
    }

    /// Sends everything in the retry queue as head-of-line retry aggregates.
    pub(crate) fn send_retries(
        &self,
        config: &AmpduConfig,
        rate_source: &dyn RateSource,
        out: &mut Outbox,
    ) {
        let params = match self.params(config) {
            Some(params) => params,
            None => return,
        };
        let mut window = self.window.lock();
        let mut retry = self.retry.lock();
        if !self.is_operational() {
            return;
        }
        // Reports may retire queued frames between sweeps.
        if window.head().is_none() {
            retry.clear();
        } else {
            retry.retain(|handle| window.get_by_handle(*handle).is_some());
        }
        while !retry.is_empty() {
            let mut aggregate =
                match self.aggr_retry(&mut *window, &mut *retry, &params, config, rate_source) {
                    Some(aggregate) => aggregate,
                    None => {
                        warn!("{}: retry aggregation failed; {} frames wait", self.id, retry.len());
                        break;
                    }
                };
            // Retry aggregates only re-mark frames already in the window.
            if let Err(e) = aggregate.sync_to_window(&mut *window) {
                warn!("{}: retry aggregate not synced: {}", self.id, e);
            }
            self.stats.record_retry_aggregate();
            out.sends.push((
                TxUnit::Ampdu(aggregate.into_tx()),
                TxFlags::HEAD | TxFlags::BYPASS_FLOW_CONTROL,
            ));
        }
        drop(retry);
        out.complete(window.release_in_order());
    }

    /// Builds one retry aggregate from the head of the retry queue at the most robust rate.
    ///
    /// Returns `None` if nothing could be pulled. A frame that does not fit even an empty retry
    /// aggregate is dropped so that it cannot block the queue.
    pub(crate) fn aggr_retry(
        &self,
        window: &mut BlockAckWindow,
        retry: &mut VecDeque<FrameHandle>,
        params: &FlowParams,
        config: &AmpduConfig,
        rate_source: &dyn RateSource,
    ) -> Option<Aggregate> {
        assert!(
            window.head().is_some(),
            "{}: retry aggregation without a block-ack window",
            self.id
        );

        let (station, rates) = loop {
            let handle = *retry.front()?;
            match window.get_by_handle(handle) {
                Some(frame) => break (frame.station(), *frame.rates()),
                None => {
                    retry.pop_front();
                }
            }
        };
        let mut schedule = rate_source.retry_schedule(station, &rates);
        let mut max_len = rate_source.max_aggregate_length(station, schedule.lowest());
        if max_len == 0 {
            schedule = RateSchedule::single(config.fallback_rate);
            max_len = rate_source.max_aggregate_length(station, config.fallback_rate);
        }
        let max_len = max_len.min(config.max_ampdu_size);
        if max_len == 0 {
            return None;
        }

        let mut aggregate = Aggregate::new_retry(self.id, max_len, schedule);
        while aggregate.len() < params.max_aggregate_count {
            let handle = match retry.front() {
                Some(handle) => *handle,
                None => break,
            };
            let frame = match window.get_mut_by_handle(handle) {
                Some(frame) => frame,
                None => {
                    retry.pop_front();
                    continue;
                }
            };
            let contribution = frame.len() + params.mpdu_overhead;
            if !aggregate.fits(contribution) {
                if aggregate.is_empty() {
                    warn!(
                        "{} ssn {} of {} bytes exceeds retry budget {}; dropping",
                        self.id,
                        frame.ssn(),
                        contribution,
                        max_len
                    );
                    frame.set_status(TxStatus::Dropped);
                    self.stats.record_discards(1);
                    retry.pop_front();
                    continue;
                }
                break;
            }
            if let Err(e) = aggregate.copy_from(frame, contribution) {
                warn!("{}: retry aggregation deferred: {}", self.id, e);
                break;
            }
            frame.set_rates(schedule);
            retry.pop_front();
        }
        if aggregate.is_empty() {
            None
        } else {
            Some(aggregate)
        }
    }
}
