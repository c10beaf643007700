// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        aggregate::{aggregate_budget, AmpduTx},
        ba_report::{BaBitmap, BaOutcome},
        config::AmpduConfig,
        error::Error,
        flow::{queue_for_tid, Flow, FlowId, FlowState, Outbox, WMM_TID_NUM},
        frame::{Frame, StationId},
        rate::{RateIndex, RateSchedule},
        sequence::SeqNum,
        stats::FlowStatsSnapshot,
        window::WindowStatus,
    },
    log::{debug, error, info},
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        ops::BitOr,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Instant,
    },
};

/// Hardware transmit queue, one per access category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub u8);
impl QueueId {
    pub const VO: Self = Self(0);
    pub const VI: Self = Self(1);
    pub const BE: Self = Self(2);
    pub const BK: Self = Self(3);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxFlags(pub u32);
impl TxFlags {
    pub const NONE: Self = Self(0);
    /// Queue ahead of everything already waiting in the backend queue.
    pub const HEAD: Self = Self(1);
    /// Skip the backend's own byte budget for this queue.
    pub const BYPASS_FLOW_CONTROL: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TxFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Unit of work for the transmit backend.
#[derive(Debug)]
pub enum TxUnit {
    Ampdu(AmpduTx),
    /// A frame sent outside aggregation. The backend owns its completion unless the frame
    /// `is_directly_acked`, in which case it was already reported.
    Mpdu(Frame),
}

/// Bus and firmware side of transmission.
pub trait Transmitter: Send + Sync {
    /// Hands a unit to the backend.
    ///
    /// # Errors
    ///
    /// An error should be returned if the backend could not take the unit. Frames of a rejected
    /// aggregate stay in the block-ack window and are retried on the next sweep.
    fn send(&self, unit: TxUnit, queue: QueueId, flags: TxFlags) -> Result<(), Error>;

    /// Returns true if nothing is waiting in the backend's `queue`.
    fn queue_is_empty(&self, queue: QueueId) -> bool;

    /// Stops or resumes the OS feeding `queue`.
    fn set_queue_throttle(&self, queue: QueueId, enabled: bool);
}

/// Rate control.
pub trait RateSource: Send + Sync {
    /// Longest aggregate in bytes that `rate` can carry to `station`. Zero means the rate cannot
    /// carry an aggregate at all.
    fn max_aggregate_length(&self, station: StationId, rate: RateIndex) -> usize;

    /// Schedule for retransmitting frames that were first sent with `current`.
    fn retry_schedule(&self, _station: StationId, current: &RateSchedule) -> RateSchedule {
        RateSchedule::single(current.lowest())
    }

    /// Feedback from one block-ack report.
    fn on_ampdu_report(&self, _station: StationId, _tid: u8, _attempted: usize, _acked: usize) {}
}

/// Receives every frame the engine retires, exactly once.
pub trait CompletionSink: Send + Sync {
    fn notify(&self, frame: Frame, acked: bool);
}

/// Outcome of `Device::accept`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The frame joined its flow's aggregation queue.
    Queued,
    /// The frame was handed to the backend unaggregated.
    Singleton,
}

/// Aggregation engine of one device.
///
/// Owns every station's flows and the backend capabilities. All entry points may be called
/// concurrently; flows serialize internally.
pub struct Device {
    config: AmpduConfig,
    transmitter: Arc<dyn Transmitter>,
    rate_source: Arc<dyn RateSource>,
    completion_sink: Arc<dyn CompletionSink>,
    flows: RwLock<HashMap<FlowId, Arc<Flow>>>,
    // Flows in `Start` or `Operational`, in the order they were started.
    active: Mutex<Vec<FlowId>>,
    // Frames accepted for aggregation and not yet completed.
    in_flight: AtomicUsize,
    directly_ack: AtomicBool,
}

impl Device {
    pub fn new(
        config: AmpduConfig,
        transmitter: Arc<dyn Transmitter>,
        rate_source: Arc<dyn RateSource>,
        completion_sink: Arc<dyn CompletionSink>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let directly_ack = config.directly_ack.is_some();
        Ok(Self {
            config,
            transmitter,
            rate_source,
            completion_sink,
            flows: RwLock::new(HashMap::new()),
            active: Mutex::new(vec![]),
            in_flight: AtomicUsize::new(0),
            directly_ack: AtomicBool::new(directly_ack),
        })
    }

    pub fn config(&self) -> &AmpduConfig {
        &self.config
    }

    fn flow(&self, id: FlowId) -> Result<Arc<Flow>, Error> {
        self.flows.read().get(&id).cloned().ok_or(Error::UnknownFlow(id))
    }

    fn active_flows(&self) -> Vec<Arc<Flow>> {
        let active = self.active.lock().clone();
        let flows = self.flows.read();
        active.iter().filter_map(|id| flows.get(id).cloned()).collect()
    }

    /// Creates stopped flows for every TID of a newly associated station.
    pub fn add_station(&self, station: StationId) -> Result<(), Error> {
        let mut flows = self.flows.write();
        if flows.contains_key(&FlowId::new(station, 0)) {
            return Err(Error::StationExists(station));
        }
        for tid in 0..WMM_TID_NUM {
            let id = FlowId::new(station, tid);
            flows.insert(id, Arc::new(Flow::new(id, queue_for_tid(tid))));
        }
        Ok(())
    }

    /// Stops and forgets every flow of a departing station.
    pub fn remove_station(&self, station: StationId) -> Result<(), Error> {
        let removed: Vec<Arc<Flow>> = {
            let mut flows = self.flows.write();
            (0..WMM_TID_NUM).filter_map(|tid| flows.remove(&FlowId::new(station, tid))).collect()
        };
        if removed.is_empty() {
            return Err(Error::UnknownFlow(FlowId::new(station, 0)));
        }
        for flow in removed {
            self.stop(&flow);
        }
        Ok(())
    }

    /// Records whether the station's pairwise cipher appends an AEAD MIC to every MPDU.
    pub fn set_pairwise_aead(&self, station: StationId, aead: bool) -> Result<(), Error> {
        for tid in 0..WMM_TID_NUM {
            self.flow(FlowId::new(station, tid))?.set_aead(aead);
        }
        Ok(())
    }

    /// Begins a block-ack session on a flow.
    pub fn start_flow(&self, id: FlowId) -> Result<(), Error> {
        let flow = self.flow(id)?;
        match flow.start() {
            Ok(true) => {
                self.active.lock().push(id);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(state) => Err(Error::BadState { flow: id, state }),
        }
    }

    /// Enables aggregation with the negotiated block-ack buffer size.
    pub fn operational(&self, id: FlowId, buffer_size: u16) -> Result<(), Error> {
        self.flow(id)?
            .operational(buffer_size, &self.config)
            .map_err(|state| Error::BadState { flow: id, state })
    }

    /// Ends a block-ack session, failing every frame the flow still holds.
    pub fn stop_flow(&self, id: FlowId) -> Result<(), Error> {
        let flow = self.flow(id)?;
        self.stop(&flow);
        Ok(())
    }

    fn stop(&self, flow: &Flow) {
        let mut out = Outbox::default();
        if flow.stop(&mut out) {
            self.active.lock().retain(|id| *id != flow.id());
        }
        self.dispatch(flow, out);
    }

    pub fn flow_state(&self, id: FlowId) -> Result<FlowState, Error> {
        Ok(self.flow(id)?.state())
    }

    pub fn flow_stats(&self, id: FlowId) -> Result<FlowStatsSnapshot, Error> {
        Ok(self.flow(id)?.stats.snapshot())
    }

    pub fn window_status(&self, id: FlowId) -> Result<WindowStatus, Error> {
        Ok(self.flow(id)?.window_status())
    }

    /// Number of frames accepted for aggregation and not yet completed.
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Takes a frame from the generic transmit path.
    ///
    /// Frames of a flow that is not operational, or that no rate can carry in an aggregate, go to
    /// the backend unaggregated.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFlow` if the frame's station was never added, or the backend's
    /// error if it rejects a singleton.
    pub fn accept(&self, mut frame: Frame) -> Result<AcceptOutcome, Error> {
        let flow = self.flow(FlowId::new(frame.station(), frame.tid()))?;
        let aggregatable = match flow.params(&self.config) {
            Some(params) => {
                let budget = aggregate_budget(&frame, &self.config, &*self.rate_source);
                budget > 0 && frame.len() + params.mpdu_overhead <= budget
            }
            None => false,
        };
        if !aggregatable {
            flow.stats.record_singleton();
            self.transmitter.send(TxUnit::Mpdu(frame), flow.queue(), TxFlags::NONE)?;
            return Ok(AcceptOutcome::Singleton);
        }

        let early_ack = self.take_directly_ack_slot();
        let copy = if early_ack {
            frame.set_directly_acked(true);
            Some(frame.clone())
        } else {
            None
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(mut frame) = flow.enqueue(frame) {
            // Stopped since the check above.
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            frame.set_directly_acked(false);
            flow.stats.record_singleton();
            self.transmitter.send(TxUnit::Mpdu(frame), flow.queue(), TxFlags::NONE)?;
            return Ok(AcceptOutcome::Singleton);
        }
        if let Some(copy) = copy {
            self.completion_sink.notify(copy, true);
        }

        let backend_idle = self.transmitter.queue_is_empty(flow.queue());
        let mut out = Outbox::default();
        flow.aggregate_pending(&self.config, &*self.rate_source, backend_idle, &mut out);
        self.dispatch(&flow, out);
        Ok(AcceptOutcome::Queued)
    }

    /// Decides whether the next accepted frame is reported to the OS before it is acknowledged.
    fn take_directly_ack_slot(&self) -> bool {
        let thresholds = match self.config.directly_ack {
            Some(thresholds) => thresholds,
            None => return false,
        };
        if self.directly_ack.load(Ordering::SeqCst)
            && self.in_flight.load(Ordering::SeqCst) < thresholds.high
        {
            return true;
        }
        self.directly_ack.store(false, Ordering::SeqCst);
        false
    }

    /// Stamps the frames of an aggregate the backend put on air at `at`.
    pub fn on_aggregate_sent(
        &self,
        id: FlowId,
        manifest: &[SeqNum],
        at: Instant,
    ) -> Result<(), Error> {
        self.flow(id)?.on_aggregate_sent(manifest, Some(at));
        Ok(())
    }

    /// Applies a block-ack report and returns how many MPDUs were attempted and acknowledged.
    pub fn on_ba_report(
        &self,
        id: FlowId,
        starting_ssn: SeqNum,
        bitmap: BaBitmap,
        manifest: &[SeqNum],
    ) -> Result<BaOutcome, Error> {
        let flow = self.flow(id)?;
        let mut out = Outbox::default();
        let outcome = flow.ba_map_walker(starting_ssn, &bitmap, manifest, &self.config, &mut out);
        flow.flush_early_queue(&self.config, &mut out);
        self.dispatch(&flow, out);
        if outcome.attempted > 0 {
            self.rate_source.on_ampdu_report(id.station, id.tid, outcome.attempted, outcome.acked);
        }
        Ok(outcome)
    }

    /// Applies a report that an entire aggregate went unacknowledged.
    pub fn on_no_ba(&self, id: FlowId, manifest: &[SeqNum]) -> Result<usize, Error> {
        let flow = self.flow(id)?;
        let mut out = Outbox::default();
        let attempted = flow.no_ba(manifest, &self.config, &mut out);
        flow.flush_early_queue(&self.config, &mut out);
        self.dispatch(&flow, out);
        if attempted > 0 {
            self.rate_source.on_ampdu_report(id.station, id.tid, attempted, 0);
        }
        Ok(attempted)
    }

    /// Retries timed out frames and drains early queues of every operational flow.
    pub fn periodic_sweep(&self, now: Instant) {
        for flow in self.active_flows() {
            if !flow.is_operational() {
                continue;
            }
            let mut out = Outbox::default();
            flow.check_timeout(now, &self.config, &mut out);
            flow.send_retries(&self.config, &*self.rate_source, &mut out);
            flow.flush_early_queue(&self.config, &mut out);
            self.dispatch(&flow, out);
        }
    }

    /// Sends partially filled aggregates now that the backend has gone idle. Returns the number
    /// of aggregates sent.
    pub fn ampdu_flush(&self) -> usize {
        let mut sent = 0;
        for flow in self.active_flows() {
            if !flow.is_operational() {
                continue;
            }
            let mut out = Outbox::default();
            flow.finalize_candidate(&self.config, &mut out);
            flow.aggregate_pending(&self.config, &*self.rate_source, true, &mut out);
            sent += out.aggregate_count();
            self.dispatch(&flow, out);
        }
        sent
    }

    /// Returns true once the station's rate control has dropped to a DSSS/CCK `current_rate` and
    /// the flow holds no frames, so the session can be torn down and the station served without
    /// aggregation. Aggregates are only flushed at CCK rates.
    pub fn can_fall_back_to_mpdu(
        &self,
        id: FlowId,
        current_rate: RateIndex,
    ) -> Result<bool, Error> {
        let flow = self.flow(id)?;
        if !current_rate.is_dsss_cck() {
            return Ok(false);
        }
        if flow.is_operational() {
            let mut out = Outbox::default();
            flow.finalize_candidate(&self.config, &mut out);
            flow.flush_early_queue(&self.config, &mut out);
            self.dispatch(&flow, out);
        }
        Ok(flow.is_quiescent())
    }

    /// Performs a flow operation's side effects. Must be called without any flow lock held.
    fn dispatch(&self, flow: &Flow, out: Outbox) {
        let Outbox { sends, singles, completions, throttle } = out;
        for (frame, acked) in completions {
            self.complete(frame, acked);
        }
        for frame in singles {
            self.retire_in_flight();
            let send = self.transmitter.send(TxUnit::Mpdu(frame), flow.queue(), TxFlags::NONE);
            if let Err(e) = send {
                error!("{}: singleton send failed: {}", flow.id(), e);
            }
        }
        for (unit, flags) in sends {
            let manifest = match &unit {
                TxUnit::Ampdu(ampdu) => ampdu.manifest.clone(),
                TxUnit::Mpdu(_) => vec![],
            };
            if let Err(e) = self.transmitter.send(unit, flow.queue(), flags) {
                error!("{}: aggregate of {} send failed: {}", flow.id(), manifest.len(), e);
                flow.on_aggregate_sent(&manifest[..], None);
            }
        }
        if let Some(enabled) = throttle {
            self.transmitter.set_queue_throttle(flow.queue(), enabled);
        }
    }

    fn complete(&self, frame: Frame, acked: bool) {
        self.retire_in_flight();
        if frame.is_directly_acked() {
            debug!("ssn {} completed after early acknowledgement (acked {})", frame.ssn(), acked);
            return;
        }
        self.completion_sink.notify(frame, acked);
    }

    fn retire_in_flight(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if let Some(thresholds) = self.config.directly_ack {
            if previous.saturating_sub(1) < thresholds.low
                && !self.directly_ack.swap(true, Ordering::SeqCst)
            {
                info!("{} frames in flight; acknowledging early again", previous.saturating_sub(1));
            }
        }
    }
}
