// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per station and TID aggregation state.
//!
//! A `Flow` owns a block-ack window and the queues feeding it. Aggregation, block-ack processing
//! and retries only run while the flow is `Operational`; the lifecycle operations here move it
//! between states and tear it down.
//!
//! Locks are always taken in this order: `candidate`, `control`, `pending`, `early`, `window`,
//! `retry`. No lock is held while calling into the transmit backend or the completion sink; work
//! for them is collected in an `Outbox` and dispatched by the device once every lock is released.

use {
    crate::{
        aggregate::Aggregate,
        config::AmpduConfig,
        device::{QueueId, TxFlags, TxUnit},
        frame::{Frame, FrameHandle, StationId, TxStatus},
        sequence::SeqNum,
        stats::FlowStats,
        window::{BlockAckWindow, WindowStatus},
    },
    log::{debug, info},
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    std::{
        collections::VecDeque,
        fmt,
        sync::atomic::{AtomicBool, Ordering},
        time::Instant,
    },
};

/// Number of QoS traffic identifiers with user priority semantics.
pub const WMM_TID_NUM: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId {
    pub station: StationId,
    pub tid: u8,
}

impl FlowId {
    pub fn new(station: StationId, tid: u8) -> Self {
        Self { station, tid }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sta {} tid {}", self.station, self.tid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    Stop,
    Start,
    Operational,
}

pub(crate) struct FlowControl {
    pub state: FlowState,
    pub max_aggregate_count: usize,
    pub aead: bool,
}

/// Parameters of an operational flow, copied out of `FlowControl` for one unit of work.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlowParams {
    pub max_aggregate_count: usize,
    /// Bytes added to each MPDU on air beyond its buffer.
    pub mpdu_overhead: usize,
}

/// Finalized aggregates waiting for window space.
#[derive(Default)]
pub(crate) struct EarlyQueue {
    pub aggregates: VecDeque<Aggregate>,
    pub frame_count: usize,
    pub throttled: bool,
}

/// Side effects of a flow operation, performed by the device after the flow's locks are released.
#[derive(Default)]
pub(crate) struct Outbox {
    pub sends: Vec<(TxUnit, TxFlags)>,
    /// Frames that left aggregation and go out as singletons.
    pub singles: Vec<Frame>,
    pub completions: Vec<(Frame, bool)>,
    pub throttle: Option<bool>,
}

impl Outbox {
    /// Queues retired frames for completion. Only `Done` frames count as acknowledged.
    pub fn complete(&mut self, frames: Vec<Frame>) {
        self.completions.extend(frames.into_iter().map(|frame| {
            let acked = frame.status() == TxStatus::Done;
            (frame, acked)
        }));
    }

    /// Queues frames for completion as failed.
    pub fn fail(&mut self, frames: impl IntoIterator<Item = Frame>) {
        self.completions.extend(frames.into_iter().map(|mut frame| {
            frame.set_status(TxStatus::Dropped);
            (frame, false)
        }));
    }

    pub fn aggregate_count(&self) -> usize {
        self.sends.iter().filter(|(unit, _)| matches!(unit, TxUnit::Ampdu(_))).count()
    }
}

pub struct Flow {
    pub(crate) id: FlowId,
    pub(crate) queue: QueueId,
    pub(crate) candidate: Mutex<Option<Aggregate>>,
    pub(crate) control: Mutex<FlowControl>,
    // Mirrors `control.state == Operational` for code already holding later locks.
    operational: AtomicBool,
    pub(crate) pending: Mutex<VecDeque<Frame>>,
    pub(crate) early: Mutex<EarlyQueue>,
    pub(crate) window: Mutex<BlockAckWindow>,
    pub(crate) retry: Mutex<VecDeque<FrameHandle>>,
    pub(crate) stats: FlowStats,
}

impl Flow {
    pub fn new(id: FlowId, queue: QueueId) -> Self {
        Self {
            id,
            queue,
            candidate: Mutex::new(None),
            control: Mutex::new(FlowControl {
                state: FlowState::Stop,
                max_aggregate_count: 0,
                aead: false,
            }),
            operational: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            early: Mutex::new(EarlyQueue::default()),
            window: Mutex::new(BlockAckWindow::new()),
            retry: Mutex::new(VecDeque::new()),
            stats: FlowStats::default(),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn state(&self) -> FlowState {
        self.control.lock().state
    }

    pub(crate) fn is_operational(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
    }

    /// Returns the parameters for one unit of work, or `None` unless the flow is operational.
    pub(crate) fn params(&self, config: &AmpduConfig) -> Option<FlowParams> {
        let control = self.control.lock();
        if control.state != FlowState::Operational {
            return None;
        }
        Some(FlowParams {
            max_aggregate_count: control.max_aggregate_count,
            mpdu_overhead: if control.aead { config.aead_mic_len } else { 0 },
        })
    }

    pub(crate) fn set_aead(&self, aead: bool) {
        self.control.lock().aead = aead;
    }

    /// Prepares the flow for a new block-ack session.
    ///
    /// Returns `false` if the flow was already started.
    pub(crate) fn start(&self) -> Result<bool, FlowState> {
        let mut control = self.control.lock();
        match control.state {
            FlowState::Start => return Ok(false),
            FlowState::Operational => return Err(FlowState::Operational),
            FlowState::Stop => {}
        }
        self.pending.lock().clear();
        *self.early.lock() = EarlyQueue::default();
        *self.window.lock() = BlockAckWindow::new();
        self.retry.lock().clear();
        self.stats.reset();
        control.state = FlowState::Start;
        info!("AMPDU {} started", self.id);
        Ok(true)
    }

    /// Applies the negotiated block-ack buffer size and enables aggregation.
    pub(crate) fn operational(
        &self,
        buffer_size: u16,
        config: &AmpduConfig,
    ) -> Result<(), FlowState> {
        let mut control = self.control.lock();
        if control.state == FlowState::Stop {
            return Err(FlowState::Stop);
        }
        let mut window = self.window.lock();
        window.set_size(buffer_size);
        control.max_aggregate_count = config.max_aggregate_count.min(window.size() as usize);
        control.state = FlowState::Operational;
        self.operational.store(true, Ordering::SeqCst);
        info!(
            "AMPDU {} operational: window {}, max aggregate {}",
            self.id,
            window.size(),
            control.max_aggregate_count
        );
        Ok(())
    }

    /// Tears the flow down, failing every frame it still holds exactly once.
    ///
    /// Returns `false` if the flow was already stopped.
    pub(crate) fn stop(&self, out: &mut Outbox) -> bool {
        {
            let mut control = self.control.lock();
            if control.state == FlowState::Stop {
                return false;
            }
            control.state = FlowState::Stop;
            self.operational.store(false, Ordering::SeqCst);
        }

        let mut candidate = self.candidate.lock();
        let mut pending = self.pending.lock();
        let mut early = self.early.lock();
        let mut window = self.window.lock();
        let mut retry = self.retry.lock();

        window.drop_outstanding();
        let released = window.release_in_order();
        let mut discarded = released.len();
        out.complete(released);

        discarded += pending.len();
        out.fail(pending.drain(..));

        let retried: Vec<Frame> =
            retry.drain(..).filter_map(|handle| window.take(handle)).collect();
        discarded += retried.len();
        out.fail(retried);
        let remaining = window.drain();
        discarded += remaining.len();
        out.fail(remaining);

        for aggregate in early.aggregates.drain(..) {
            let frames = aggregate.into_frames();
            discarded += frames.len();
            out.fail(frames);
        }
        early.frame_count = 0;
        early.throttled = false;

        if let Some(aggregate) = candidate.take() {
            let frames = aggregate.into_frames();
            discarded += frames.len();
            out.fail(frames);
        }

        out.throttle = Some(false);
        self.stats.record_discards(discarded);
        info!("AMPDU {} stopped; {} frames discarded", self.id, discarded);
        true
    }

    /// Queues a frame for aggregation. The frame is handed back unless the flow is operational.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<(), Frame> {
        let control = self.control.lock();
        if control.state != FlowState::Operational {
            return Err(frame);
        }
        self.pending.lock().push_back(frame);
        Ok(())
    }

    /// Stamps the frames of an aggregate the backend put on air.
    pub(crate) fn on_aggregate_sent(&self, manifest: &[SeqNum], at: Option<Instant>) {
        let mut window = self.window.lock();
        if !self.is_operational() {
            return;
        }
        for &ssn in manifest {
            match window.get_mut(ssn) {
                Some(frame) if frame.status() == TxStatus::Aggregated => frame.mark_sent(at),
                Some(frame) => {
                    debug!("{} ssn {} reported sent in status {:?}", self.id, ssn, frame.status())
                }
                None => debug!("{} ssn {} reported sent but is not in window", self.id, ssn),
            }
        }
    }

    /// Returns true if the flow holds no frames at all.
    pub(crate) fn is_quiescent(&self) -> bool {
        let candidate = self.candidate.lock();
        let pending = self.pending.lock();
        let early = self.early.lock();
        let window = self.window.lock();
        let retry = self.retry.lock();
        candidate.as_ref().map_or(true, Aggregate::is_empty)
            && pending.is_empty()
            && early.aggregates.is_empty()
            && window.is_empty()
            && retry.is_empty()
    }

    pub(crate) fn window_status(&self) -> WindowStatus {
        self.window.lock().status()
    }
}

/// Backend queue serving a TID, following the WMM user priority to access category mapping.
pub fn queue_for_tid(tid: u8) -> QueueId {
    match tid % WMM_TID_NUM {
        1 | 2 => QueueId::BK,
        4 | 5 => QueueId::VI,
        6 | 7 => QueueId::VO,
        _ => QueueId::BE,
    }
}
